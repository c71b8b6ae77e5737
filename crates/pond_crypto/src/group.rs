//! Short group signatures with revocation.
//!
//! Boneh-Boyen-Shacham signatures over BLS12-381. Any member of the group
//! can sign a digest; the signature verifies against the group public key
//! without identifying the signer, and only the group owner (who holds the
//! opening trapdoor) can extract the signer's tag.
//!
//! Membership: A = g1·1/(γ+x). Revoking the member (x*, A*) publishes
//! (x*, A* = new g1, ĝ2 = g2·1/(γ+x*)); anyone can move the group public
//! key to the new generation, and every surviving member re-derives
//!
//!   A' = (A − A*)·1/(x* − x)
//!
//! which fails exactly for the revoked member (x = x*). Member tags change
//! across an update, so callers record the old tag before applying one.
//!
//! The opening trapdoor (ξ1, ξ2) and the blinding bases (h, u, v) are
//! untouched by updates: a signature made under an older generation still
//! opens under the current private key, yielding the tag the member had
//! when it signed.

use ark_bls12_381::{Bls12_381, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::pairing::{Pairing, PairingOutput};
use ark_ec::{CurveGroup, Group as _};
use ark_ff::{Field, PrimeField, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::rng::SecureRng;

/// Opaque member identifier recovered by [`GroupPrivateKey::open`]. Equal to
/// the compressed membership point, so it changes when the member key is
/// updated against a revocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Tag(Vec<u8>);

impl Tag {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Public group parameters: verification accepts signatures from any
/// current member.
#[derive(Clone, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct GroupPublicKey {
    g1: G1Affine,
    g2: G2Affine,
    h: G1Affine,
    u: G1Affine,
    v: G1Affine,
    w: G2Affine,
}

/// The group owner's key: issues members, opens signatures, generates
/// revocations.
#[derive(Clone, CanonicalSerialize, CanonicalDeserialize)]
pub struct GroupPrivateKey {
    group: GroupPublicKey,
    gamma: Fr,
    xi1: Fr,
    xi2: Fr,
}

/// A member's signing credential, bound to one generation of the group.
#[derive(Clone, CanonicalSerialize, CanonicalDeserialize)]
pub struct MemberKey {
    group: GroupPublicKey,
    a: G1Affine,
    x: Fr,
}

/// An anonymous signature over a 32-byte digest.
#[derive(Clone, CanonicalSerialize, CanonicalDeserialize)]
pub struct GroupSignature {
    t1: G1Affine,
    t2: G1Affine,
    t3: G1Affine,
    c: Fr,
    s_alpha: Fr,
    s_beta: Fr,
    s_x: Fr,
    s_delta1: Fr,
    s_delta2: Fr,
}

/// Public token that moves a group (and every surviving member) to the next
/// generation while excluding one member.
#[derive(Clone, CanonicalSerialize, CanonicalDeserialize)]
pub struct Revocation {
    x: Fr,
    a: G1Affine,
    g2: G2Affine,
}

fn rand_nonzero(rng: &mut ChaCha20Rng) -> Fr {
    loop {
        let x = Fr::rand(rng);
        if !x.is_zero() {
            return x;
        }
    }
}

fn compress_g1(p: &G1Affine) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    p.serialize_compressed(&mut out).expect("compress G1");
    out
}

fn challenge(
    digest: &[u8],
    t: [&G1Affine; 3],
    r1: &G1Affine,
    r2: &G1Affine,
    r3: &PairingOutput<Bls12_381>,
    r4: &G1Affine,
    r5: &G1Affine,
) -> Fr {
    let mut hasher = Sha256::new();
    hasher.update(digest);
    let mut buf = Vec::new();
    for p in t {
        p.serialize_compressed(&mut buf).expect("compress");
    }
    r1.serialize_compressed(&mut buf).expect("compress");
    r2.serialize_compressed(&mut buf).expect("compress");
    r3.serialize_compressed(&mut buf).expect("compress");
    r4.serialize_compressed(&mut buf).expect("compress");
    r5.serialize_compressed(&mut buf).expect("compress");
    hasher.update(&buf);
    Fr::from_le_bytes_mod_order(&hasher.finalize())
}

impl GroupPrivateKey {
    pub fn generate(rng: &SecureRng) -> Self {
        rng.with_rng(|r| {
            let gamma = rand_nonzero(r);
            let xi1 = rand_nonzero(r);
            let xi2 = rand_nonzero(r);

            let g1 = G1Projective::generator();
            let g2 = G2Projective::generator();
            let h = g1 * rand_nonzero(r);
            let u = h * xi1.inverse().expect("nonzero");
            let v = h * xi2.inverse().expect("nonzero");
            let w = g2 * gamma;

            GroupPrivateKey {
                group: GroupPublicKey {
                    g1: g1.into_affine(),
                    g2: g2.into_affine(),
                    h: h.into_affine(),
                    u: u.into_affine(),
                    v: v.into_affine(),
                    w: w.into_affine(),
                },
                gamma,
                xi1,
                xi2,
            }
        })
    }

    pub fn group(&self) -> &GroupPublicKey {
        &self.group
    }

    /// Issues a credential for a new member of the current generation.
    pub fn new_member(&self, rng: &SecureRng) -> MemberKey {
        rng.with_rng(|r| loop {
            let x = rand_nonzero(r);
            if let Some(inv) = (self.gamma + x).inverse() {
                return MemberKey {
                    group: self.group.clone(),
                    a: (self.group.g1 * inv).into_affine(),
                    x,
                };
            }
        })
    }

    pub fn verify(&self, digest: &[u8], sig: &GroupSignature) -> bool {
        self.group.verify(digest, sig)
    }

    /// Recovers the signer's membership tag. Works for signatures made under
    /// any generation, returning the tag the signer held at signing time.
    pub fn open(&self, sig: &GroupSignature) -> Tag {
        let a = G1Projective::from(sig.t3) - sig.t1 * self.xi1 - sig.t2 * self.xi2;
        Tag(compress_g1(&a.into_affine()))
    }

    /// Builds the revocation token for `member` against the current
    /// generation. Applying it is a separate step — see
    /// [`GroupPrivateKey::update`] and [`MemberKey::update`].
    pub fn generate_revocation(&self, member: &MemberKey) -> Result<Revocation, CryptoError> {
        let inv = (self.gamma + member.x)
            .inverse()
            .ok_or(CryptoError::DegenerateGroup)?;
        Ok(Revocation {
            x: member.x,
            a: (self.group.g1 * inv).into_affine(),
            g2: (self.group.g2 * inv).into_affine(),
        })
    }

    pub fn update(&mut self, revocation: &Revocation) {
        self.group.update(revocation);
    }
}

impl GroupPublicKey {
    pub fn verify(&self, digest: &[u8], sig: &GroupSignature) -> bool {
        let e_t3_g2 = Bls12_381::pairing(sig.t3, self.g2);
        let e_h_w = Bls12_381::pairing(self.h, self.w);
        let e_h_g2 = Bls12_381::pairing(self.h, self.g2);
        let e_t3_w = Bls12_381::pairing(sig.t3, self.w);
        let e_g1_g2 = Bls12_381::pairing(self.g1, self.g2);

        let r1 = (self.u * sig.s_alpha - sig.t1 * sig.c).into_affine();
        let r2 = (self.v * sig.s_beta - sig.t2 * sig.c).into_affine();
        let r3 = e_t3_g2 * sig.s_x - e_h_w * (sig.s_alpha + sig.s_beta)
            - e_h_g2 * (sig.s_delta1 + sig.s_delta2)
            + (e_t3_w - e_g1_g2) * sig.c;
        let r4 = (sig.t1 * sig.s_x - self.u * sig.s_delta1).into_affine();
        let r5 = (sig.t2 * sig.s_x - self.v * sig.s_delta2).into_affine();

        challenge(digest, [&sig.t1, &sig.t2, &sig.t3], &r1, &r2, &r3, &r4, &r5) == sig.c
    }

    /// Advances the public parameters past a revocation. Anyone holding the
    /// token can do this; no secret is required.
    pub fn update(&mut self, revocation: &Revocation) {
        // w' = γ·ĝ2 = g2 − x*·ĝ2, since g2 = (γ+x*)·ĝ2.
        let w = G2Projective::from(self.g2) - revocation.g2 * revocation.x;
        self.g1 = revocation.a;
        self.g2 = revocation.g2;
        self.w = w.into_affine();
    }
}

impl MemberKey {
    pub fn group(&self) -> &GroupPublicKey {
        &self.group
    }

    /// The member's current tag, as [`GroupPrivateKey::open`] would recover
    /// it from a signature made now.
    pub fn tag(&self) -> Tag {
        Tag(compress_g1(&self.a))
    }

    /// Signs a digest anonymously on behalf of the group.
    pub fn sign(&self, digest: &[u8], rng: &SecureRng) -> GroupSignature {
        rng.with_rng(|r| {
            let alpha = Fr::rand(r);
            let beta = Fr::rand(r);
            let delta1 = self.x * alpha;
            let delta2 = self.x * beta;

            let t1 = (self.group.u * alpha).into_affine();
            let t2 = (self.group.v * beta).into_affine();
            let t3 = (G1Projective::from(self.a) + self.group.h * (alpha + beta)).into_affine();

            let r_alpha = Fr::rand(r);
            let r_beta = Fr::rand(r);
            let r_x = Fr::rand(r);
            let r_delta1 = Fr::rand(r);
            let r_delta2 = Fr::rand(r);

            let r1 = (self.group.u * r_alpha).into_affine();
            let r2 = (self.group.v * r_beta).into_affine();
            let r3 = Bls12_381::pairing(t3, self.group.g2) * r_x
                - Bls12_381::pairing(self.group.h, self.group.w) * (r_alpha + r_beta)
                - Bls12_381::pairing(self.group.h, self.group.g2) * (r_delta1 + r_delta2);
            let r4 = (t1 * r_x - self.group.u * r_delta1).into_affine();
            let r5 = (t2 * r_x - self.group.v * r_delta2).into_affine();

            let c = challenge(digest, [&t1, &t2, &t3], &r1, &r2, &r3, &r4, &r5);

            GroupSignature {
                t1,
                t2,
                t3,
                c,
                s_alpha: r_alpha + c * alpha,
                s_beta: r_beta + c * beta,
                s_x: r_x + c * self.x,
                s_delta1: r_delta1 + c * delta1,
                s_delta2: r_delta2 + c * delta2,
            }
        })
    }

    /// Re-derives this credential for the generation after `revocation`.
    /// Returns false exactly when this member is the one being revoked; the
    /// credential is left unchanged in that case.
    pub fn update(&mut self, revocation: &Revocation) -> bool {
        if self.x == revocation.x {
            return false;
        }
        let Some(inv) = (revocation.x - self.x).inverse() else {
            return false;
        };
        self.a = ((G1Projective::from(self.a) - G1Projective::from(revocation.a)) * inv)
            .into_affine();
        self.group.update(revocation);
        true
    }
}

macro_rules! impl_bytes_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut out = Vec::new();
                self.serialize_compressed(&mut out).expect("serialize");
                out
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
                <$ty>::deserialize_compressed(bytes).map_err(|_| CryptoError::GroupDecode)
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_bytes(&self.to_bytes())
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let bytes: Vec<u8> = serde::Deserialize::deserialize(de)?;
                <$ty>::from_bytes(&bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_bytes_codec!(GroupPublicKey);
impl_bytes_codec!(GroupPrivateKey);
impl_bytes_codec!(MemberKey);
impl_bytes_codec!(GroupSignature);
impl_bytes_codec!(Revocation);
