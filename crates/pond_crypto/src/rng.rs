//! Process-wide CSPRNG.
//!
//! Every piece of protocol randomness — nonces, DH scalars, message ids,
//! anonymous connection identities, group-signature blinding factors — is
//! drawn from one `SecureRng` shared across tasks. Tests seed it for
//! reproducibility.

use std::sync::Mutex;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Cryptographically secure generator backed by ChaCha20, reseeded from the
/// operating system at construction.
#[derive(Debug)]
pub struct SecureRng {
    rng: Mutex<ChaCha20Rng>,
}

impl Default for SecureRng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }
}

impl SecureRng {
    #[cfg(any(test, feature = "test_utils"))]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
        }
    }

    pub fn fill_bytes(&self, out: &mut [u8]) {
        self.rng.lock().expect("rng lock").fill_bytes(out);
    }

    pub fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill_bytes(&mut out);
        out
    }

    /// Random non-zero u64, used for message and contact ids.
    pub fn random_id(&self) -> u64 {
        let mut rng = self.rng.lock().expect("rng lock");
        loop {
            let id = rng.next_u64();
            if id != 0 {
                return id;
            }
        }
    }

    /// Uniform in [0, 1), for sampling the transaction timer.
    pub fn random_f64(&self) -> f64 {
        self.rng.lock().expect("rng lock").gen::<f64>()
    }

    /// Runs `f` with exclusive access to the underlying generator, for APIs
    /// that want an `impl RngCore` (dalek and arkworks key generation).
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha20Rng) -> T) -> T {
        let mut rng = self.rng.lock().expect("rng lock");
        f(&mut rng)
    }
}
