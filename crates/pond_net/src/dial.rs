//! Dialing servers through the anonymizing proxy.
//!
//! Every connection goes through the local SOCKS5 proxy with a freshly
//! random username, so the proxy isolates our connections from one another.
//! Testing mode dials direct TCP so an in-process server works.

use data_encoding::BASE32;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use pond_crypto::SecureRng;
use pond_proto::url::parse_server;
use pond_proto::wire::{self, Reply, Request};

use crate::error::NetError;
use crate::session::Session;

/// Where we expect the local SOCKS proxy.
pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:9050";

#[derive(Debug, Clone)]
pub struct DialConfig {
    pub socks_addr: String,
    /// Direct TCP, relaxed URL checks.
    pub testing: bool,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            socks_addr: DEFAULT_SOCKS_ADDR.to_string(),
            testing: false,
        }
    }
}

pub trait NetStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> NetStream for T {}

/// A one-shot identity for delivery connections, so the server cannot link
/// them to our mailbox identity.
pub fn random_identity(rng: &SecureRng) -> StaticSecret {
    StaticSecret::from(rng.random_array::<32>())
}

pub fn identity_public(identity: &StaticSecret) -> [u8; 32] {
    PublicKey::from(identity).to_bytes()
}

/// Dials, handshakes, and returns an authenticated session to `server`.
pub async fn dial_server(
    config: &DialConfig,
    server: &str,
    identity: &StaticSecret,
    rng: &SecureRng,
) -> Result<Session<Box<dyn NetStream>>, NetError> {
    let (server_identity, addr) = parse_server(server, config.testing)?;

    let stream: Box<dyn NetStream> = if config.testing {
        Box::new(TcpStream::connect(&addr).await?)
    } else {
        let user = BASE32.encode(&rng.random_array::<8>());
        debug!(%addr, "dialing through proxy");
        Box::new(
            Socks5Stream::connect_with_password(
                config.socks_addr.as_str(),
                addr.as_str(),
                &user,
                "password",
            )
            .await?,
        )
    };

    Session::client_handshake(stream, identity, &server_identity, rng).await
}

/// Writes one request and reads one reply, the whole life of most
/// connections.
pub async fn roundtrip<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<S>,
    request: &Request,
) -> Result<Reply, NetError> {
    session.write_framed(&wire::encode(request)).await?;
    let reply_bytes = session.read_framed().await?;
    Ok(wire::decode::<Reply>(&reply_bytes)?)
}

/// Registers our identity and group with the home server.
///
/// Production mode first probes the proxy port with a plain TCP connect, so
/// a missing proxy is reported before any key material goes anywhere.
pub async fn create_account(
    config: &DialConfig,
    server: &str,
    identity: &StaticSecret,
    generation: u32,
    group: Vec<u8>,
    rng: &SecureRng,
) -> Result<(), NetError> {
    parse_server(server, config.testing)?;

    if !config.testing {
        let probe = TcpStream::connect(&config.socks_addr).await.map_err(|e| {
            NetError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to connect to local proxy: {e}"),
            ))
        })?;
        drop(probe);
    }

    let mut session = dial_server(config, server, identity, rng).await?;
    let reply = roundtrip(&mut session, &Request::NewAccount { generation, group }).await?;
    wire::reply_to_error(&reply)?;
    Ok(())
}
