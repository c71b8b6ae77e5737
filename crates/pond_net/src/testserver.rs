//! In-process servers for exercising the worker and transfer loops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use pond_crypto::SecureRng;
use pond_proto::url::format_server;
use pond_proto::wire::{self, Reply, Request};

use crate::session::Session;

pub(crate) struct TestServer {
    pub url: String,
    /// Requests received, with the identity each client presented.
    pub requests: Arc<Mutex<Vec<(Request, [u8; 32])>>>,
}

impl TestServer {
    /// One-request-one-reply server, the shape of every worker transaction.
    pub(crate) async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::spawn_raw(move |mut session, client, requests| {
            let handler = handler.clone();
            Box::pin(async move {
                let Ok(frame) = session.read_framed().await else {
                    return;
                };
                let Ok(request) = wire::decode::<Request>(&frame) else {
                    return;
                };
                let reply = (*handler)(&request);
                requests.lock().await.push((request, client));
                let _ = session.write_framed(&wire::encode(&reply)).await;
            })
        })
        .await
    }

    /// Full control over the established session, for transfer streams.
    pub(crate) async fn spawn_raw<F>(handler: F) -> Self
    where
        F: Fn(
                Session<TcpStream>,
                [u8; 32],
                Arc<Mutex<Vec<(Request, [u8; 32])>>>,
            ) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let rng = SecureRng::default();
        let secret_bytes = rng.random_array::<32>();
        let public = PublicKey::from(&StaticSecret::from(secret_bytes)).to_bytes();
        let url = format_server(&public, &format!("localhost:{port}"));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let secret = StaticSecret::from(secret_bytes);
                let recorded = recorded.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let rng = SecureRng::default();
                    let Ok((session, client)) =
                        Session::server_handshake(stream, &secret, &rng).await
                    else {
                        return;
                    };
                    (*handler)(session, client, recorded).await;
                });
            }
        });

        TestServer { url, requests }
    }
}
