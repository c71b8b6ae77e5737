//! The network transaction engine.
//!
//! One long-running task owns every fetch and send. Between transactions it
//! waits for the earliest of a fetch-now signal, a Poisson-distributed
//! timer, or a revocation update — and revocation updates are always
//! drained before anything else, so a re-signed message is never
//! transmitted under a stale generation.
//!
//! Transactions look identical from outside: dial through the proxy, write
//! one request, read one reply, hang up. When the queue is empty the
//! transaction is a fetch from the home server under the real identity;
//! deliveries go out under a fresh random identity so the two are not
//! linkable.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use x25519_dalek::StaticSecret;

use pond_crypto::SecureRng;
use pond_proto::wire::{Request, Status};

use crate::dial::{dial_server, random_identity, roundtrip, DialConfig};
use crate::events::{MessageSendResult, NewMessage, RevocationUpdate};
use crate::queue::SharedQueue;

/// Mean seconds between transactions: an exponential inter-arrival time
/// makes our polling indistinguishable from unrelated cover traffic.
pub const TRANSACTION_MEAN_SECS: f64 = 300.0;
/// Testing profile polls fast enough for integration tests.
pub const TESTING_MEAN_SECS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub home_server: String,
    pub dial: DialConfig,
    pub auto_fetch: bool,
    pub transaction_mean_secs: f64,
}

impl WorkerConfig {
    pub fn new(home_server: String, dial: DialConfig, auto_fetch: bool) -> Self {
        let transaction_mean_secs = if dial.testing {
            TESTING_MEAN_SECS
        } else {
            TRANSACTION_MEAN_SECS
        };
        Self {
            home_server,
            dial,
            auto_fetch,
            transaction_mean_secs,
        }
    }
}

pub struct NetworkWorker {
    config: WorkerConfig,
    identity: StaticSecret,
    queue: SharedQueue,
    rng: std::sync::Arc<SecureRng>,
    revocation_rx: mpsc::UnboundedReceiver<RevocationUpdate>,
    fetch_now_rx: mpsc::Receiver<oneshot::Sender<()>>,
    new_message_tx: mpsc::Sender<NewMessage>,
    sent_tx: mpsc::Sender<MessageSendResult>,
}

impl NetworkWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        identity: StaticSecret,
        queue: SharedQueue,
        rng: std::sync::Arc<SecureRng>,
        revocation_rx: mpsc::UnboundedReceiver<RevocationUpdate>,
        fetch_now_rx: mpsc::Receiver<oneshot::Sender<()>>,
        new_message_tx: mpsc::Sender<NewMessage>,
        sent_tx: mpsc::Sender<MessageSendResult>,
    ) -> Self {
        Self {
            config,
            identity,
            queue,
            rng,
            revocation_rx,
            fetch_now_rx,
            new_message_tx,
            sent_tx,
        }
    }

    /// Exponential inter-arrival delay: `−mean · ln(U)`.
    fn next_delay(&self) -> Duration {
        let u = 1.0 - self.rng.random_f64();
        Duration::from_secs_f64(-self.config.transaction_mean_secs * u.ln())
    }

    pub async fn run(mut self) {
        let mut startup = true;
        let mut fetch_ack: Option<oneshot::Sender<()>> = None;

        loop {
            if !startup || !self.config.auto_fetch {
                if let Some(ack) = fetch_ack.take() {
                    let _ = ack.send(());
                }

                let delay = self.config.auto_fetch.then(|| self.next_delay());
                if let Some(d) = &delay {
                    debug!(seconds = d.as_secs(), "next network transaction");
                }
                let timer = async move {
                    match delay {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::pin!(timer);

                loop {
                    // Revocation updates are processed before anything else
                    // and never trigger a transaction themselves.
                    match self.revocation_rx.try_recv() {
                        Ok(update) => {
                            self.queue.resign(&update, &self.rng);
                            continue;
                        }
                        Err(mpsc::error::TryRecvError::Disconnected) => return,
                        Err(mpsc::error::TryRecvError::Empty) => {}
                    }

                    tokio::select! {
                        biased;
                        update = self.revocation_rx.recv() => match update {
                            Some(update) => {
                                self.queue.resign(&update, &self.rng);
                                continue;
                            }
                            None => return,
                        },
                        request = self.fetch_now_rx.recv() => match request {
                            Some(ack) => {
                                info!("starting fetch because of fetch-now signal");
                                fetch_ack = Some(ack);
                                break;
                            }
                            None => return,
                        },
                        _ = &mut timer => {
                            info!("starting fetch because of timer");
                            break;
                        }
                    }
                }
            }
            startup = false;

            self.transact().await;
        }
    }

    async fn transact(&mut self) {
        let head = self.queue.rotate_head();
        let (request, server, anonymous) = match &head {
            None => {
                info!("starting fetch from home server");
                (Request::Fetch, self.config.home_server.clone(), false)
            }
            Some(m) => {
                info!(server = %m.server, "starting message transmission");
                // Deliveries must not be linkable to our mailbox identity;
                // revocations are signed by it anyway.
                (m.request.clone(), m.server.clone(), !m.revocation)
            }
        };
        let is_fetch = head.is_none();

        let identity = if anonymous {
            random_identity(&self.rng)
        } else {
            StaticSecret::from(self.identity.to_bytes())
        };

        let mut session = match dial_server(&self.config.dial, &server, &identity, &self.rng).await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(%server, error = %e, "failed to connect");
                return;
            }
        };
        let reply = match roundtrip(&mut session, &request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%server, error = %e, "transaction failed");
                return;
            }
        };

        match reply.status {
            Status::Ok => {
                if is_fetch {
                    if reply.fetched.is_some() || reply.announce.is_some() {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        let event = NewMessage {
                            fetched: reply.fetched,
                            announce: reply.announce,
                            ack: ack_tx,
                        };
                        if self.new_message_tx.send(event).await.is_err() {
                            return;
                        }
                        // Block until the state owner is done, so messages
                        // reach it strictly in wire order.
                        let _ = ack_rx.await;
                    }
                } else if let Some(head) = head {
                    self.queue.remove(head.id);
                    let _ = self
                        .sent_tx
                        .send(MessageSendResult {
                            id: head.id,
                            revocation: None,
                        })
                        .await;
                }
            }
            Status::GenerationRevoked if !is_fetch && reply.revocation.is_some() => {
                // The message stays queued; the revocation handler decides
                // whether it can be re-signed or must be dropped.
                if let Some(head) = head {
                    let _ = self
                        .sent_tx
                        .send(MessageSendResult {
                            id: head.id,
                            revocation: reply.revocation,
                        })
                        .await;
                }
            }
            status => {
                warn!(%server, ?status, "error from server");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver::TestServer;
    use pond_proto::wire::{Fetched, Reply};

    fn worker_channels() -> (
        mpsc::UnboundedSender<RevocationUpdate>,
        mpsc::UnboundedReceiver<RevocationUpdate>,
        mpsc::Sender<oneshot::Sender<()>>,
        mpsc::Receiver<oneshot::Sender<()>>,
        mpsc::Sender<NewMessage>,
        mpsc::Receiver<NewMessage>,
        mpsc::Sender<MessageSendResult>,
        mpsc::Receiver<MessageSendResult>,
    ) {
        let (rev_tx, rev_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (new_tx, new_rx) = mpsc::channel(1);
        let (sent_tx, sent_rx) = mpsc::channel(16);
        (
            rev_tx, rev_rx, fetch_tx, fetch_rx, new_tx, new_rx, sent_tx, sent_rx,
        )
    }

    #[tokio::test]
    async fn sends_queued_delivery_under_anonymous_identity() {
        let rng = std::sync::Arc::new(SecureRng::from_seed([60; 32]));
        let server = TestServer::spawn(|_| Reply::ok()).await;

        let queue = SharedQueue::new();
        queue.enqueue(crate::queue::QueuedMessage {
            id: 7,
            to: 1,
            server: server.url.clone(),
            revocation: false,
            request: Request::Deliver {
                to: [1; 32],
                signature: vec![0; 8],
                generation: 0,
                message: vec![0xab; 32],
            },
            created: 0,
        });

        let (_rev_tx, rev_rx, _fetch_tx, fetch_rx, new_tx, _new_rx, sent_tx, mut sent_rx) =
            worker_channels();

        let identity = StaticSecret::from(rng.random_array::<32>());
        let our_public = crate::dial::identity_public(&identity);

        let config = WorkerConfig::new(
            server.url.clone(),
            DialConfig {
                testing: true,
                ..DialConfig::default()
            },
            true,
        );
        let worker = NetworkWorker::new(
            config,
            identity,
            queue.clone(),
            rng,
            rev_rx,
            fetch_rx,
            new_tx,
            sent_tx,
        );
        let handle = tokio::spawn(worker.run());

        // Startup transaction: the queued delivery goes out first.
        let sent = sent_rx.recv().await.expect("send result");
        assert_eq!(sent.id, 7);
        assert!(sent.revocation.is_none());
        assert!(queue.is_empty());

        let (request, presented) = server.requests.lock().await.remove(0);
        assert!(matches!(request, Request::Deliver { .. }));
        assert_ne!(presented, our_public, "deliveries must be unlinkable");

        handle.abort();
    }

    #[tokio::test]
    async fn fetch_now_fetches_and_hands_off_in_order() {
        let rng = std::sync::Arc::new(SecureRng::from_seed([61; 32]));
        let server = TestServer::spawn(|request| match request {
            Request::Fetch => {
                let mut reply = Reply::ok();
                reply.fetched = Some(Fetched {
                    signature: vec![1, 2],
                    message: vec![3, 4, 5],
                });
                reply
            }
            _ => Reply::ok(),
        })
        .await;

        let queue = SharedQueue::new();
        let (_rev_tx, rev_rx, fetch_tx, fetch_rx, new_tx, mut new_rx, sent_tx, _sent_rx) =
            worker_channels();

        let identity = StaticSecret::from(rng.random_array::<32>());
        let our_public = crate::dial::identity_public(&identity);

        // auto_fetch off: only the explicit signal triggers a transaction.
        let mut config = WorkerConfig::new(
            server.url.clone(),
            DialConfig {
                testing: true,
                ..DialConfig::default()
            },
            false,
        );
        config.transaction_mean_secs = 0.001;
        let worker = NetworkWorker::new(
            config,
            identity,
            queue,
            rng,
            rev_rx,
            fetch_rx,
            new_tx,
            sent_tx,
        );
        let handle = tokio::spawn(worker.run());

        let (done_tx, done_rx) = oneshot::channel();
        fetch_tx.send(done_tx).await.unwrap();

        let event = new_rx.recv().await.expect("new message event");
        let fetched = event.fetched.expect("fetched body");
        assert_eq!(fetched.message, vec![3, 4, 5]);
        event.ack.send(()).unwrap();

        // The fetch-now ack arrives only after the transaction finished.
        done_rx.await.expect("fetch-now ack");

        let (request, presented) = server.requests.lock().await.remove(0);
        assert!(matches!(request, Request::Fetch));
        assert_eq!(presented, our_public, "fetches use the real identity");

        handle.abort();
    }

    #[tokio::test]
    async fn generation_revoked_keeps_the_message_queued() {
        let rng = std::sync::Arc::new(SecureRng::from_seed([62; 32]));
        let server = TestServer::spawn(|_| {
            let mut reply = Reply::with_status(Status::GenerationRevoked);
            reply.revocation = Some(pond_proto::wire::SignedRevocation {
                revocation: pond_proto::wire::RevocationBundle {
                    revocation: vec![9; 4],
                    generation: 2,
                },
                signature: vec![0; 64],
            });
            reply
        })
        .await;

        let queue = SharedQueue::new();
        queue.enqueue(crate::queue::QueuedMessage {
            id: 9,
            to: 2,
            server: server.url.clone(),
            revocation: false,
            request: Request::Deliver {
                to: [2; 32],
                signature: vec![0; 8],
                generation: 1,
                message: vec![0xcd; 16],
            },
            created: 0,
        });

        let (_rev_tx, rev_rx, _fetch_tx, fetch_rx, new_tx, _new_rx, sent_tx, mut sent_rx) =
            worker_channels();
        let identity = StaticSecret::from(rng.random_array::<32>());
        let config = WorkerConfig::new(
            server.url.clone(),
            DialConfig {
                testing: true,
                ..DialConfig::default()
            },
            true,
        );
        let worker = NetworkWorker::new(
            config,
            identity,
            queue.clone(),
            rng,
            rev_rx,
            fetch_rx,
            new_tx,
            sent_tx,
        );
        let handle = tokio::spawn(worker.run());

        let sent = sent_rx.recv().await.expect("send result");
        assert_eq!(sent.id, 9);
        assert!(sent.revocation.is_some());
        // Not removed: the revocation handler owns the next step.
        assert_eq!(queue.len(), 1);

        handle.abort();
    }

    #[test]
    fn poisson_delays_are_positive_and_vary() {
        let rng = std::sync::Arc::new(SecureRng::from_seed([63; 32]));
        let (_, rev_rx, _, fetch_rx, new_tx, _new_rx, sent_tx, _sent_rx) = {
            let (rev_tx, rev_rx) = mpsc::unbounded_channel();
            let (_fetch_tx, fetch_rx) = mpsc::channel(1);
            let (new_tx, new_rx) = mpsc::channel(1);
            let (sent_tx, sent_rx) = mpsc::channel(1);
            (rev_tx, rev_rx, _fetch_tx, fetch_rx, new_tx, new_rx, sent_tx, sent_rx)
        };
        let config = WorkerConfig::new(
            "pondserver://x@localhost".into(),
            DialConfig {
                testing: true,
                ..DialConfig::default()
            },
            true,
        );
        let worker = NetworkWorker::new(
            config,
            StaticSecret::from([1; 32]),
            SharedQueue::new(),
            rng,
            rev_rx,
            fetch_rx,
            new_tx,
            sent_tx,
        );

        let a = worker.next_delay();
        let b = worker.next_delay();
        assert!(a > Duration::ZERO);
        assert!(b > Duration::ZERO);
        assert_ne!(a, b);
    }
}
