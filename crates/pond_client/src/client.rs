//! The orchestrator: single owner of all client state.
//!
//! One task runs [`Client::run`], consuming events from the network worker
//! and background transfers; the send/receive/revocation operations mutate
//! state synchronously on that task. The only state shared with another
//! task is the outbound queue, behind its own mutex.
//!
//! Because unsealing (which advances the DH ratchet) and sending (which
//! reads the current DH) both execute here, the ratchet needs no locking;
//! the worker's re-signing touches group signatures only.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;
use x25519_dalek::StaticSecret;

use pond_crypto::{sha256, SecureRng};
use pond_net::dial::DialConfig;
use pond_net::transfer;
use pond_net::{
    MessageSendResult, NetError, NetworkWorker, NewMessage, QueuedMessage, RevocationUpdate,
    SharedQueue, TransferProgress, WorkerConfig,
};
use pond_proto::wire::{self, DetachmentRecord, Message, Request};
use pond_proto::{codec, url};

use crate::contact::KeyExchangeOutcome;
use crate::error::ClientError;
use crate::events::{ClientEvent, Indicator};
use crate::state::{OutboxMessage, State};

/// Highest envelope version we produce and advertise.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socks_addr: String,
    pub testing: bool,
    pub auto_fetch: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socks_addr: pond_net::DEFAULT_SOCKS_ADDR.to_string(),
            testing: false,
            auto_fetch: true,
        }
    }
}

impl ClientConfig {
    fn dial_config(&self) -> DialConfig {
        DialConfig {
            socks_addr: self.socks_addr.clone(),
            testing: self.testing,
        }
    }
}

/// Writes the state record to its encrypted container. The on-disk format
/// is not our concern; we only promise to call this after every mutation.
pub trait Persister: Send {
    fn save(&self, state: &State);
}

/// The pieces a caller wires up around a new client: the UI event stream
/// and the network worker, which wants its own task.
pub struct ClientParts {
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub worker: NetworkWorker,
}

/// A running background transfer. Dropping the handle does not cancel it.
pub struct DetachmentHandle {
    pub id: u64,
    cancel: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<Result<(), NetError>>,
}

impl DetachmentHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Provisions a fresh account: generates identity and group material, and
/// registers both with the chosen home server. The returned state is ready
/// to hand to [`Client::new`].
pub async fn create_account(
    config: &ClientConfig,
    server: String,
    rng: &Arc<SecureRng>,
) -> Result<State, ClientError> {
    let state = State::new(rng, server);
    pond_net::dial::create_account(
        &config.dial_config(),
        &state.identity.server,
        &StaticSecret::from(state.identity.secret.to_bytes()),
        state.generation,
        state.group_priv.group().to_bytes(),
        rng,
    )
    .await?;
    Ok(state)
}

pub struct Client {
    config: ClientConfig,
    pub state: State,
    queue: SharedQueue,
    rng: Arc<SecureRng>,
    persister: Box<dyn Persister>,
    pub(crate) revocation_tx: mpsc::UnboundedSender<RevocationUpdate>,
    fetch_now_tx: mpsc::Sender<oneshot::Sender<()>>,
    new_message_rx: mpsc::Receiver<NewMessage>,
    sent_rx: mpsc::Receiver<MessageSendResult>,
    progress_tx: mpsc::Sender<TransferProgress>,
    progress_rx: mpsc::Receiver<TransferProgress>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        state: State,
        persister: Box<dyn Persister>,
        rng: Arc<SecureRng>,
    ) -> (Self, ClientParts) {
        let queue = SharedQueue::new();
        let (revocation_tx, revocation_rx) = mpsc::unbounded_channel();
        let (fetch_now_tx, fetch_now_rx) = mpsc::channel(1);
        let (new_message_tx, new_message_rx) = mpsc::channel(1);
        let (sent_tx, sent_rx) = mpsc::channel(16);
        let (progress_tx, progress_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = NetworkWorker::new(
            WorkerConfig::new(
                state.identity.server.clone(),
                config.dial_config(),
                config.auto_fetch,
            ),
            StaticSecret::from(state.identity.secret.to_bytes()),
            queue.clone(),
            rng.clone(),
            revocation_rx,
            fetch_now_rx,
            new_message_tx,
            sent_tx,
        );

        let client = Client {
            config,
            state,
            queue,
            rng,
            persister,
            revocation_tx,
            fetch_now_tx,
            new_message_rx,
            sent_rx,
            progress_tx,
            progress_rx,
            events_tx,
        };
        (
            client,
            ClientParts {
                events: events_rx,
                worker,
            },
        )
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn rng(&self) -> &Arc<SecureRng> {
        &self.rng
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn save(&self) {
        self.persister.save(&self.state);
    }

    /// Consumes worker and transfer events until every channel closes.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                event = self.new_message_rx.recv() => match event {
                    Some(event) => self.process_new_message(event),
                    None => return,
                },
                result = self.sent_rx.recv() => match result {
                    Some(result) => self.process_send_result(result),
                    None => return,
                },
                progress = self.progress_rx.recv() => match progress {
                    Some(progress) => self.emit(ClientEvent::Transfer(progress)),
                    None => return,
                },
            }
        }
    }

    /// Asks the worker for an immediate poll; the returned receiver fires
    /// when the transaction has finished.
    pub async fn fetch_now(&self) -> Result<oneshot::Receiver<()>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.fetch_now_tx
            .send(tx)
            .await
            .map_err(|_| ClientError::WorkerShutdown)?;
        Ok(rx)
    }

    // ── Contacts ─────────────────────────────────────────────────────────

    pub fn new_contact(&mut self, name: &str) -> Result<u64, ClientError> {
        let id = self.state.new_contact(name, &self.rng)?;
        self.save();
        Ok(id)
    }

    /// Stores the in-flight handshake material for a pending contact.
    pub fn set_kx_material(&mut self, id: u64, kxs: Vec<u8>) -> Result<(), ClientError> {
        self.state.contact_mut(id)?.kxs_bytes = Some(kxs);
        self.save();
        Ok(())
    }

    /// Applies the outputs of the external key-exchange parser: the contact
    /// becomes active, and anything that arrived sealed while the exchange
    /// was pending is decoded now.
    pub fn complete_key_exchange(
        &mut self,
        id: u64,
        outcome: KeyExchangeOutcome,
    ) -> Result<(), ClientError> {
        {
            let contact = self.state.contact_mut(id)?;
            if !contact.is_pending {
                return Err(ClientError::AlreadyActive);
            }
            contact.complete_key_exchange(outcome);
        }

        loop {
            let Some((inbox_id, sealed)) = self
                .state
                .inbox
                .iter()
                .find(|m| m.from == id && m.sealed.is_some() && m.message.is_none())
                .map(|m| (m.id, m.sealed.clone().unwrap()))
            else {
                break;
            };
            match self.unseal(inbox_id, id, &sealed) {
                Some(message) => {
                    let has_body = !message.body.is_empty();
                    let entry = self
                        .state
                        .inbox
                        .iter_mut()
                        .find(|m| m.id == inbox_id)
                        .expect("entry still present");
                    entry.message = Some(message);
                    entry.sealed = None;
                    if has_body {
                        self.emit(ClientEvent::InboxAdded {
                            id: inbox_id,
                            from: id,
                            indicator: Indicator::Blue,
                        });
                    }
                }
                None => {
                    self.state.inbox.retain(|m| m.id != inbox_id);
                }
            }
        }

        self.save();
        Ok(())
    }

    // ── Send path ────────────────────────────────────────────────────────

    /// A fresh message carrying `detachments` alongside the body;
    /// `my_next_dh` is filled at queue time so it always carries the
    /// ratchet's latest value.
    pub fn compose(
        &self,
        body: Vec<u8>,
        in_reply_to: Option<u64>,
        detachments: Vec<DetachmentRecord>,
    ) -> Message {
        Message {
            id: self.rng.random_id(),
            time: State::now(),
            body,
            my_next_dh: Vec::new(),
            in_reply_to,
            supported_version: Some(PROTOCOL_VERSION),
            detachments,
        }
    }

    /// Record for a detachment we uploaded as `id`: the recipient fetches
    /// the ciphertext from our server and decrypts it with `key`.
    pub fn remote_detachment(
        &self,
        name: String,
        size: u64,
        key: Vec<u8>,
        id: u64,
    ) -> Result<DetachmentRecord, ClientError> {
        Ok(DetachmentRecord {
            name,
            size,
            key,
            url: Some(self.detachment_url(id)?),
        })
    }

    /// Record for a detachment whose ciphertext reaches the recipient out
    /// of band; only the key travels in the message.
    pub fn inline_detachment(name: String, size: u64, key: Vec<u8>) -> DetachmentRecord {
        DetachmentRecord {
            name,
            size,
            key,
            url: None,
        }
    }

    /// Seals, signs, and queues a message for delivery. Returns the outbox
    /// id used for ack tracking.
    pub fn queue_message(&mut self, to: u64, mut message: Message) -> Result<u64, ClientError> {
        let (request, server) = {
            let rng = self.rng.clone();
            let contact = self.state.contact_mut(to)?;
            if contact.is_pending {
                return Err(ClientError::ContactPending);
            }
            if contact.revoked {
                return Err(ClientError::ContactRevoked);
            }
            if contact.revoked_us {
                return Err(ClientError::ContactRevokedUs);
            }

            message.my_next_dh = contact.ratchet.current_public().to_vec();
            let encoded = wire::encode(&message);
            let padded = codec::pad_payload(&encoded, &rng)?;
            let sealed = contact.ratchet.seal(contact.supported_version, &padded, &rng);

            let digest = sha256(&sealed);
            let group_key = contact
                .my_group_key
                .as_ref()
                .expect("active contact carries a group credential");
            let signature = group_key.sign(&digest, &rng).to_bytes();

            (
                Request::Deliver {
                    to: contact.their_identity_public,
                    signature,
                    generation: contact.generation,
                    message: sealed,
                },
                contact.their_server.clone(),
            )
        };

        let id = message.id;
        let created = message.time;
        let has_body = !message.body.is_empty();
        self.queue.enqueue(QueuedMessage {
            id,
            to,
            server: server.clone(),
            revocation: false,
            request,
            created,
        });
        self.state.outbox.push(OutboxMessage {
            id,
            to,
            server,
            created,
            sent: None,
            acked: None,
            revocation: false,
            message: Some(message),
            undeliverable: false,
        });
        if has_body {
            self.emit(ClientEvent::OutboxAdded {
                id,
                to,
                indicator: Indicator::Red,
            });
        }
        self.save();
        Ok(id)
    }

    // ── Detachments ──────────────────────────────────────────────────────

    /// The URL a recipient needs to fetch detachment `id` from our server.
    pub fn detachment_url(&self, id: u64) -> Result<String, ClientError> {
        Ok(url::format_detachment(
            &self.state.identity.server,
            &self.state.identity.public,
            id,
        )?)
    }

    /// Streams a local file to our home server as a new detachment.
    pub fn upload_detachment(&self, file: tokio::fs::File) -> DetachmentHandle {
        let id = self.rng.random_id();
        let config = self.config.dial_config();
        let server = self.state.identity.server.clone();
        let identity = StaticSecret::from(self.state.identity.secret.to_bytes());
        let progress = self.progress_tx.clone();
        let rng = self.rng.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = transfer::upload_detachment(
                &config, &server, &identity, file, id, progress, cancel_rx, &rng,
            )
            .await;
            if let Err(e) = &result {
                if !e.is_canceled() {
                    warn!(error = %e, "detachment upload failed");
                }
            }
            result
        });
        DetachmentHandle {
            id,
            cancel: cancel_tx,
            task,
        }
    }

    /// Fetches a detachment URL into a local file, resuming if the file
    /// already holds a prefix.
    pub fn download_detachment(&self, file: tokio::fs::File, url: String) -> DetachmentHandle {
        let id = self.rng.random_id();
        let config = self.config.dial_config();
        let identity = StaticSecret::from(self.state.identity.secret.to_bytes());
        let progress = self.progress_tx.clone();
        let rng = self.rng.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = transfer::download_detachment(
                &config, &identity, file, id, &url, progress, cancel_rx, &rng,
            )
            .await;
            if let Err(e) = &result {
                if !e.is_canceled() {
                    warn!(error = %e, "detachment download failed");
                }
            }
            result
        });
        DetachmentHandle {
            id,
            cancel: cancel_tx,
            task,
        }
    }
}
