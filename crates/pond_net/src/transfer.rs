//! Resumable detachment transfers.
//!
//! A detachment is a bulk encrypted file moved outside the fixed-size
//! message envelopes. Transfers run as background tasks, survive dropped
//! connections by re-requesting with a resume offset, back off
//! exponentially between dial attempts, and can be canceled at any chunk
//! boundary.
//!
//! Failure asymmetry: for an upload, a local read error is fatal and a
//! network write error is transient; for a download, the reverse.

use std::io::SeekFrom;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use pond_crypto::SecureRng;
use pond_proto::url::parse_detachment;
use pond_proto::wire::{self, Reply, Request, Status};

use crate::dial::{dial_server, DialConfig};
use crate::error::NetError;
use crate::events::TransferProgress;
use crate::session::{Session, TRANSFER_DEADLINE};

const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const CHUNK_LEN: usize = 16 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Direction-specific halves of a transfer; the attempt loop is shared.
pub enum Transfer {
    Upload {
        id: u64,
        file: File,
        total: u64,
    },
    Download {
        from: [u8; 32],
        id: u64,
        file: File,
        resume: u64,
    },
}

impl Transfer {
    /// Local bookkeeping before each request. Downloads re-derive their
    /// resume offset from the file length, so a partially-written attempt
    /// continues where it left off.
    async fn prepare(&mut self) -> Result<(), NetError> {
        if let Transfer::Download { file, resume, .. } = self {
            *resume = file.seek(SeekFrom::End(0)).await?;
        }
        Ok(())
    }

    fn request(&self) -> Request {
        match self {
            Transfer::Upload { id, total, .. } => Request::Upload {
                id: *id,
                size: *total,
            },
            Transfer::Download {
                from, id, resume, ..
            } => Request::Download {
                from: *from,
                id: *id,
                resume: (*resume > 0).then_some(*resume),
            },
        }
    }

    /// Interprets the server's answer: how many bytes remain, or that the
    /// transfer is already complete. Seeks the local file for uploads.
    async fn process_reply(&mut self, reply: &Reply) -> Result<(u64, bool), NetError> {
        match self {
            Transfer::Upload { file, total, .. } => {
                let offset = reply.upload.as_ref().and_then(|u| u.resume).unwrap_or(0);
                if offset > *total {
                    return Err(NetError::Transfer("server resume offset past our size"));
                }
                if offset == *total {
                    return Ok((0, true));
                }
                let pos = file.seek(SeekFrom::Start(offset)).await?;
                if pos != offset {
                    return Err(NetError::Transfer("failed to seek in local file"));
                }
                Ok((*total - offset, false))
            }
            Transfer::Download { resume, .. } => {
                let download = reply
                    .download
                    .as_ref()
                    .ok_or(NetError::Transfer("reply did not include a download section"))?;
                if download.size < *resume {
                    return Err(NetError::Transfer("server suggests the file was truncated"));
                }
                if download.size == *resume {
                    return Ok((0, true));
                }
                Ok((download.size - *resume, false))
            }
        }
    }

    fn is_upload(&self) -> bool {
        matches!(self, Transfer::Upload { .. })
    }

    fn file_mut(&mut self) -> &mut File {
        match self {
            Transfer::Upload { file, .. } => file,
            Transfer::Download { file, .. } => file,
        }
    }

    /// Upload: the server confirms with a single zero byte once it holds
    /// everything. Download: the byte count already proves completion.
    async fn complete<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        session: &mut Session<S>,
    ) -> bool {
        match self {
            Transfer::Upload { .. } => matches!(session.read_framed().await.as_deref(), Ok([0])),
            Transfer::Download { .. } => true,
        }
    }
}

/// Uploads a local file as detachment `id` on our home server.
#[allow(clippy::too_many_arguments)]
pub async fn upload_detachment(
    config: &DialConfig,
    server: &str,
    identity: &StaticSecret,
    file: File,
    id: u64,
    progress: mpsc::Sender<TransferProgress>,
    cancel: watch::Receiver<bool>,
    rng: &SecureRng,
) -> Result<(), NetError> {
    let total = file.metadata().await?.len();
    let transfer = Transfer::Upload { id, file, total };
    transfer_detachment(config, server, identity, transfer, id, progress, cancel, rng).await
}

/// Downloads the detachment named by `url` into `file`, resuming past any
/// bytes the file already holds.
#[allow(clippy::too_many_arguments)]
pub async fn download_detachment(
    config: &DialConfig,
    identity: &StaticSecret,
    file: File,
    id: u64,
    url: &str,
    progress: mpsc::Sender<TransferProgress>,
    cancel: watch::Receiver<bool>,
    rng: &SecureRng,
) -> Result<(), NetError> {
    info!(%url, "starting download");
    let location = parse_detachment(url)?;
    let transfer = Transfer::Download {
        from: location.from,
        id: location.id,
        file,
        resume: 0,
    };
    transfer_detachment(
        config,
        &location.server,
        identity,
        transfer,
        id,
        progress,
        cancel,
        rng,
    )
    .await
}

enum ChunkOutcome {
    Eof,
    Transient,
}

#[allow(clippy::too_many_arguments)]
async fn transfer_detachment(
    config: &DialConfig,
    server: &str,
    identity: &StaticSecret,
    mut transfer: Transfer,
    id: u64,
    progress: mpsc::Sender<TransferProgress>,
    cancel: watch::Receiver<bool>,
    rng: &SecureRng,
) -> Result<(), NetError> {
    let send_status = |done: u64, total: u64, status: &str| {
        // Dropped reports are fine; the next one catches the UI up.
        let _ = progress.try_send(TransferProgress {
            id,
            done,
            total,
            status: status.to_string(),
        });
    };

    let mut backoff = INITIAL_BACKOFF;
    loop {
        send_status(0, 0, "Connecting");

        let mut session = match dial_server(config, server, identity, rng).await {
            Ok(session) => session,
            Err(e) => {
                warn!(%server, error = %e, "failed to connect for transfer");
                send_status(0, 0, "Waiting to reconnect");
                let mut cancel_wait = cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel_wait.changed() => {
                        if *cancel_wait.borrow() {
                            return Err(NetError::Canceled);
                        }
                    }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        send_status(0, 0, "Requesting transfer");
        transfer.prepare().await?;
        if let Err(e) = session.write_framed(&wire::encode(&transfer.request())).await {
            warn!(%server, error = %e, "failed to write transfer request");
            continue;
        }
        let reply = match session.read_framed().await {
            Ok(bytes) => match wire::decode::<Reply>(&bytes) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%server, error = %e, "bad transfer reply");
                    continue;
                }
            },
            Err(e) => {
                warn!(%server, error = %e, "failed to read transfer reply");
                continue;
            }
        };

        // The file already ends where we asked to resume.
        if reply.status == Status::ResumePastEndOfFile {
            return Ok(());
        }
        wire::reply_to_error(&reply)?;

        let (total, complete) = transfer.process_reply(&reply).await?;
        if complete {
            return Ok(());
        }

        session.set_deadline(TRANSFER_DEADLINE);
        let is_upload = transfer.is_upload();
        let mut transferred: u64 = 0;
        let mut last_update: Option<Instant> = None;
        let mut buf = vec![0u8; CHUNK_LEN];

        let outcome = loop {
            if *cancel.borrow() {
                return Err(NetError::Canceled);
            }

            if is_upload {
                let n = match transfer.file_mut().read(&mut buf).await {
                    Ok(0) => break ChunkOutcome::Eof,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "failed to read during transfer");
                        return Err(NetError::Io(e));
                    }
                };
                if let Err(e) = session.write_framed(&buf[..n]).await {
                    warn!(error = %e, "transfer write failed, reconnecting");
                    break ChunkOutcome::Transient;
                }
                transferred += n as u64;
            } else {
                let chunk = match session.read_framed().await {
                    Ok(chunk) => chunk,
                    Err(NetError::Closed) => break ChunkOutcome::Eof,
                    Err(e) => {
                        warn!(error = %e, "transfer read failed, reconnecting");
                        break ChunkOutcome::Transient;
                    }
                };
                if let Err(e) = transfer.file_mut().write_all(&chunk).await {
                    warn!(error = %e, "failed to write during download");
                    return Err(NetError::Io(e));
                }
                transferred += chunk.len() as u64;
            }

            if transferred > total {
                warn!(transferred, total, "transferred more than the expected amount");
                return Err(NetError::Transfer("transferred more than the expected amount"));
            }

            let now = Instant::now();
            if last_update.map_or(true, |t| now.duration_since(t) > PROGRESS_INTERVAL) {
                last_update = Some(now);
                send_status(transferred, total, "");
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        match outcome {
            ChunkOutcome::Transient => continue,
            ChunkOutcome::Eof => {
                if transferred < total {
                    // Short stream: re-request and resume.
                    continue;
                }
                if transfer.complete(&mut session).await {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver::TestServer;
    use pond_proto::wire::{DownloadReply, UploadReply};
    use std::io::Write;

    fn rng() -> SecureRng {
        SecureRng::from_seed([70; 32])
    }

    fn identity(rng: &SecureRng) -> StaticSecret {
        StaticSecret::from(rng.random_array::<32>())
    }

    fn channels() -> (
        mpsc::Sender<TransferProgress>,
        mpsc::Receiver<TransferProgress>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (progress_tx, progress_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (progress_tx, progress_rx, cancel_tx, cancel_rx)
    }

    fn testing_config() -> DialConfig {
        DialConfig {
            testing: true,
            ..DialConfig::default()
        }
    }

    fn temp_file_with(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detachment");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    /// Upload server: replies with `resume`, collects streamed frames, then
    /// confirms with a zero byte.
    async fn upload_server(resume: Option<u64>, expect: Vec<u8>) -> TestServer {
        TestServer::spawn_raw(move |mut session, _, _| {
            let expect = expect.clone();
            Box::pin(async move {
                let frame = session.read_framed().await.unwrap();
                let request: Request = wire::decode(&frame).unwrap();
                let size = match request {
                    Request::Upload { size, .. } => size,
                    other => panic!("expected upload, got {other:?}"),
                };
                let mut reply = Reply::ok();
                reply.upload = Some(UploadReply { resume });
                session.write_framed(&wire::encode(&reply)).await.unwrap();

                let mut received = Vec::new();
                let want = size - resume.unwrap_or(0);
                while (received.len() as u64) < want {
                    received.extend(session.read_framed().await.unwrap());
                }
                assert_eq!(received, expect);
                session.write_framed(&[0]).await.unwrap();
            })
        })
        .await
    }

    #[tokio::test]
    async fn upload_from_scratch() {
        let rng = rng();
        let content = vec![0x61; 40 * 1024];
        let server = upload_server(None, content.clone()).await;
        let (dir, path) = temp_file_with(&content);

        let (progress_tx, mut progress_rx, _cancel_tx, cancel_rx) = channels();
        let file = File::open(&path).await.unwrap();
        upload_detachment(
            &testing_config(),
            &server.url,
            &identity(&rng),
            file,
            5,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap();

        let first = progress_rx.recv().await.unwrap();
        assert_eq!(first.status, "Connecting");
        drop(dir);
    }

    #[tokio::test]
    async fn upload_resumes_at_server_offset() {
        let rng = rng();
        let content = vec![0x62; 30 * 1024];
        let offset = 10 * 1024u64;
        let server = upload_server(Some(offset), content[offset as usize..].to_vec()).await;
        let (dir, path) = temp_file_with(&content);

        let (progress_tx, _progress_rx, _cancel_tx, cancel_rx) = channels();
        let file = File::open(&path).await.unwrap();
        upload_detachment(
            &testing_config(),
            &server.url,
            &identity(&rng),
            file,
            5,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap();
        drop(dir);
    }

    #[tokio::test]
    async fn resume_past_end_of_file_is_success() {
        let rng = rng();
        let server = TestServer::spawn(|_| Reply::with_status(Status::ResumePastEndOfFile)).await;
        let (dir, path) = temp_file_with(b"abc");

        let (progress_tx, _progress_rx, _cancel_tx, cancel_rx) = channels();
        let file = File::open(&path).await.unwrap();
        upload_detachment(
            &testing_config(),
            &server.url,
            &identity(&rng),
            file,
            1,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap();
        drop(dir);
    }

    #[tokio::test]
    async fn error_status_aborts_with_that_error() {
        let rng = rng();
        let server = TestServer::spawn(|_| Reply::with_status(Status::OverQuota)).await;
        let (dir, path) = temp_file_with(b"abc");

        let (progress_tx, _progress_rx, _cancel_tx, cancel_rx) = channels();
        let file = File::open(&path).await.unwrap();
        let err = upload_detachment(
            &testing_config(),
            &server.url,
            &identity(&rng),
            file,
            1,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            NetError::Proto(pond_proto::ProtoError::ServerStatus(Status::OverQuota))
        ));
        drop(dir);
    }

    #[tokio::test]
    async fn download_writes_the_remote_bytes() {
        let rng = rng();
        let content = vec![0x63; 50 * 1024];
        let payload = content.clone();
        let server = TestServer::spawn_raw(move |mut session, _, _| {
            let payload = payload.clone();
            Box::pin(async move {
                let frame = session.read_framed().await.unwrap();
                let request: Request = wire::decode(&frame).unwrap();
                let resume = match request {
                    Request::Download { resume, .. } => resume.unwrap_or(0) as usize,
                    other => panic!("expected download, got {other:?}"),
                };
                let mut reply = Reply::ok();
                reply.download = Some(DownloadReply {
                    size: payload.len() as u64,
                });
                session.write_framed(&wire::encode(&reply)).await.unwrap();
                for chunk in payload[resume..].chunks(CHUNK_LEN) {
                    session.write_framed(chunk).await.unwrap();
                }
                // Close: the client treats EOF at the full length as done.
            })
        })
        .await;

        let uploader = [0x44u8; 32];
        let url = pond_proto::url::format_detachment(&server.url, &uploader, 0x99).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incoming");
        // A partial previous attempt: the download resumes after it.
        std::fs::write(&path, &content[..8 * 1024]).unwrap();

        let (progress_tx, _progress_rx, _cancel_tx, cancel_rx) = channels();
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        download_detachment(
            &testing_config(),
            &identity(&rng),
            file,
            2,
            &url,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), content);
        drop(dir);
    }

    #[tokio::test]
    async fn cancellation_returns_the_sentinel() {
        let rng = rng();
        let content = vec![0x64; 64 * 1024];
        let server = upload_server(None, content.clone()).await;
        let (dir, path) = temp_file_with(&content);

        let (progress_tx, _progress_rx, cancel_tx, cancel_rx) = channels();
        cancel_tx.send(true).unwrap();

        let file = File::open(&path).await.unwrap();
        let err = upload_detachment(
            &testing_config(),
            &server.url,
            &identity(&rng),
            file,
            3,
            progress_tx,
            cancel_rx,
            &rng,
        )
        .await
        .unwrap_err();
        assert!(err.is_canceled());
        drop(dir);
    }
}
