//! Upload session coordinator.
//!
//! One session uploads one source:
//!
//! 1. **Hashing**: fingerprint the bytes and plan the chunks (no network)
//! 2. **Probing**: ask the server what it already holds
//! 3. **Uploading**: send the missing chunks, several at a time
//! 4. **Merging**: once every chunk is acknowledged, ask for the merge
//!
//! The session ends in `Done` or `Failed`, and [`UploadSession::run`]
//! returns that result once.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use slicedrop_protocol::constants::{BINARY_HEADER_RESERVE, MessageType, WS_MAX_MESSAGE_SIZE};
use slicedrop_protocol::messages::{
    ChunkAck, ChunkHeader, ChunkLayout, MergeRequest, MergeResponse, ProbeRequest, ProbeResponse,
};
use slicedrop_protocol::ResultCode;
use slicedrop_transfer::{
    ChunkPlan, ChunkRange, Fingerprint, FingerprintHasher, TransferError, chunk_checksum, plan,
};

use crate::connection::{UploadConnection, decode_reply};
use crate::error::{ClientError, SessionError, SessionErrorKind};
use crate::source::ByteSource;
use crate::types::{SessionConfig, SessionEvent, SessionPhase, UploadOutcome};

/// Read size while fingerprinting a source.
const HASH_READ_SIZE: u64 = 64 * 1024;

/// Coordinates the upload of one source.
pub struct UploadSession {
    conn: Arc<dyn UploadConnection>,
    source: Arc<dyn ByteSource>,
    extension: String,
    config: SessionConfig,
    phase: SessionPhase,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    cancel: CancellationToken,
}

/// Everything a chunk task needs, shared across tasks.
struct ChunkContext {
    conn: Arc<dyn UploadConnection>,
    source: Arc<dyn ByteSource>,
    fingerprint: Fingerprint,
    extension: String,
    layout: ChunkLayout,
    config: SessionConfig,
    events_tx: mpsc::Sender<SessionEvent>,
}

struct ChunkDone {
    index: u32,
    bytes: u64,
    result: Result<(), SessionErrorKind>,
}

impl UploadSession {
    pub fn new(
        conn: Arc<dyn UploadConnection>,
        source: Arc<dyn ByteSource>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let extension = source.extension();
        Self {
            conn,
            source,
            extension,
            config,
            phase: SessionPhase::Hashing,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the extension taken from the source.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Returns a token that cancels this session.
    ///
    /// Cancellation aborts in-flight chunk uploads; chunks already staged
    /// on the server stay there for a later session to resume.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Runs the session to its terminal state.
    pub async fn run(mut self) -> Result<UploadOutcome, SessionError> {
        // Nobody listening: let sends fail instead of filling the channel.
        drop(self.events_rx.take());

        let result = self.drive().await;
        match &result {
            Ok(outcome) => {
                self.enter(SessionPhase::Done).await;
                info!(
                    fingerprint = %outcome.fingerprint,
                    instant = outcome.instant,
                    uploaded = outcome.uploaded_chunks,
                    resumed = outcome.resumed_chunks,
                    "upload complete"
                );
                self.emit(SessionEvent::Done(outcome.clone())).await;
            }
            Err(e) => {
                self.enter(SessionPhase::Failed).await;
                warn!(phase = %e.phase, recovery = ?e.recovery(), "upload failed: {}", e.kind);
                self.emit(SessionEvent::Failed {
                    phase: e.phase,
                    code: e.code(),
                    message: e.kind.to_string(),
                    recovery: e.recovery(),
                })
                .await;
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<UploadOutcome, SessionError> {
        self.enter(SessionPhase::Hashing).await;
        let mut plan = self.hash().await?;

        self.enter(SessionPhase::Probing).await;
        let probe = self.probe(&plan).await?;

        if probe.result.code == ResultCode::ArtifactExists {
            debug!(fingerprint = %plan.fingerprint, "artifact already on server");
            return Ok(UploadOutcome {
                fingerprint: plan.fingerprint,
                artifact_location: probe.result.artifact_location,
                file_name: None,
                size: Some(plan.file_size),
                instant: true,
                uploaded_chunks: 0,
                resumed_chunks: 0,
            });
        }

        let staged_layout = probe
            .layout
            .filter(|l| probe.result.code == ResultCode::Staged && *l != plan.layout());
        if let Some(layout) = staged_layout {
            plan = self.adopt(plan, layout).await?;
        }

        let present: BTreeSet<u32> = match probe.result.code {
            ResultCode::Staged => probe
                .present
                .into_iter()
                .filter(|i| (1..=plan.total_chunks).contains(i))
                .collect(),
            _ => BTreeSet::new(),
        };

        self.enter(SessionPhase::Uploading).await;
        let uploaded = self.upload(&plan, &present).await?;

        self.enter(SessionPhase::Merging).await;
        let merged = self.merge(&plan).await?;

        Ok(UploadOutcome {
            fingerprint: plan.fingerprint,
            artifact_location: merged.result.artifact_location,
            file_name: merged.file_name,
            size: merged.size,
            instant: false,
            uploaded_chunks: uploaded,
            resumed_chunks: present.len() as u32,
        })
    }

    async fn hash(&self) -> Result<ChunkPlan, SessionError> {
        let len = self.source.len();
        if len == 0 {
            return Err(self.fail(SessionErrorKind::Plan("source is empty".into())));
        }

        let source = Arc::clone(&self.source);
        let hashing = tokio::task::spawn_blocking(move || hash_source(source.as_ref()));
        let fingerprint = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.fail(SessionErrorKind::Cancelled)),
            joined = hashing => joined
                .map_err(|e| TransferError::Io(std::io::Error::other(e)))
                .and_then(|r| r)
                .map_err(|e| self.fail(SessionErrorKind::Hash(e)))?,
        };

        let plan = plan(
            fingerprint,
            self.extension.clone(),
            len,
            self.config.max_chunk_bytes,
            self.config.max_chunk_count,
        )
        .map_err(|e| self.fail(SessionErrorKind::Plan(e.to_string())))?;

        self.check_frame_limit(&plan)?;
        debug!(
            fingerprint = %plan.fingerprint,
            chunks = plan.total_chunks,
            chunk_size = plan.chunk_size,
            "planned upload"
        );
        self.emit_plan(&plan).await;
        Ok(plan)
    }

    /// Switches to the layout an earlier session pinned on the server, so
    /// staged chunks keep lining up with the ranges sent now.
    async fn adopt(&self, plan: ChunkPlan, layout: ChunkLayout) -> Result<ChunkPlan, SessionError> {
        let adopted = ChunkPlan::from_layout(
            plan.fingerprint.clone(),
            plan.file_extension.clone(),
            plan.file_size,
            layout,
        )
        .map_err(|e| self.fail(SessionErrorKind::Plan(format!("staged layout unusable: {e}"))))?;
        self.check_frame_limit(&adopted)?;
        info!(
            fingerprint = %adopted.fingerprint,
            chunks = adopted.total_chunks,
            chunk_size = adopted.chunk_size,
            planned_chunk_size = plan.chunk_size,
            "resuming with the staged layout"
        );
        self.emit_plan(&adopted).await;
        Ok(adopted)
    }

    fn check_frame_limit(&self, plan: &ChunkPlan) -> Result<(), SessionError> {
        let frame_limit = (WS_MAX_MESSAGE_SIZE - BINARY_HEADER_RESERVE) as u64;
        let largest = plan.largest_chunk();
        if largest > frame_limit {
            return Err(self.fail(SessionErrorKind::Plan(format!(
                "chunk of {largest} bytes exceeds the {frame_limit} byte frame limit"
            ))));
        }
        Ok(())
    }

    async fn emit_plan(&self, plan: &ChunkPlan) {
        self.emit(SessionEvent::Planned {
            fingerprint: plan.fingerprint.clone(),
            total_chunks: plan.total_chunks,
            chunk_size: plan.chunk_size,
            file_size: plan.file_size,
        })
        .await;
    }

    async fn probe(&self, plan: &ChunkPlan) -> Result<ProbeResponse, SessionError> {
        let req = ProbeRequest {
            fingerprint: plan.fingerprint.to_string(),
            extension: Some(plan.file_extension.clone()),
            size: Some(plan.file_size),
            total_chunks: Some(plan.total_chunks),
        };
        let resp: ProbeResponse = self.call(MessageType::ProbeChunks, &req).await?;
        if !resp.result.is_success() {
            return Err(self.fail(SessionErrorKind::Probe {
                code: resp.result.code,
                message: resp.result.message,
            }));
        }
        debug!(
            fingerprint = %plan.fingerprint,
            code = ?resp.result.code,
            present = resp.present.len(),
            "probe result"
        );
        Ok(resp)
    }

    /// Uploads every chunk not in `present`; returns how many were sent.
    ///
    /// The first failure stops new dispatches. Chunks already in flight
    /// are awaited, then the session fails with that first error.
    async fn upload(&self, plan: &ChunkPlan, present: &BTreeSet<u32>) -> Result<u32, SessionError> {
        let total = plan.total_chunks;
        for &index in present {
            self.emit(SessionEvent::ChunkSkipped { index }).await;
        }

        let ctx = Arc::new(ChunkContext {
            conn: Arc::clone(&self.conn),
            source: Arc::clone(&self.source),
            fingerprint: plan.fingerprint.clone(),
            extension: plan.file_extension.clone(),
            layout: plan.layout(),
            config: self.config.clone(),
            events_tx: self.events_tx.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut queue = plan
            .ranges()
            .filter(|r| !present.contains(&r.index))
            .collect::<Vec<_>>()
            .into_iter()
            .peekable();

        let mut in_flight: JoinSet<ChunkDone> = JoinSet::new();
        let mut acknowledged = present.len() as u32;
        let mut uploaded = 0u32;
        let mut failure: Option<SessionErrorKind> = None;

        loop {
            let dispatching = failure.is_none() && queue.peek().is_some();
            if !dispatching && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    in_flight.shutdown().await;
                    return Err(self.fail(SessionErrorKind::Cancelled));
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match settle(joined) {
                        (index, Ok(bytes)) => {
                            acknowledged += 1;
                            uploaded += 1;
                            self.emit(SessionEvent::ChunkAcknowledged {
                                index,
                                bytes,
                                acknowledged,
                                total,
                            })
                            .await;
                        }
                        (index, Err(kind)) => {
                            warn!(fingerprint = %plan.fingerprint, index, "chunk failed: {kind}");
                            if failure.is_none() {
                                failure = Some(kind);
                            }
                        }
                    }
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if dispatching => {
                    let Ok(permit) = permit else {
                        failure.get_or_insert(SessionErrorKind::Task("upload limiter closed".into()));
                        continue;
                    };
                    let Some(range) = queue.next() else { continue };
                    let ctx = Arc::clone(&ctx);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let result = upload_chunk(&ctx, range).await;
                        ChunkDone {
                            index: range.index,
                            bytes: range.len(),
                            result,
                        }
                    });
                }
            }
        }

        if let Some(kind) = failure {
            return Err(self.fail(kind));
        }
        if acknowledged != total {
            return Err(self.fail(SessionErrorKind::Task(format!(
                "{acknowledged} of {total} chunks acknowledged"
            ))));
        }
        Ok(uploaded)
    }

    async fn merge(&self, plan: &ChunkPlan) -> Result<MergeResponse, SessionError> {
        let req = MergeRequest {
            fingerprint: plan.fingerprint.to_string(),
            count: plan.total_chunks,
            extension: Some(plan.file_extension.clone()),
            chunk_size: Some(plan.chunk_size),
        };
        let resp: MergeResponse = self.call(MessageType::MergeChunks, &req).await?;
        let result = &resp.result;
        match result.code {
            ResultCode::Merged | ResultCode::AlreadyExists => Ok(resp),
            ResultCode::ChunkIncomplete => Err(self.fail(SessionErrorKind::ChunkIncomplete(
                result.message.clone(),
            ))),
            ResultCode::StagingNotFound => Err(self.fail(SessionErrorKind::StagingNotFound(
                result.message.clone(),
            ))),
            code => Err(self.fail(SessionErrorKind::Merge {
                code,
                message: result.message.clone(),
            })),
        }
    }

    /// Sends a JSON request, racing it against cancellation.
    async fn call<Req, Resp>(&self, msg_type: MessageType, req: &Req) -> Result<Resp, SessionError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_value(req)
            .map_err(|e| self.fail(SessionErrorKind::Transport(ClientError::Json(e))))?;
        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.fail(SessionErrorKind::Cancelled)),
            reply = self.conn.send_request(msg_type, &payload) => reply,
        };
        reply
            .and_then(|msg| decode_reply(&msg))
            .map_err(|e| self.fail(SessionErrorKind::Transport(e)))
    }

    async fn enter(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.emit(SessionEvent::PhaseChanged(phase)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event).await;
    }

    fn fail(&self, kind: SessionErrorKind) -> SessionError {
        SessionError::new(self.phase, kind)
    }
}

/// Fingerprints a source in one sequential pass.
fn hash_source(source: &dyn ByteSource) -> Result<Fingerprint, TransferError> {
    let len = source.len();
    let mut hasher = FingerprintHasher::new();
    let mut offset = 0;
    while offset < len {
        let end = (offset + HASH_READ_SIZE).min(len);
        hasher.update(&source.read_range(offset, end)?);
        offset = end;
    }
    Ok(hasher.finalize())
}

fn settle(joined: Result<ChunkDone, JoinError>) -> (u32, Result<u64, SessionErrorKind>) {
    match joined {
        Ok(done) => (done.index, done.result.map(|()| done.bytes)),
        Err(e) => (0, Err(SessionErrorKind::Task(e.to_string()))),
    }
}

/// Sends one chunk, retrying retryable failures with backoff.
async fn upload_chunk(ctx: &ChunkContext, range: ChunkRange) -> Result<(), SessionErrorKind> {
    let index = range.index;
    let source = Arc::clone(&ctx.source);
    let data = tokio::task::spawn_blocking(move || source.read_range(range.start, range.end))
        .await
        .map_err(|e| SessionErrorKind::Task(e.to_string()))?
        .map_err(|source| SessionErrorKind::Source { index, source })?;

    let header = ChunkHeader {
        id: String::new(),
        fingerprint: ctx.fingerprint.to_string(),
        index,
        extension: ctx.extension.clone(),
        checksum: if ctx.config.checksums {
            chunk_checksum(&data)
        } else {
            String::new()
        },
        layout: Some(ctx.layout),
    };
    let header = serde_json::to_value(&header)
        .map_err(|e| SessionErrorKind::ChunkTransport {
            index,
            source: ClientError::Json(e),
        })?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let (kind, retryable) = match ctx.conn.send_binary(&header, &data).await {
            Ok(msg) => match decode_reply::<ChunkAck>(&msg) {
                Ok(ack) if ack.result.is_success() => {
                    debug!(fingerprint = %ctx.fingerprint, index, code = ?ack.result.code, "chunk acknowledged");
                    return Ok(());
                }
                Ok(ack) => {
                    let code = ack.result.code;
                    let kind = SessionErrorKind::ChunkWrite {
                        index,
                        code,
                        message: ack.result.message,
                    };
                    (kind, code.is_retryable())
                }
                Err(source) => (SessionErrorKind::ChunkTransport { index, source }, false),
            },
            Err(source) => {
                let retryable = source.is_retryable();
                (SessionErrorKind::ChunkTransport { index, source }, retryable)
            }
        };

        if !retryable || attempt > ctx.config.retries {
            return Err(kind);
        }

        let delay = ctx.config.retry_backoff(attempt);
        debug!(fingerprint = %ctx.fingerprint, index, attempt, ?delay, "retrying chunk: {kind}");
        let _ = ctx
            .events_tx
            .send(SessionEvent::ChunkRetry {
                index,
                attempt,
                reason: kind.to_string(),
            })
            .await;
        tokio::time::sleep(delay).await;
    }
}
