//! [`Handler`] that backs the upload protocol with a chunk store and merge
//! engine rooted in one upload directory.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use slicedrop_protocol::constants::{MessageType, WS_ERR_CODE_BAD_REQUEST};
use slicedrop_protocol::envelope::Message;
use slicedrop_protocol::messages::{
    ChunkAck, ChunkHeader, MergeRequest, MergeResponse, ProbeRequest, ProbeResponse,
};
use slicedrop_protocol::types::{OperationResult, ResultCode};
use slicedrop_transfer::{
    ArtifactRef, ChunkLayout, ChunkStore, Fingerprint, MergeEngine, MergeOutcome, ResumeInfo,
    StoreOutcome, TransferError,
};

use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

/// Serves probe, chunk and merge requests.
///
/// Filesystem work runs on the blocking pool; the staging directories are
/// the only shared state, so nothing here is locked per request.
#[derive(Clone)]
pub struct StagingHandler {
    store: ChunkStore,
    merger: Arc<MergeEngine>,
    public_url: Option<String>,
}

impl StagingHandler {
    /// Creates a handler over `upload_root` with merge verification on.
    pub fn new(upload_root: impl Into<PathBuf>) -> Self {
        let store = ChunkStore::new(upload_root);
        let merger = MergeEngine::for_store(&store);
        Self::with_parts(store, merger)
    }

    pub fn with_parts(store: ChunkStore, merger: MergeEngine) -> Self {
        Self {
            store,
            merger: Arc::new(merger),
            public_url: None,
        }
    }

    /// Renders artifact locations as `{base}/{file_name}` instead of a path.
    pub fn with_public_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.public_url = Some(base.trim_end_matches('/').to_string());
        self
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn location(&self, artifact: &ArtifactRef) -> String {
        match &self.public_url {
            Some(base) => format!("{base}/{}", artifact.file_name),
            None => artifact.path.display().to_string(),
        }
    }

    /// Answers a resume probe.
    pub async fn probe(&self, req: ProbeRequest) -> ProbeResponse {
        let fingerprint = match Fingerprint::parse(&req.fingerprint) {
            Ok(fp) => fp,
            Err(e) => return probe_failure(&e),
        };

        let store = self.store.clone();
        let fp = fingerprint.clone();
        let extension = req.extension.clone();
        let size = req.size;
        let result = run_blocking(move || store.probe(&fp, extension.as_deref(), size)).await;

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(%fingerprint, "probe failed: {e}");
                return probe_failure(&e);
            }
        };

        let missing = req
            .total_chunks
            .map(|total| info.missing(total))
            .unwrap_or_default();

        match info {
            ResumeInfo::Staged {
                present,
                file_names,
                layout,
            } => {
                tracing::debug!(%fingerprint, staged = present.len(), ?layout, "probe found staging");
                ProbeResponse {
                    result: OperationResult::new(
                        ResultCode::Staged,
                        format!("{} chunks staged", present.len()),
                    ),
                    present,
                    file_list: file_names,
                    missing,
                    layout,
                }
            }
            ResumeInfo::Merged(artifact) => {
                tracing::debug!(%fingerprint, "probe found artifact");
                ProbeResponse {
                    result: OperationResult::new(ResultCode::ArtifactExists, "file already exists")
                        .with_location(self.location(&artifact)),
                    present: Vec::new(),
                    file_list: Vec::new(),
                    missing,
                    layout: None,
                }
            }
            ResumeInfo::Fresh => ProbeResponse {
                result: OperationResult::new(ResultCode::Fresh, ""),
                present: Vec::new(),
                file_list: Vec::new(),
                missing,
                layout: None,
            },
        }
    }

    /// Stages one chunk.
    pub async fn store_chunk(&self, header: ChunkHeader, data: Vec<u8>) -> ChunkAck {
        let index = header.index;
        let fingerprint = match Fingerprint::parse(&header.fingerprint) {
            Ok(fp) => fp,
            Err(e) => {
                return ChunkAck {
                    result: failure(&e),
                    index,
                };
            }
        };

        let store = self.store.clone();
        let fp = fingerprint.clone();
        let result = run_blocking(move || {
            let checksum = Some(header.checksum.as_str());
            store.store_planned_chunk(&fp, header.layout, index, &header.extension, &data, checksum)
        })
        .await;

        let result = match result {
            Ok(StoreOutcome::Stored) => OperationResult::new(ResultCode::Stored, "chunk stored"),
            Ok(StoreOutcome::AlreadyExists) => {
                OperationResult::new(ResultCode::AlreadyExists, "chunk already exists")
            }
            Err(e) => {
                tracing::warn!(%fingerprint, index, "chunk rejected: {e}");
                failure(&e)
            }
        };
        ChunkAck { result, index }
    }

    /// Merges a complete staging area.
    pub async fn merge(&self, req: MergeRequest) -> MergeResponse {
        let fingerprint = match Fingerprint::parse(&req.fingerprint) {
            Ok(fp) => fp,
            Err(e) => return merge_failure(&e),
        };

        let merger = Arc::clone(&self.merger);
        let fp = fingerprint.clone();
        let result = run_blocking(move || {
            let extension = req.extension.as_deref();
            match req.chunk_size {
                Some(chunk_size) => {
                    let layout = ChunkLayout {
                        chunk_size,
                        total_chunks: req.count,
                    };
                    merger.merge_planned(&fp, layout, extension)
                }
                None => merger.merge(&fp, req.count, extension),
            }
        })
        .await;

        let (code, message, artifact) = match result {
            Ok(MergeOutcome::Merged(a)) => (ResultCode::Merged, "merge success", a),
            Ok(MergeOutcome::AlreadyExists(a)) => {
                (ResultCode::AlreadyExists, "file already exists", a)
            }
            Err(e) => {
                tracing::warn!(%fingerprint, "merge failed: {e}");
                return merge_failure(&e);
            }
        };
        MergeResponse {
            result: OperationResult::new(code, message).with_location(self.location(&artifact)),
            file_name: Some(artifact.file_name),
            size: Some(artifact.size),
        }
    }
}

impl Handler for StagingHandler {
    fn on_probe_chunks(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<ProbeRequest>(&sender, &msg) else {
                return;
            };
            let resp = self.probe(req).await;
            send_reply(&sender, &msg, MessageType::ProbeResult, &resp);
        })
    }

    fn on_merge_chunks(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<MergeRequest>(&sender, &msg) else {
                return;
            };
            let resp = self.merge(req).await;
            send_reply(&sender, &msg, MessageType::MergeResult, &resp);
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let id = header.id.clone();
            let ack = self.store_chunk(header, data).await;
            match Message::new(id, MessageType::ChunkAck, Some(&ack)) {
                Ok(reply) => {
                    let _ = sender.send_msg(reply);
                }
                Err(e) => tracing::error!("failed to encode chunk ack: {e}"),
            }
        })
    }
}

/// Maps a transfer error onto the wire result code.
fn code_for(err: &TransferError) -> ResultCode {
    match err {
        TransferError::InvalidFingerprint(_)
        | TransferError::InvalidExtension(_)
        | TransferError::InvalidChunkName(_)
        | TransferError::InvalidIndex(_)
        | TransferError::InvalidPlan(_)
        | TransferError::UnexpectedChunks { .. } => ResultCode::InvalidRequest,
        TransferError::ChecksumMismatch { .. } => ResultCode::ChecksumMismatch,
        TransferError::ChunkWrite { .. } => ResultCode::ChunkWriteFailed,
        TransferError::StagingNotFound(_) => ResultCode::StagingNotFound,
        TransferError::Incomplete { .. } => ResultCode::ChunkIncomplete,
        TransferError::MergeInProgress(_) => ResultCode::MergeInProgress,
        TransferError::MergeIo { .. } => ResultCode::MergeIo,
        TransferError::FingerprintMismatch { .. } => ResultCode::FingerprintMismatch,
        TransferError::LayoutMismatch { .. } | TransferError::ChunkLength { .. } => {
            ResultCode::PlanMismatch
        }
        TransferError::Io(_) => ResultCode::Internal,
    }
}

fn failure(err: &TransferError) -> OperationResult {
    OperationResult::new(code_for(err), err.to_string())
}

fn probe_failure(err: &TransferError) -> ProbeResponse {
    ProbeResponse {
        result: failure(err),
        present: Vec::new(),
        file_list: Vec::new(),
        missing: Vec::new(),
        layout: None,
    }
}

fn merge_failure(err: &TransferError) -> MergeResponse {
    MergeResponse {
        result: failure(err),
        file_name: None,
        size: None,
    }
}

/// Runs filesystem work on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(TransferError::Io(std::io::Error::other(format!(
            "blocking task failed: {e}"
        )))),
    }
}

fn parse_request<T: for<'de> serde::Deserialize<'de>>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(req)) => Some(req),
        Ok(None) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn send_reply<T: Serialize>(sender: &Sender, req: &Message, msg_type: MessageType, payload: &T) {
    match req.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => tracing::error!("failed to encode reply: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicedrop_protocol::types::Status;
    use slicedrop_transfer::{chunk_checksum, fingerprint_bytes};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn header(fp: &Fingerprint, index: u32) -> ChunkHeader {
        ChunkHeader {
            id: format!("c-{index}"),
            fingerprint: fp.to_string(),
            index,
            extension: "bin".into(),
            checksum: String::new(),
            layout: None,
        }
    }

    fn probe_req(fp: &Fingerprint, total: Option<u32>) -> ProbeRequest {
        ProbeRequest {
            fingerprint: fp.to_string(),
            extension: Some("bin".into()),
            size: None,
            total_chunks: total,
        }
    }

    fn merge_req(fp: &Fingerprint, count: u32) -> MergeRequest {
        MergeRequest {
            fingerprint: fp.to_string(),
            count,
            extension: None,
            chunk_size: None,
        }
    }

    #[tokio::test]
    async fn probe_store_merge_flow() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path()).with_public_url("http://files.local/upload/");
        let data: Vec<u8> = (0..30u8).collect();
        let fp = fingerprint_bytes(&data);

        let fresh = handler.probe(probe_req(&fp, Some(3))).await;
        assert_eq!(fresh.result.code, ResultCode::Fresh);
        assert_eq!(fresh.missing, vec![1, 2, 3]);

        for (i, part) in data.chunks(10).enumerate() {
            let mut h = header(&fp, i as u32 + 1);
            h.checksum = chunk_checksum(part);
            let ack = handler.store_chunk(h, part.to_vec()).await;
            assert_eq!(ack.result.code, ResultCode::Stored);
            assert_eq!(ack.index, i as u32 + 1);
        }

        let staged = handler.probe(probe_req(&fp, Some(3))).await;
        assert_eq!(staged.result.code, ResultCode::Staged);
        assert_eq!(staged.present, vec![1, 2, 3]);
        assert_eq!(staged.file_list.len(), 3);
        assert!(staged.missing.is_empty());

        let merged = handler.merge(merge_req(&fp, 3)).await;
        assert_eq!(merged.result.code, ResultCode::Merged);
        assert_eq!(merged.size, Some(30));
        assert_eq!(
            merged.result.artifact_location.as_deref(),
            Some(format!("http://files.local/upload/{fp}.bin").as_str())
        );

        let done = handler.probe(probe_req(&fp, Some(3))).await;
        assert_eq!(done.result.code, ResultCode::ArtifactExists);
        assert!(done.missing.is_empty());
    }

    #[tokio::test]
    async fn repeated_chunk_is_already_exists() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let fp = fingerprint_bytes(b"repeat");

        handler.store_chunk(header(&fp, 1), b"x".to_vec()).await;
        let again = handler.store_chunk(header(&fp, 1), b"x".to_vec()).await;
        assert_eq!(again.result.code, ResultCode::AlreadyExists);
        assert_eq!(again.result.status, Status::Success);
    }

    #[tokio::test]
    async fn failures_map_to_codes() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let fp = fingerprint_bytes(b"codes");

        let mut bad = header(&fp, 1);
        bad.checksum = "0".repeat(64);
        let ack = handler.store_chunk(bad, b"x".to_vec()).await;
        assert_eq!(ack.result.code, ResultCode::ChecksumMismatch);
        assert_eq!(ack.result.status, Status::Failure);

        let missing = handler.merge(merge_req(&fp, 2)).await;
        assert_eq!(missing.result.code, ResultCode::StagingNotFound);

        handler.store_chunk(header(&fp, 1), b"x".to_vec()).await;
        let incomplete = handler.merge(merge_req(&fp, 2)).await;
        assert_eq!(incomplete.result.code, ResultCode::ChunkIncomplete);
        assert!(incomplete.file_name.is_none());

        let invalid = handler
            .probe(ProbeRequest {
                fingerprint: "../etc".into(),
                extension: None,
                size: None,
                total_chunks: None,
            })
            .await;
        assert_eq!(invalid.result.code, ResultCode::InvalidRequest);
    }

    #[tokio::test]
    async fn pinned_layout_is_reported_and_enforced() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let data: Vec<u8> = (0..30u8).collect();
        let fp = fingerprint_bytes(&data);
        let layout = ChunkLayout {
            chunk_size: 10,
            total_chunks: 3,
        };

        let mut first = header(&fp, 1);
        first.layout = Some(layout);
        let ack = handler.store_chunk(first, data[..10].to_vec()).await;
        assert_eq!(ack.result.code, ResultCode::Stored);

        let staged = handler.probe(probe_req(&fp, Some(3))).await;
        assert_eq!(staged.layout, Some(layout));
        assert_eq!(staged.missing, vec![2, 3]);

        let mut other = header(&fp, 2);
        other.layout = Some(ChunkLayout {
            chunk_size: 5,
            total_chunks: 6,
        });
        let ack = handler.store_chunk(other, data[5..10].to_vec()).await;
        assert_eq!(ack.result.code, ResultCode::PlanMismatch);

        for (i, part) in [(2, &data[10..20]), (3, &data[20..])] {
            let mut h = header(&fp, i);
            h.layout = Some(layout);
            handler.store_chunk(h, part.to_vec()).await;
        }
        let mut wrong = merge_req(&fp, 6);
        wrong.chunk_size = Some(5);
        assert_eq!(handler.merge(wrong).await.result.code, ResultCode::PlanMismatch);

        let mut right = merge_req(&fp, 3);
        right.chunk_size = Some(10);
        assert_eq!(handler.merge(right).await.result.code, ResultCode::Merged);

        // A straggler retried after the merge does not reopen staging.
        let mut late = header(&fp, 2);
        late.layout = Some(layout);
        let ack = handler.store_chunk(late, data[10..20].to_vec()).await;
        assert_eq!(ack.result.code, ResultCode::AlreadyExists);
        let mut done = probe_req(&fp, Some(3));
        done.size = Some(30);
        assert_eq!(handler.probe(done).await.result.code, ResultCode::ArtifactExists);
    }

    #[tokio::test]
    async fn location_defaults_to_path() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let fp = fingerprint_bytes(b"path");
        handler.store_chunk(header(&fp, 1), b"path".to_vec()).await;

        let merged = handler.merge(merge_req(&fp, 1)).await;
        let expected = dir.path().join(format!("{fp}.bin"));
        assert_eq!(
            merged.result.artifact_location,
            Some(expected.display().to_string())
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let (tx, mut rx) = mpsc::channel(4);

        let msg = Message::new("m-1", MessageType::MergeChunks, Some(&serde_json::json!({"count": "x"})))
            .unwrap();
        handler.on_merge_chunks(Sender::new(tx), msg).await;

        let WsMessage::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text reply");
        };
        let reply: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.id, "m-1");
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn binary_chunk_replies_with_ack() {
        let dir = TempDir::new().unwrap();
        let handler = StagingHandler::new(dir.path());
        let (tx, mut rx) = mpsc::channel(4);
        let fp = fingerprint_bytes(b"ack");

        handler
            .on_binary_chunk(Sender::new(tx), header(&fp, 4), b"ack".to_vec())
            .await;

        let WsMessage::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text reply");
        };
        let reply: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.id, "c-4");
        assert_eq!(reply.msg_type, MessageType::ChunkAck);
        let ack: ChunkAck = reply.parse_payload().unwrap().unwrap();
        assert_eq!(ack.index, 4);
        assert_eq!(ack.result.code, ResultCode::Stored);
    }
}
