use serde::{Deserialize, Serialize};

use crate::types::OperationResult;

/// Asks the server what it already holds for a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    pub fingerprint: String,
    /// Extension of the finished artifact, without the dot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Expected artifact size; a stored artifact of another size is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// When set, the reply lists the indices still missing from `1..=total_chunks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// Reply to [`ProbeRequest`].
///
/// `code` is `staged`, `artifact_exists` or `fresh`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    #[serde(flatten)]
    pub result: OperationResult,
    /// 1-based indices already staged, ascending.
    #[serde(default)]
    pub present: Vec<u32>,
    /// Staged chunk file names, ascending by index.
    #[serde(default)]
    pub file_list: Vec<String>,
    /// Indices absent from staging; empty unless `total_chunks` was supplied.
    #[serde(default)]
    pub missing: Vec<u32>,
    /// Layout the staging area is pinned to. A resuming client must plan
    /// with it, or its chunk ranges will not line up with the staged ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<ChunkLayout>,
}

/// How a file was partitioned: chunks `1..total_chunks` hold exactly
/// `chunk_size` bytes, the last one holds the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub total_chunks: u32,
}

/// JSON header of a binary chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub id: String,
    pub fingerprint: String,
    /// 1-based position of this chunk in the plan.
    pub index: u32,
    pub extension: String,
    /// Hex SHA-256 of the payload; empty skips verification.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    /// Plan this chunk belongs to; the first chunk pins it for the staging area.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<ChunkLayout>,
}

/// Reply to a binary chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    #[serde(flatten)]
    pub result: OperationResult,
    pub index: u32,
}

/// Asks the server to concatenate staged chunks into the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub fingerprint: String,
    pub count: u32,
    /// Overrides the extension recorded in the first chunk file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Chunk size of the plan; checked against the pinned layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Reply to [`MergeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    #[serde(flatten)]
    pub result: OperationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultCode, Status};

    #[test]
    fn probe_request_camel_case() {
        let req = ProbeRequest {
            fingerprint: "abc".into(),
            extension: None,
            size: None,
            total_chunks: Some(3),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"totalChunks\":3"));
        assert!(!json.contains("extension"));
        assert!(!json.contains("size"));
    }

    #[test]
    fn probe_response_flattens_result() {
        let resp = ProbeResponse {
            result: OperationResult::new(ResultCode::Staged, ""),
            present: vec![1, 2],
            file_list: vec!["abc_1.mp4".into(), "abc_2.mp4".into()],
            missing: vec![3],
            layout: Some(ChunkLayout {
                chunk_size: 100 * 1024,
                total_chunks: 3,
            }),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["code"], "staged");
        assert_eq!(json["fileList"][1], "abc_2.mp4");
        assert_eq!(json["missing"][0], 3);
        assert_eq!(json["layout"]["chunkSize"], 102400);
        assert_eq!(json["layout"]["totalChunks"], 3);
    }

    #[test]
    fn probe_response_accepts_sparse_json() {
        let json = r#"{"status":"success","code":"fresh"}"#;
        let resp: ProbeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.result.code, ResultCode::Fresh);
        assert!(resp.present.is_empty());
        assert!(resp.file_list.is_empty());
        assert!(resp.layout.is_none());
    }

    #[test]
    fn chunk_header_omits_empty_checksum() {
        let header = ChunkHeader {
            id: "r1".into(),
            fingerprint: "abc".into(),
            index: 2,
            extension: "mp4".into(),
            checksum: String::new(),
            layout: None,
        };
        let json = serde_json::to_string(&header).unwrap();
        assert!(!json.contains("checksum"));
        assert!(!json.contains("layout"));
        let back: ChunkHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn chunk_header_carries_layout() {
        let json = r#"{"id":"r2","fingerprint":"abc","index":1,"extension":"bin","layout":{"chunkSize":512,"totalChunks":4}}"#;
        let header: ChunkHeader = serde_json::from_str(json).unwrap();
        assert_eq!(
            header.layout,
            Some(ChunkLayout {
                chunk_size: 512,
                total_chunks: 4,
            })
        );
    }

    #[test]
    fn merge_response_failure() {
        let json = r#"{"status":"failure","code":"chunk_incomplete","message":"2 of 3 chunks staged"}"#;
        let resp: MergeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.result.status, Status::Failure);
        assert_eq!(resp.result.code, ResultCode::ChunkIncomplete);
        assert!(resp.file_name.is_none());
    }
}
