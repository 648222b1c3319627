//! JSON envelope carried by every text frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::{RawValue, to_raw_value};

use crate::constants::MessageType;

/// A request the server could not interpret at all.
///
/// Domain failures (an incomplete merge, a failed chunk write) are not
/// carried here; they travel as a reply payload whose status is `failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// `{ id, type, payload?, error? }`.
///
/// `payload` stays raw JSON until the receiver has looked at `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: payload.map(to_raw_value).transpose()?,
            error: None,
        })
    }

    /// Decodes the payload; `Ok(None)` when the message carries none.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Builds the reply to this request, keeping its id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(self.id.clone(), msg_type, payload)
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Self::error(self.id.clone(), code, message)
    }

    /// Recovers the `id` of a JSON object that does not decode as a whole.
    pub fn peek_id(json: &[u8]) -> Option<String> {
        #[derive(Deserialize)]
        struct IdOnly {
            id: Option<String>,
        }

        serde_json::from_slice::<IdOnly>(json).ok()?.id
    }

    /// Splits a received reply into the message or its protocol error.
    pub fn into_result(self) -> Result<Self, WsError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
    use crate::messages::ProbeRequest;

    #[test]
    fn wire_shape() {
        let req = ProbeRequest {
            fingerprint: "0cc175b9c0f1b6a831c399e269772661".into(),
            extension: Some("mp4".into()),
            size: Some(256_000),
            total_chunks: Some(3),
        };
        let msg = Message::new("m1", MessageType::ProbeChunks, Some(&req)).unwrap();
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "probe_chunks");
        assert_eq!(value["payload"]["totalChunks"], 3);
        assert!(value.get("error").is_none());
        assert_eq!(msg.parse_payload::<ProbeRequest>().unwrap(), Some(req));
    }

    #[test]
    fn bare_message_has_no_payload() {
        let json = r#"{"id":"p1","type":"ping"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg_type, MessageType::Ping);
        assert_eq!(msg.parse_payload::<ProbeRequest>().unwrap(), None);
        assert_eq!(serde_json::to_string(&msg).unwrap(), json);
    }

    #[test]
    fn mistyped_payload_is_an_error() {
        let msg = Message::new("m2", MessageType::MergeChunks, Some(&"not an object")).unwrap();
        assert!(msg.parse_payload::<ProbeRequest>().is_err());
    }

    #[test]
    fn replies_keep_request_id() {
        let req = Message::new::<()>("req-42", MessageType::MergeChunks, None).unwrap();

        let ok = req.reply(MessageType::MergeResult, Some(&serde_json::json!({}))).unwrap();
        assert_eq!(ok.id, "req-42");
        assert!(ok.into_result().is_ok());

        let err = req
            .reply_error(WS_ERR_CODE_NOT_IMPLEMENTED, "unsupported")
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, WS_ERR_CODE_NOT_IMPLEMENTED);
        assert_eq!(err.to_string(), "unsupported (code 501)");
    }

    #[test]
    fn id_survives_undecodable_envelope() {
        assert_eq!(
            Message::peek_id(br#"{"id":"t-3","type":42}"#).as_deref(),
            Some("t-3")
        );
        assert_eq!(Message::peek_id(br#"{"type":"ping"}"#), None);
        assert_eq!(Message::peek_id(b"not json"), None);
    }
}
