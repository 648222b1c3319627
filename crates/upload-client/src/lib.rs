//! Client side of the slicedrop chunked upload protocol.
//!
//! An [`UploadSession`] drives one file through
//! `Hashing → Probing → Uploading → Merging → Done | Failed`. It talks to
//! the server through the [`UploadConnection`] trait, which [`WsClient`]
//! implements over WebSocket; tests substitute in-process connections.
//!
//! # Resume
//!
//! The probe reports which chunk indices the server already staged for the
//! file's fingerprint. Only the others are sent. A session that fails or is
//! cancelled leaves the staged chunks in place, so the next session for
//! the same bytes picks up where this one stopped.

pub mod connection;
pub mod error;
mod pumps;
pub mod session;
pub mod source;
pub mod types;
pub mod ws_client;

pub use connection::UploadConnection;
pub use error::{ClientError, Recovery, SessionError, SessionErrorKind};
pub use session::UploadSession;
pub use source::{ByteSource, FileSource, MemorySource};
pub use types::{SessionConfig, SessionEvent, SessionPhase, UploadOutcome};
pub use ws_client::WsClient;
