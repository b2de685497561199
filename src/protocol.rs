//! Shared protocol constants and message shapes for the wsync transport
//!
//! Every message is a JSON object tagged by its `action` field, sent as
//! `len: u32 BE | payload`. Raw file bodies follow a FILE header as
//! `len: u64 BE | bytes`.

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

pub const DEFAULT_PORT: u16 = 47017;

// Raw file bodies are streamed in chunks of this size
pub const FILE_CHUNK_SIZE: usize = 256 * 1024;

// Maximum message payload (256MB) - a manifest of a large content tree
// still fits, a corrupt length prefix does not allocate unbounded memory
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;

    // Default interval between auto-reconnect attempts (s)
    pub const RECONNECT_INTERVAL_SECS: u64 = 10;
}

/// Action tags as they appear on the wire
pub mod action {
    pub const INDEX: &str = "INDEX";
    pub const REQUEST_FILES: &str = "REQUEST_FILES";
    pub const FILE: &str = "FILE";
    pub const DONE: &str = "DONE";

    pub const ALL: [&str; 4] = [INDEX, REQUEST_FILES, FILE, DONE];
}

/// The closed set of messages exchanged between host and client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Host -> client, sent once right after accept
    Index { entries: Manifest },
    /// Client -> host, a batch of manifest entries to stream back
    RequestFiles { files: Manifest },
    /// Host -> client, header preceding one raw file body
    File {
        rel_folder: String,
        name: String,
        size: u64,
    },
    /// Host -> client, end of a REQUEST_FILES batch
    Done,
}

impl Message {
    pub fn action(&self) -> &'static str {
        match self {
            Message::Index { .. } => action::INDEX,
            Message::RequestFiles { .. } => action::REQUEST_FILES,
            Message::File { .. } => action::FILE,
            Message::Done => action::DONE,
        }
    }
}
