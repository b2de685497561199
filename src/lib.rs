//! wsync library
//!
//! One host serves its numbered content folders; clients compare the host's
//! manifest against local Assets/Mods roots and pull what differs.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod delete;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod manifest;
pub mod plan;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod sync;
pub mod url;
pub mod worker;

pub use client::ClientSession;
pub use error::{Result, SyncError};
pub use manifest::{FileDescriptor, FileKind, Manifest};
pub use plan::{Destination, LocalRoots, Overrides};
pub use server::Server;
