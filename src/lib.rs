//! treesync library
//!
//! One-way directory mirroring between peers: a server publishes a snapshot
//! digest of its tree, clients fetch metadata and changed files when it moves.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod message;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod reassembly;
pub mod server;
pub mod session;
pub mod snapshot;
