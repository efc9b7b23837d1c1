//! Watermark-driven connection manager for libp2p nodes.
//!
//! Tracks every live connection per peer, ranks peers by the sum of their
//! tags and closes the least valuable connections once the connection count
//! passes the high watermark, down to the low watermark.
//!
//! - [`ConnManager`] - tagging, protection, trimming and the notification sink
//! - [`ConnManagerBehaviour`] - libp2p `NetworkBehaviour` driving a [`ConnManager`]
//! - [`ConnManagerConfig`] / [`ConnManagerArgs`] - configuration and CLI flags
//! - [`ProtocolBook`] - per-peer protocol lookup used for protocol minimums

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod driver;
mod manager;
mod metrics;
mod protect;
mod trim;

pub mod args;
pub mod behaviour;
pub mod book;
pub mod config;
pub mod registry;
pub mod traits;

#[cfg(test)]
mod test_utils;

pub use args::{ConnManagerArgs, ProtocolMinimum};
pub use behaviour::{CloseRequest, ConnManagerBehaviour, SwarmConnManager, SwarmConnection};
pub use book::MemoryProtocolBook;
pub use config::{ConfigError, ConnManagerConfig};
pub use manager::{ConnManager, ConnManagerStatus};
pub use registry::{ConnectionInfo, SEGMENT_COUNT, TagInfo};
pub use traits::{ConnectionHandle, ConnectionNotifiee, ProtocolBook, ProtocolBookError};
pub use trim::{TrimOutcome, TrimSkipReason};
