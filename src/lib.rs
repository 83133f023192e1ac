//! src/lib.rs
//!
//! A SWIM-based gossip cluster-membership library: eventually-consistent
//! failure detection and metadata dissemination over UDP, with TCP
//! push/pull anti-entropy to catch whatever gossip missed.

pub mod anti_entropy;
pub mod app;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod delegate;
pub mod error;
pub mod failure_detector;
pub mod gossip;
pub mod keyring;
pub mod membership;
pub mod node;
pub mod transport;

pub use app::Core;
pub use config::Config;
pub use delegate::{ConflictDelegate, Delegate, EventDelegate, MergeDelegate, NoopDelegate, NoopEventDelegate};
pub use error::Error;
pub use node::{Node, NodeName, NodeStateKind};
