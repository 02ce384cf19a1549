#![crate_name = "lightning_switch"]

//! The HTLC forwarding and channel-commitment engine for a Lightning node.
//!
//! See [`switch::Switch`] for the entry point.  Each channel is owned by a
//! [`link::Link`] task which drives the per-channel commitment protocol in
//! [`channel::Channel`]; in-flight forwards between two links are recorded
//! durably in the [`circuit::CircuitMap`].

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub use bitcoin;

/// Commitment state machine
pub mod channel;
/// Durable in-flight forwarding ledger
pub mod circuit;
/// Typed configuration for the engine
pub mod config;
/// Onion failure taxonomy and obfuscation
pub mod failure;
/// Per-channel actor
pub mod link;
/// Per-link backpressure queue
pub mod mailbox;
/// Persistence traits and models
pub mod persist;
/// External signer interface
pub mod sign;
/// Cross-link routing
pub mod switch;
/// Various utilities
pub mod util;
/// BOLT wire messages
pub mod wire;

pub use std::sync::{Arc, Weak};

/// Commonly used collection and sync aliases
pub mod prelude {
    pub use std::collections::HashMap as Map;
    pub use std::collections::HashSet as UnorderedSet;

    pub use std::collections::BTreeMap as OrderedMap;
    pub use std::collections::BTreeSet as OrderedSet;

    pub use std::sync::{Arc, Mutex, MutexGuard, Weak};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;

#[cfg(test)]
mod commitment_exchange_tests;
