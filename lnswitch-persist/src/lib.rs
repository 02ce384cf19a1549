//! Durable storage backends for the switch engine.
//!
//! Everything is built on a small key-version-value abstraction
//! ([`kvv::KVVStore`]).  Values carry a monotonic version so that a
//! stale process resuming after a crash cannot silently roll state
//! backwards; a write with a lower version than the stored one is
//! rejected.  [`kvv::KVVPersister`] adapts any store to the engine's
//! [`lightning_switch::persist::Persist`] trait.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

/// Key-version-value storage
pub mod kvv;

pub use kvv::{KVVPersister, KVVStore, KVV};
