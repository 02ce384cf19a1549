//! Persistence traits.
//!
//! The engine writes channel commitment state and in-flight circuits
//! through [`Persist`]; a store backs the trait with a database (see the
//! companion persist crate) or with memory for tests.  Writes must be
//! durable when the call returns: the caller sequences them before
//! releasing signatures or wire messages, and that ordering is what makes
//! restart recovery sound.

use core::fmt;

use crate::channel::ChannelId;
use crate::circuit::{CircuitEntry, CircuitKey};
use crate::prelude::*;

/// Serializable persistence models
pub mod model;

pub use model::ChannelEntry;

/// Persister error
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Persistence is unavailable or corrupted
    Internal(String),
    /// The entry does not exist
    NotFound(String),
    /// The entry already exists
    AlreadyExists(String),
    /// A versioned write went backwards, another writer is active
    VersionMismatch,
    /// Serialization failed
    SerdeError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// Durable storage for channels and circuits.
///
/// Implementations must be safe to call from multiple link tasks; each
/// individual call is atomic.
pub trait Persist: SendSync {
    /// Create a channel entry, failing if it exists
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error>;

    /// Update a channel entry
    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error>;

    /// Fetch all channel entries
    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error>;

    /// Create a circuit entry, failing if it exists.
    ///
    /// The entry must be durable when this returns; the switch will not
    /// forward before then.
    fn open_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error>;

    /// Update a circuit entry
    fn update_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error>;

    /// Remove a circuit entry
    fn remove_circuit(&self, key: &CircuitKey) -> Result<(), Error>;

    /// Fetch all circuit entries
    fn get_circuits(&self) -> Result<Vec<(CircuitKey, CircuitEntry)>, Error>;
}

/// A no-op persister for stateless deployments and benchmarks
pub struct DummyPersister;

impl SendSync for DummyPersister {}

#[allow(unused_variables)]
impl Persist for DummyPersister {
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        Ok(())
    }

    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        Ok(())
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error> {
        Ok(Vec::new())
    }

    fn open_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        Ok(())
    }

    fn update_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        Ok(())
    }

    fn remove_circuit(&self, key: &CircuitKey) -> Result<(), Error> {
        Ok(())
    }

    fn get_circuits(&self) -> Result<Vec<(CircuitKey, CircuitEntry)>, Error> {
        Ok(Vec::new())
    }
}
