//! The durable ledger of in-flight forwards.
//!
//! A circuit pairs the incoming HTLC on one link with the outgoing HTLC
//! on another.  Every circuit is written durably before the outgoing add
//! goes to the wire, and its terminal resolution is written before the
//! backward settle or fail is delivered, so a restart replays each
//! forward to exactly one outcome.

use core::fmt;

use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};
use log::*;

use crate::channel::{ChannelId, PaymentHash, ResolutionResult};
use crate::persist::{Error, Persist};
use crate::prelude::*;

/// Identifies one HTLC on one channel
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitKey {
    /// The channel
    pub channel_id: ChannelId,
    /// The offerer-assigned HTLC id on that channel
    pub htlc_id: u64,
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.htlc_id)
    }
}

/// A single in-flight forward
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitEntry {
    /// The incoming HTLC, the circuit's identity
    pub incoming: CircuitKey,
    /// The outgoing HTLC, recorded once its id is assigned
    pub outgoing: Option<CircuitKey>,
    /// Payment hash of both legs
    pub payment_hash: PaymentHash,
    /// Amount of the incoming HTLC
    pub incoming_amount_msat: u64,
    /// Amount of the outgoing HTLC, the difference is the fee
    pub outgoing_amount_msat: u64,
    /// Key for obfuscating failure reasons relayed backward over this hop
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub obfuscation_key: [u8; 32],
    /// Terminal outcome of the outgoing leg, recorded before the backward
    /// message is delivered
    pub resolution: Option<ResolutionResult>,
}

/// Result of an open attempt
#[derive(Debug, PartialEq)]
pub enum OpenOutcome {
    /// The circuit was created and is durable
    Opened,
    /// The circuit already existed, a retransmission
    Duplicate,
}

#[derive(Default)]
struct CircuitMapInner {
    circuits: OrderedMap<CircuitKey, CircuitEntry>,
    // outgoing key to incoming key
    index: Map<CircuitKey, CircuitKey>,
    // closed circuits are never reopened
    closed: OrderedSet<CircuitKey>,
}

/// The in-memory circuit index over durable storage.
///
/// The lock is held across the persister write on open, so two
/// concurrent opens of the same key serialize and exactly one creates
/// the circuit.
pub struct CircuitMap {
    inner: Mutex<CircuitMapInner>,
    persister: Arc<dyn Persist>,
}

impl CircuitMap {
    /// Load the map from durable storage
    pub fn restore(persister: Arc<dyn Persist>) -> Result<Self, Error> {
        let mut inner = CircuitMapInner::default();
        for (key, entry) in persister.get_circuits()? {
            if let Some(outgoing) = entry.outgoing {
                inner.index.insert(outgoing, key);
            }
            inner.circuits.insert(key, entry);
        }
        info!("restored {} in-flight circuits", inner.circuits.len());
        Ok(CircuitMap { inner: Mutex::new(inner), persister })
    }

    fn lock(&self) -> MutexGuard<'_, CircuitMapInner> {
        self.inner.lock().expect("circuit map poisoned")
    }

    /// Open a circuit for an incoming HTLC.
    ///
    /// Durable when this returns `Opened`.  Opening an existing circuit
    /// is an idempotent `Duplicate`; opening a closed one is an error.
    pub fn open_circuit(&self, entry: CircuitEntry) -> Result<OpenOutcome, Error> {
        let key = entry.incoming;
        let mut inner = self.lock();
        if inner.closed.contains(&key) {
            return Err(Error::AlreadyExists(format!("circuit {} was closed", key)));
        }
        if inner.circuits.contains_key(&key) {
            return Ok(OpenOutcome::Duplicate);
        }
        self.persister.open_circuit(&key, &entry)?;
        if let Some(outgoing) = entry.outgoing {
            inner.index.insert(outgoing, key);
        }
        inner.circuits.insert(key, entry);
        debug!("opened circuit {}", key);
        Ok(OpenOutcome::Opened)
    }

    /// Record the outgoing leg once the downstream link assigned an id
    pub fn set_outgoing(&self, incoming: &CircuitKey, outgoing: CircuitKey) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .circuits
            .get_mut(incoming)
            .ok_or_else(|| Error::NotFound(format!("circuit {}", incoming)))?;
        entry.outgoing = Some(outgoing);
        let entry = entry.clone();
        self.persister.update_circuit(incoming, &entry)?;
        inner.index.insert(outgoing, *incoming);
        Ok(())
    }

    /// Record the terminal outcome of a circuit, durably, returning the
    /// updated entry for backward delivery
    pub fn record_resolution(
        &self,
        incoming: &CircuitKey,
        resolution: ResolutionResult,
    ) -> Result<CircuitEntry, Error> {
        let mut inner = self.lock();
        let entry = inner
            .circuits
            .get_mut(incoming)
            .ok_or_else(|| Error::NotFound(format!("circuit {}", incoming)))?;
        entry.resolution = Some(resolution);
        let entry = entry.clone();
        self.persister.update_circuit(incoming, &entry)?;
        Ok(entry)
    }

    /// Remove a fully resolved circuit.
    ///
    /// Called when the incoming leg's settle or fail is finalized by a
    /// revocation; a closed key can never be opened again.
    pub fn close_circuit(&self, incoming: &CircuitKey) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .circuits
            .remove(incoming)
            .ok_or_else(|| Error::NotFound(format!("circuit {}", incoming)))?;
        if let Some(outgoing) = entry.outgoing {
            inner.index.remove(&outgoing);
        }
        inner.closed.insert(*incoming);
        self.persister.remove_circuit(incoming)?;
        debug!("closed circuit {}", incoming);
        Ok(())
    }

    /// True if this incoming key already ran to completion
    pub fn is_closed(&self, incoming: &CircuitKey) -> bool {
        self.lock().closed.contains(incoming)
    }

    /// Look up a circuit by its incoming key
    pub fn get(&self, incoming: &CircuitKey) -> Option<CircuitEntry> {
        self.lock().circuits.get(incoming).cloned()
    }

    /// Look up the incoming key for an outgoing leg
    pub fn lookup_incoming(&self, outgoing: &CircuitKey) -> Option<CircuitKey> {
        self.lock().index.get(outgoing).copied()
    }

    /// Circuits whose outgoing resolution was recorded but whose incoming
    /// leg is not yet finalized, the restart replay set
    pub fn unresolved_backward(&self) -> Vec<CircuitEntry> {
        self.lock()
            .circuits
            .values()
            .filter(|e| e.resolution.is_some())
            .cloned()
            .collect()
    }

    /// Keys of circuits with no recorded resolution yet
    pub fn open_keys(&self) -> Vec<CircuitKey> {
        self.lock()
            .circuits
            .values()
            .filter(|e| e.resolution.is_none())
            .map(|e| e.incoming)
            .collect()
    }

    /// Number of in-flight circuits
    pub fn pending_count(&self) -> usize {
        self.lock().circuits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::*;

    fn entry(chan: u8, id: u64) -> CircuitEntry {
        CircuitEntry {
            incoming: CircuitKey { channel_id: test_channel_id(chan), htlc_id: id },
            outgoing: None,
            payment_hash: test_payment_hash(9),
            incoming_amount_msat: 1_000_000,
            outgoing_amount_msat: 999_000,
            obfuscation_key: [3; 32],
            resolution: None,
        }
    }

    #[test]
    fn open_is_idempotent_test() {
        let map = CircuitMap::restore(Arc::new(MemoryPersister::new())).unwrap();
        assert_eq!(map.open_circuit(entry(1, 0)).unwrap(), OpenOutcome::Opened);
        assert_eq!(map.open_circuit(entry(1, 0)).unwrap(), OpenOutcome::Duplicate);
        assert_eq!(map.pending_count(), 1);
    }

    #[test]
    fn closed_circuit_never_reopens_test() {
        let map = CircuitMap::restore(Arc::new(MemoryPersister::new())).unwrap();
        let e = entry(1, 0);
        let key = e.incoming;
        map.open_circuit(e.clone()).unwrap();
        assert!(!map.is_closed(&key));
        map.close_circuit(&key).unwrap();
        assert!(map.is_closed(&key));
        assert!(matches!(map.open_circuit(e).unwrap_err(), Error::AlreadyExists(_)));
    }

    #[test]
    fn concurrent_duplicate_open_test() {
        let map = Arc::new(CircuitMap::restore(Arc::new(MemoryPersister::new())).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || map.open_circuit(entry(1, 0)).unwrap()));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let opened = outcomes.iter().filter(|o| **o == OpenOutcome::Opened).count();
        assert_eq!(opened, 1);
        assert_eq!(map.pending_count(), 1);
    }

    #[test]
    fn resolution_recorded_before_delivery_test() {
        let persister = Arc::new(MemoryPersister::new());
        let map = CircuitMap::restore(persister.clone() as Arc<dyn crate::persist::Persist>).unwrap();
        let e = entry(1, 0);
        let outgoing = CircuitKey { channel_id: test_channel_id(2), htlc_id: 7 };
        map.open_circuit(e.clone()).unwrap();
        map.set_outgoing(&e.incoming, outgoing).unwrap();
        assert_eq!(map.lookup_incoming(&outgoing), Some(e.incoming));
        let updated = map
            .record_resolution(&e.incoming, ResolutionResult::Failed { reason: vec![1, 2] })
            .unwrap();
        assert!(updated.resolution.is_some());
        assert!(map.open_keys().is_empty());

        // a restart sees the recorded resolution
        let restored = CircuitMap::restore(persister).unwrap();
        assert_eq!(restored.unresolved_backward().len(), 1);
    }

    #[test]
    fn restore_rebuilds_outgoing_index_test() {
        let persister = Arc::new(MemoryPersister::new());
        let map = CircuitMap::restore(persister.clone() as Arc<dyn crate::persist::Persist>).unwrap();
        let e = entry(1, 3);
        let outgoing = CircuitKey { channel_id: test_channel_id(2), htlc_id: 11 };
        map.open_circuit(e.clone()).unwrap();
        map.set_outgoing(&e.incoming, outgoing).unwrap();

        let restored = CircuitMap::restore(persister).unwrap();
        assert_eq!(restored.lookup_incoming(&outgoing), Some(e.incoming));
    }
}
