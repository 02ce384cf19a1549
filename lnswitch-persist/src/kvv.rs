//! The key-version-value abstraction and the [`Persist`] adapter.
//!
//! Keys are flat strings with `/`-separated components; values are
//! serde_json blobs prefixed by a version counter.  Deleting writes an
//! empty tombstone value so the version history of a key survives its
//! removal.

/// In-memory store
pub mod memory;
#[cfg(feature = "redb-kvv")]
pub mod redb;

use core::fmt::Debug;
use core::ops::Deref;

use lightning_switch::channel::ChannelId;
use lightning_switch::circuit::{CircuitEntry, CircuitKey};
use lightning_switch::persist::{ChannelEntry, Error, Persist};
use lightning_switch::prelude::SendSync;
use serde_json::{from_slice, to_vec};

const CHANNEL_PREFIX: &str = "channel";
const CIRCUIT_PREFIX: &str = "circuit";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&self.1 .1).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store
pub trait KVVStore: SendSync {
    /// Iterator over a key range
    type Iter: Iterator<Item = KVV>;

    /// Put a key-value pair into the store, assigning the next version
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;
    /// If the key already exists, the version must not be lower than the
    /// existing version.  An equal version must carry an identical value.
    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error>;
    /// Atomically put several KVVs into the store
    fn put_batch(&self, kvvs: &[KVV]) -> Result<(), Error>;
    /// Get a key-value pair from the store.
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store.
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Delete a key-value pair from the store, leaving a tombstone
    fn delete(&self, key: &str) -> Result<(), Error>;
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Adapter for a KVVStore to implement Persist.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> SendSync for KVVPersister<S> {}

impl<S: KVVStore> KVVPersister<S> {
    // a tombstoned key counts as absent
    fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(matches!(self.get(key)?, Some((_, v)) if !v.is_empty()))
    }
}

impl<S: KVVStore> Persist for KVVPersister<S> {
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        let key = channel_key(id);
        if self.exists(&key)? {
            return Err(Error::AlreadyExists(format!("channel {}", id)));
        }
        self.put(&key, &serialize(entry)?)
    }

    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        self.put(&channel_key(id), &serialize(entry)?)
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error> {
        let prefix = CHANNEL_PREFIX.to_string() + SEPARATOR;
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue; // ignore tombstones
            }
            let id = channel_id_from_key(&prefix, &key)?;
            let entry: ChannelEntry = deserialize(&value)?;
            res.push((id, entry));
        }
        Ok(res)
    }

    fn open_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        let skey = circuit_key(key);
        if self.exists(&skey)? {
            return Err(Error::AlreadyExists(format!("circuit {}", key)));
        }
        self.put(&skey, &serialize(entry)?)
    }

    fn update_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        let skey = circuit_key(key);
        if !self.exists(&skey)? {
            return Err(Error::NotFound(format!("circuit {}", key)));
        }
        self.put(&skey, &serialize(entry)?)
    }

    fn remove_circuit(&self, key: &CircuitKey) -> Result<(), Error> {
        let skey = circuit_key(key);
        if !self.exists(&skey)? {
            return Err(Error::NotFound(format!("circuit {}", key)));
        }
        self.delete(&skey)
    }

    fn get_circuits(&self) -> Result<Vec<(CircuitKey, CircuitEntry)>, Error> {
        let prefix = CIRCUIT_PREFIX.to_string() + SEPARATOR;
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (_key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue; // ignore tombstones
            }
            let entry: CircuitEntry = deserialize(&value)?;
            res.push((entry.incoming, entry));
        }
        Ok(res)
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    to_vec(value).map_err(|e| Error::SerdeError(e.to_string()))
}

fn deserialize<T: serde::de::DeserializeOwned>(value: &[u8]) -> Result<T, Error> {
    from_slice(value).map_err(|e| Error::SerdeError(e.to_string()))
}

fn channel_key(id: &ChannelId) -> String {
    format!("{}/{}", CHANNEL_PREFIX, hex::encode(id.0))
}

fn circuit_key(key: &CircuitKey) -> String {
    format!("{}/{}/{:016x}", CIRCUIT_PREFIX, hex::encode(key.channel_id.0), key.htlc_id)
}

fn channel_id_from_key(prefix: &str, key: &str) -> Result<ChannelId, Error> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Internal(format!("key {} outside prefix {}", key, prefix)))?;
    let bytes =
        hex::decode(suffix).map_err(|_| Error::Internal(format!("bad hex in key {}", key)))?;
    let arr: [u8; 32] =
        bytes.try_into().map_err(|_| Error::Internal(format!("bad id length in key {}", key)))?;
    Ok(ChannelId::new(arr))
}
