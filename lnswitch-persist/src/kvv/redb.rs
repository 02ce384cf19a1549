//! [`KVVStore`] backed by redb, a single-file embedded database.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use lightning_switch::persist::Error;
use lightning_switch::prelude::SendSync;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::*;

use crate::kvv::{KVVPersister, KVVStore, KVV};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kvv");

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// A key-version-value store backed by redb
pub struct RedbKVVStore {
    db: Database,
    // current version of each key, so versioned writes don't need a
    // read transaction on the hot path
    versions: Mutex<BTreeMap<String, u64>>,
}

impl SendSync for RedbKVVStore {}

impl RedbKVVStore {
    /// Open or create the database in `path`, wrapped in a persister
    pub fn new<P: AsRef<Path>>(path: P) -> KVVPersister<Self> {
        KVVPersister(Self::new_store(path))
    }

    /// Open or create the database in `path`
    pub fn new_store<P: AsRef<Path>>(path: P) -> RedbKVVStore {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir(path).expect("failed to create directory");
        }
        assert!(path.is_dir(), "{} is not a directory", path.display());
        let mut db = Database::create(path.join("redb")).unwrap();
        db.check_integrity().expect("database integrity check failed");
        {
            // create the table if it doesn't exist
            let tx = db.begin_write().unwrap();
            tx.open_table(TABLE).unwrap();
            tx.commit().unwrap();
        }

        let mut versions = BTreeMap::new();
        {
            // load the current versions
            let tx = db.begin_read().unwrap();
            let table = tx.open_table(TABLE).unwrap();
            for item in table.iter().unwrap() {
                let (key, vv) = item.expect("failed to iterate");
                let (version, _) = Self::decode_vv(vv.value());
                versions.insert(key.value().to_string(), version);
            }
        }

        Self { db, versions: Mutex::new(versions) }
    }

    fn decode_vv(vv: &[u8]) -> (u64, Vec<u8>) {
        let version = u64::from_be_bytes(vv[..8].try_into().unwrap());
        let value = vv[8..].to_vec();
        (version, value)
    }

    fn encode_vv(version: u64, value: &[u8]) -> Vec<u8> {
        let mut vv = Vec::with_capacity(value.len() + 8);
        vv.extend_from_slice(&version.to_be_bytes());
        vv.extend_from_slice(value);
        vv
    }
}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let version = self.versions.lock().unwrap().get(key).map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error> {
        let vv = Self::encode_vv(version, value);
        let mut versions = self.versions.lock().unwrap();

        if let Some(v) = versions.get(key) {
            if version < *v {
                error!("version mismatch for {}: {} < {}", key, version, v);
                // version cannot go backwards
                return Err(Error::VersionMismatch);
            } else if version == *v {
                // if same version, value must not have changed
                let tx = self.db.begin_read().unwrap();
                let table = tx.open_table(TABLE).unwrap();
                let existing = table.get(key).expect("failed to get").unwrap();
                if existing.value() != vv.as_slice() {
                    error!("value mismatch for {} at version {}", key, version);
                    return Err(Error::VersionMismatch);
                }
                return Ok(());
            }
        }
        let tx = self.db.begin_write().unwrap();
        {
            let mut table = tx.open_table(TABLE).unwrap();
            table.insert(key, vv.as_slice()).expect("failed to insert");
        }
        tx.commit().unwrap();
        versions.insert(key.to_string(), version);
        Ok(())
    }

    fn put_batch(&self, kvvs: &[KVV]) -> Result<(), Error> {
        let tx = self.db.begin_write().unwrap();
        let mut table = tx.open_table(TABLE).unwrap();
        let mut found_version_mismatch = false;
        let mut staged_versions: BTreeMap<String, u64> = BTreeMap::new();
        let mut versions = self.versions.lock().unwrap();

        for kvv in kvvs.iter() {
            let (key, (version, value)) = (kvv.0.as_str(), (&kvv.1 .0, &kvv.1 .1));
            let vv = Self::encode_vv(*version, value);
            if let Some(v) = versions.get(key) {
                if version < v {
                    error!("version mismatch for {}: {} < {}", key, version, v);
                    found_version_mismatch = true;
                    continue;
                } else if version == v {
                    // if same version, value must not have changed
                    let existing = table.get(key).expect("failed to get").unwrap();
                    if existing.value() != vv.as_slice() {
                        error!("value mismatch for {} at version {}", key, version);
                        found_version_mismatch = true;
                    }
                    continue;
                }
            }
            table.insert(key, vv.as_slice()).expect("failed to insert");
            staged_versions.insert(key.to_string(), *version);
        }
        drop(table);
        if found_version_mismatch {
            // be explicit about aborting the transaction
            tx.abort().unwrap();
            return Err(Error::VersionMismatch);
        }
        tx.commit().unwrap();
        for (key, version) in staged_versions.into_iter() {
            versions.insert(key, version);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = key))]
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let tx = self.db.begin_read().unwrap();
        let table = tx.open_table(TABLE).unwrap();
        let result = table.get(key).expect("failed to get");
        if let Some(vv) = result {
            let (version, value) = Self::decode_vv(vv.value());
            Ok(Some((version, value)))
        } else {
            Ok(None)
        }
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions.lock().unwrap().get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let tx = self.db.begin_read().unwrap();
        let table = tx.open_table(TABLE).unwrap();
        let mut result = Vec::new();
        for item in table.range(prefix..).unwrap() {
            let (key, vv) = item.expect("failed to iterate");
            if key.value().starts_with(prefix) {
                let (version, value) = Self::decode_vv(vv.value());
                result.push(KVV(key.value().to_string(), (version, value)));
            } else {
                break;
            }
        }
        Ok(Iter(result.into_iter()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, &[])
    }

    fn clear_database(&self) -> Result<(), Error> {
        let tx = self.db.begin_write().unwrap();
        {
            let mut table = tx.open_table(TABLE).unwrap();
            table.retain(|_, _| false).unwrap();
        }
        tx.commit().unwrap();
        self.versions.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightning_switch::channel::ResolutionResult;
    use lightning_switch::circuit::{CircuitEntry, CircuitKey};
    use lightning_switch::persist::Persist;
    use lightning_switch::util::test_utils::*;

    #[test_log::test]
    fn basic_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new(tempdir.path());
        store.put("foo1", b"bar")?;
        store.put("foo2", b"boo")?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 0);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar");
        store.put_with_version("foo1", 1, b"bar2")?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        store.put_with_version("foo1", 1, b"bar2")?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar2");

        // wrong version
        assert!(store.put_with_version("foo1", 0, b"bar2").is_err());
        Ok(())
    }

    #[test_log::test]
    fn put_batch_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new(tempdir.path());
        let kvvs = vec![
            KVV("foo1".to_string(), (0, b"bar".to_vec())),
            KVV("foo1".to_string(), (0, b"bar".to_vec())),
            KVV("foo2".to_string(), (0, b"bar".to_vec())),
        ];
        assert!(store.put_batch(&kvvs).is_ok());
        let kvvs = vec![
            KVV("foo1".to_string(), (1, b"bar2".to_vec())),
            KVV("foo2".to_string(), (0, b"bar3".to_vec())),
        ];
        assert!(store.put_batch(&kvvs).is_err());
        // the aborted batch left both keys untouched
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar");
        assert_eq!(store.get("foo2")?.unwrap().1, b"bar");
        store.put_with_version("foo1", 1, b"bar3")?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar3");
        Ok(())
    }

    #[test_log::test]
    fn versions_survive_reopen_test() {
        let tempdir = tempfile::tempdir().unwrap();
        {
            let store = RedbKVVStore::new(tempdir.path());
            store.put("foo", b"a").unwrap();
            store.put("foo", b"b").unwrap();
        }
        let store = RedbKVVStore::new(tempdir.path());
        assert_eq!(store.get_version("foo").unwrap(), Some(1));
        // a stale writer from before the restart is still rejected
        assert_eq!(store.put_with_version("foo", 0, b"stale"), Err(Error::VersionMismatch));
    }

    #[test_log::test]
    fn circuits_survive_reopen_test() {
        let tempdir = tempfile::tempdir().unwrap();
        let key = CircuitKey { channel_id: test_channel_id(1), htlc_id: 3 };
        let entry = CircuitEntry {
            incoming: key,
            outgoing: Some(CircuitKey { channel_id: test_channel_id(2), htlc_id: 0 }),
            payment_hash: test_payment_hash(1),
            incoming_amount_msat: 10_000,
            outgoing_amount_msat: 9_000,
            obfuscation_key: [7; 32],
            resolution: Some(ResolutionResult::Settled { preimage: test_preimage(9) }),
        };
        {
            let persister = RedbKVVStore::new(tempdir.path());
            persister.open_circuit(&key, &entry).unwrap();
        }
        let persister = RedbKVVStore::new(tempdir.path());
        let circuits = persister.get_circuits().unwrap();
        assert_eq!(circuits, vec![(key, entry)]);
    }
}
