//! In-memory [`KVVStore`], for tests and stateless deployments.

use std::collections::BTreeMap;
use std::sync::Mutex;

use lightning_switch::persist::Error;
use lightning_switch::prelude::SendSync;
use log::*;

use crate::kvv::{KVVPersister, KVVStore, KVV};

/// A key-version-value in-memory store
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create a new MemoryKVVStore wrapped in a persister
    pub fn new() -> KVVPersister<Self> {
        KVVPersister(Self { data: Mutex::new(BTreeMap::new()) })
    }
}

impl SendSync for MemoryKVVStore {}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        if let Some((ver, val)) = data.get(key) {
            if version < *ver {
                error!("version mismatch for {}: {} < {}", key, version, ver);
                // version cannot go backwards
                return Err(Error::VersionMismatch);
            } else if version == *ver {
                // if same version, value must not have changed
                if val != value {
                    error!("value mismatch for {} at version {}", key, version);
                    return Err(Error::VersionMismatch);
                }
                return Ok(());
            }
        }
        data.insert(key.to_string(), (version, value.to_vec()));
        Ok(())
    }

    fn put_batch(&self, kvvs: &[KVV]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        for kvv in kvvs.iter() {
            let key = &kvv.0;
            let (version, value) = &kvv.1;
            if let Some((ver, val)) = data.get(key) {
                if version < ver {
                    error!("version mismatch for {}: {} < {}", key, version, ver);
                    return Err(Error::VersionMismatch);
                } else if version == ver && val != value {
                    error!("value mismatch for {} at version {}", key, version);
                    return Err(Error::VersionMismatch);
                }
            }
        }
        for kvv in kvvs.iter() {
            data.insert(kvv.0.clone(), kvv.1.clone());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.data.lock().unwrap().get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data.lock().unwrap();
        let mut result = Vec::new();
        for (k, (ver, value)) in data.range(prefix.to_string()..) {
            if k.starts_with(prefix) {
                result.push(KVV(k.clone(), (*ver, value.clone())));
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
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn versioning_test() {
        let store = MemoryKVVStore::new();
        store.put("a", b"1").unwrap();
        store.put("a", b"2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some((1, b"2".to_vec())));
        assert_eq!(store.put_with_version("a", 0, b"stale"), Err(Error::VersionMismatch));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), Some((2, Vec::new())));
    }

    #[test_log::test]
    fn prefix_scan_test() {
        let store = MemoryKVVStore::new();
        store.put("channel/aa", b"1").unwrap();
        store.put("channel/bb", b"2").unwrap();
        store.put("circuit/aa", b"3").unwrap();
        let keys: Vec<String> =
            store.get_prefix("channel/").unwrap().map(|kvv| kvv.0).collect();
        assert_eq!(keys, vec!["channel/aa".to_string(), "channel/bb".to_string()]);
    }

    #[test_log::test]
    fn batch_atomicity_test() {
        let store = MemoryKVVStore::new();
        store.put("a", b"1").unwrap();
        let kvvs = vec![
            KVV("a".to_string(), (0, b"stale".to_vec())),
            KVV("b".to_string(), (0, b"new".to_vec())),
        ];
        assert_eq!(store.put_batch(&kvvs), Err(Error::VersionMismatch));
        // nothing was applied
        assert_eq!(store.get("b").unwrap(), None);
    }
}
