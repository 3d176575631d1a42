//! Key-value storage contract and in-memory engine.
//!
//! The core never talks to a concrete database; everything goes through
//! [`KvStore`]. The contract is deliberately small: point operations,
//! prefix-ordered iteration, an atomic write batch and an atomic
//! delete-by-prefix. Any engine offering those can back a node.

use opweave_types::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// One operation inside a [`WriteBatch`].
#[derive(Clone, Debug)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered set of mutations applied atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The storage collaborator contract.
///
/// Implementations must apply [`KvStore::write`] and
/// [`KvStore::delete_prefix`] atomically with respect to readers.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Remove every entry under `prefix` atomically; returns the count.
    fn delete_prefix(&self, prefix: &[u8]) -> Result<usize>;
}

/// In-memory [`KvStore`] over a `BTreeMap`, giving ordered iteration for
/// free. Suitable for tests, simulation and as the reference semantics a
/// durable engine must match.
#[derive(Debug, Default)]
pub struct MemKv {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        MemKv {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    // Upper bound: prefix with its last non-0xff byte incremented.
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xff {
            end.pop();
        } else {
            *end.last_mut().unwrap() = last + 1;
            return (prefix.to_vec(), Some(end));
        }
    }
    (prefix.to_vec(), None)
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.inner.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.inner.read();
        let (start, end) = prefix_range(prefix);
        let entries: Vec<_> = match end {
            Some(end) => map
                .range(start..end)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => map
                .range(start..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(entries)
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut map = self.inner.write();
        let (start, end) = prefix_range(prefix);
        let keys: Vec<Vec<u8>> = match end {
            Some(end) => map.range(start..end).map(|(k, _)| k.clone()).collect(),
            None => map.range(start..).map(|(k, _)| k.clone()).collect(),
        };
        for key in &keys {
            map.remove(key);
        }
        Ok(keys.len())
    }
}

/// Helper for storage-layer error conversion.
pub fn storage_err(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = MemKv::new();
        kv.put(b"a", b"1").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        kv.delete(b"a").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_batch_atomicity_shape() {
        let kv = MemKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), b"1".to_vec());
        batch.put(b"y".to_vec(), b"2".to_vec());
        batch.delete(b"x".to_vec());
        kv.write(batch).unwrap();

        assert_eq!(kv.get(b"x").unwrap(), None);
        assert_eq!(kv.get(b"y").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_iter_prefix_ordered() {
        let kv = MemKv::new();
        kv.put(b"p.b", b"2").unwrap();
        kv.put(b"p.a", b"1").unwrap();
        kv.put(b"q.a", b"3").unwrap();

        let entries = kv.iter_prefix(b"p.").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"p.a".to_vec());
        assert_eq!(entries[1].0, b"p.b".to_vec());
    }

    #[test]
    fn test_delete_prefix() {
        let kv = MemKv::new();
        kv.put(b"p.a", b"1").unwrap();
        kv.put(b"p.b", b"2").unwrap();
        kv.put(b"q.a", b"3").unwrap();

        assert_eq!(kv.delete_prefix(b"p.").unwrap(), 2);
        assert!(kv.iter_prefix(b"p.").unwrap().is_empty());
        assert_eq!(kv.get(b"q.a").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_prefix_range_at_ff_boundary() {
        let kv = MemKv::new();
        kv.put(&[0xff, 0x01], b"1").unwrap();
        kv.put(&[0xff, 0xff], b"2").unwrap();
        let entries = kv.iter_prefix(&[0xff]).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
