//! The replicated object contract and its generic store.
//!
//! Every unit of replicated state - master records, member records,
//! operational keys, domain entities - shares the same persisted core and
//! lifecycle, and differs only in its keyspace prefixes and payload. The
//! [`ObjectStore`] provides `save`/`delete`/`get_by_id` over any
//! [`Replicated`] kind, holding the object's registry lock unless the
//! caller flags that it already does (`is_locked`).

use crate::keys;
use crate::kv::{storage_err, KvStore, WriteBatch};
use opweave_types::{Error, Id, LockRegistry, Result, Status, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Schema version written into every persisted object.
pub const CURRENT_VERSION: u32 = 1;

/// The persisted core every replicated object embeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCore {
    pub version: u32,
    pub id: Id,
    /// The grouping entity; equals `id` for top-level entities.
    pub entity_id: Id,
    pub creator_id: Id,
    pub create_ts: Timestamp,
    pub updater_id: Id,
    pub update_ts: Timestamp,
    pub status: Status,
    /// The oplog that created this object.
    pub log_id: Option<Id>,
    /// The oplog of the latest accepted mutation.
    pub update_log_id: Option<Id>,
}

impl ObjectCore {
    pub fn new(id: Id, entity_id: Id, creator_id: Id, create_ts: Timestamp, log_id: Id) -> Self {
        ObjectCore {
            version: CURRENT_VERSION,
            id,
            entity_id,
            creator_id,
            create_ts,
            updater_id: creator_id,
            update_ts: create_ts,
            status: Status::Init,
            log_id: Some(log_id),
            update_log_id: Some(log_id),
        }
    }

    /// Advance status, enforcing the monotonic transition rule.
    pub fn set_status(&mut self, next: Status) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(Error::InvalidTransition);
        }
        self.status = next;
        Ok(())
    }

    /// Record an accepted mutation.
    pub fn set_updated(&mut self, updater_id: Id, update_ts: Timestamp, update_log_id: Id) {
        self.updater_id = updater_id;
        self.update_ts = update_ts;
        self.update_log_id = Some(update_log_id);
    }
}

/// Capability contract for one replicated object kind.
pub trait Replicated: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Keyspace prefix for versioned data keys.
    const PREFIX: [u8; keys::SIZE_PREFIX];

    /// Keyspace prefix for index keys.
    const IDX_PREFIX: [u8; keys::SIZE_PREFIX];

    fn core(&self) -> &ObjectCore;

    fn core_mut(&mut self) -> &mut ObjectCore;
}

/// Generic persistence for one [`Replicated`] kind.
///
/// All mutation paths hold the object's exclusive lock for their full
/// duration; read paths take the shared lock. Callers already inside a
/// locked section pass `is_locked = true` to avoid re-acquisition.
pub struct ObjectStore<O: Replicated> {
    kv: Arc<dyn KvStore>,
    locks: Arc<LockRegistry>,
    _kind: PhantomData<O>,
}

impl<O: Replicated> Clone for ObjectStore<O> {
    fn clone(&self) -> Self {
        ObjectStore {
            kv: self.kv.clone(),
            locks: self.locks.clone(),
            _kind: PhantomData,
        }
    }
}

impl<O: Replicated> ObjectStore<O> {
    pub fn new(kv: Arc<dyn KvStore>, locks: Arc<LockRegistry>) -> Self {
        ObjectStore {
            kv,
            locks,
            _kind: PhantomData,
        }
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Persist a new version of `obj` and repoint its index key.
    pub async fn save(&self, obj: &O, is_locked: bool) -> Result<()> {
        let core = obj.core();
        let _guard = if is_locked {
            None
        } else {
            Some(self.locks.lock(&core.id).await?)
        };

        let dkey = keys::data_key(&O::PREFIX, &core.entity_id, &core.id, core.update_ts);
        let ikey = keys::idx_key(&O::IDX_PREFIX, &core.entity_id, &core.id);
        let value = serde_json::to_vec(obj).map_err(storage_err)?;

        let mut batch = WriteBatch::new();
        batch.put(dkey.clone(), value);
        batch.put(ikey, dkey);
        self.kv.write(batch)
    }

    /// Fetch the newest version; `Error::NotFound` if absent.
    pub async fn get_by_id(&self, entity_id: &Id, id: &Id, is_locked: bool) -> Result<O> {
        let _guard = if is_locked {
            None
        } else {
            Some(self.locks.rlock(id).await?)
        };

        let ikey = keys::idx_key(&O::IDX_PREFIX, entity_id, id);
        let dkey = self.kv.get(&ikey)?.ok_or(Error::NotFound)?;
        let value = self.kv.get(&dkey)?.ok_or(Error::NotFound)?;
        serde_json::from_slice(&value).map_err(storage_err)
    }

    /// Like [`ObjectStore::get_by_id`] but yields `None` for a record that
    /// has not arrived yet, so callers can report "pending" without error.
    pub async fn get_new_obj_by_id(
        &self,
        entity_id: &Id,
        id: &Id,
        is_locked: bool,
    ) -> Result<Option<O>> {
        match self.get_by_id(entity_id, id, is_locked).await {
            Ok(obj) => Ok(Some(obj)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove every version of `obj` and its index entry atomically.
    pub async fn delete(&self, obj: &O, is_locked: bool) -> Result<()> {
        let core = obj.core();
        let _guard = if is_locked {
            None
        } else {
            Some(self.locks.lock(&core.id).await?)
        };

        let version_prefix = keys::idx_key(&O::PREFIX, &core.entity_id, &core.id);
        let versions = self.kv.iter_prefix(&version_prefix)?;
        if versions.is_empty() {
            return Err(Error::AlreadyDeleted);
        }

        let mut batch = WriteBatch::new();
        for (key, _) in versions {
            batch.delete(key);
        }
        batch.delete(keys::idx_key(&O::IDX_PREFIX, &core.entity_id, &core.id));
        self.kv.write(batch)
    }

    /// Drop historical versions, keeping only the one the index points at.
    pub async fn prune_versions(&self, entity_id: &Id, id: &Id, is_locked: bool) -> Result<usize> {
        let _guard = if is_locked {
            None
        } else {
            Some(self.locks.lock(id).await?)
        };

        let ikey = keys::idx_key(&O::IDX_PREFIX, entity_id, id);
        let newest = self.kv.get(&ikey)?.ok_or(Error::NotFound)?;

        let version_prefix = keys::idx_key(&O::PREFIX, entity_id, id);
        let mut batch = WriteBatch::new();
        let mut pruned = 0;
        for (key, _) in self.kv.iter_prefix(&version_prefix)? {
            if key != newest {
                batch.delete(key);
                pruned += 1;
            }
        }
        self.kv.write(batch)?;
        Ok(pruned)
    }

    /// All newest-version objects under one entity, in id order.
    pub async fn list_entity(&self, entity_id: &Id) -> Result<Vec<O>> {
        let mut prefix = Vec::with_capacity(keys::SIZE_PREFIX + 32);
        prefix.extend_from_slice(&O::IDX_PREFIX);
        prefix.extend_from_slice(entity_id.as_bytes());

        let mut out = Vec::new();
        for (_, dkey) in self.kv.iter_prefix(&prefix)? {
            if let Some(value) = self.kv.get(&dkey)? {
                out.push(serde_json::from_slice(&value).map_err(storage_err)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        core: ObjectCore,
        text: String,
    }

    impl Replicated for Note {
        const PREFIX: [u8; 4] = *b".ntd";
        const IDX_PREFIX: [u8; 4] = *b".ntx";

        fn core(&self) -> &ObjectCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ObjectCore {
            &mut self.core
        }
    }

    fn note(n: u64, text: &str) -> Note {
        let entity = Id::derive(b"entity", Timestamp::from_millis(1), b"s");
        let creator = Id::derive(b"creator", Timestamp::from_millis(1), b"s");
        let ts = Timestamp::from_millis(n);
        let id = Id::derive(b"note", ts, b"s");
        let log = Id::derive(b"log", ts, b"s");
        Note {
            core: ObjectCore::new(id, entity, creator, ts, log),
            text: text.to_string(),
        }
    }

    fn store() -> ObjectStore<Note> {
        ObjectStore::new(Arc::new(MemKv::new()), Arc::new(LockRegistry::new()))
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = store();
        let n = note(10, "hello");
        store.save(&n, false).await.unwrap();

        let got = store
            .get_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap();
        assert_eq!(got, n);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store();
        let n = note(11, "x");
        let err = store
            .get_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotFound);

        let none = store
            .get_new_obj_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_versions_coexist_until_pruned() {
        let store = store();
        let mut n = note(12, "v1");
        store.save(&n, false).await.unwrap();

        n.core.update_ts = Timestamp::from_millis(20);
        n.text = "v2".to_string();
        store.save(&n, false).await.unwrap();

        // Index points at the newest version.
        let got = store
            .get_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap();
        assert_eq!(got.text, "v2");

        let pruned = store
            .prune_versions(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let got = store
            .get_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap();
        assert_eq!(got.text, "v2");
    }

    #[tokio::test]
    async fn test_delete_removes_all_versions() {
        let store = store();
        let mut n = note(13, "v1");
        store.save(&n, false).await.unwrap();
        n.core.update_ts = Timestamp::from_millis(30);
        store.save(&n, false).await.unwrap();

        store.delete(&n, false).await.unwrap();
        let err = store
            .get_by_id(&n.core.entity_id, &n.core.id, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotFound);

        // Second delete finds nothing left.
        let err = store.delete(&n, false).await.unwrap_err();
        assert_eq!(err, Error::AlreadyDeleted);
    }

    #[tokio::test]
    async fn test_reentrant_save_under_held_lock() {
        let store = store();
        let n = note(14, "locked");
        let _guard = store.locks().lock(&n.core.id).await.unwrap();
        // is_locked = true skips re-acquisition; must not deadlock.
        store.save(&n, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_entity_in_id_order() {
        let store = store();
        let a = note(100, "a");
        let b = note(200, "b");
        store.save(&b, false).await.unwrap();
        store.save(&a, false).await.unwrap();

        let all = store.list_entity(&a.core.entity_id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].core.id < all[1].core.id);
    }

    #[test]
    fn test_status_transition_enforced() {
        let mut n = note(15, "t");
        n.core.set_status(Status::Alive).unwrap();
        n.core.set_status(Status::Deleted).unwrap();
        assert_eq!(
            n.core.set_status(Status::Alive).unwrap_err(),
            Error::InvalidTransition
        );
    }
}
