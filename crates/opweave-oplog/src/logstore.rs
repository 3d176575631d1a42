//! Persistence for oplog records.
//!
//! Oplogs live under `{category_log_prefix}{entity_id}{log_id}` so one
//! prefix iteration yields an entity's whole stream in id order - and id
//! order is creation-time order, which is what the merkle layer buckets.

use crate::record::{Category, Oplog};
use opweave_store::kv::{storage_err, KvStore};
use opweave_types::{Error, Id, Result, Status, Timestamp};
use std::sync::Arc;

/// Key for one persisted oplog.
fn log_key(category: Category, entity_id: &Id, log_id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 64);
    key.extend_from_slice(&category.log_prefix());
    key.extend_from_slice(entity_id.as_bytes());
    key.extend_from_slice(log_id.as_bytes());
    key
}

/// Stream prefix for one (entity, category).
fn stream_prefix(category: Category, entity_id: &Id) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + 32);
    prefix.extend_from_slice(&category.log_prefix());
    prefix.extend_from_slice(entity_id.as_bytes());
    prefix
}

/// Kv-backed store for one entity's oplog streams.
#[derive(Clone)]
pub struct LogStore {
    kv: Arc<dyn KvStore>,
}

impl LogStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        LogStore { kv }
    }

    pub fn save(&self, log: &Oplog) -> Result<()> {
        let key = log_key(log.category, &log.entity_id, &log.id);
        let value = serde_json::to_vec(log).map_err(storage_err)?;
        self.kv.put(&key, &value)
    }

    pub fn get(&self, category: Category, entity_id: &Id, log_id: &Id) -> Result<Option<Oplog>> {
        let key = log_key(category, entity_id, log_id);
        match self.kv.get(&key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    /// The full stream for one (entity, category), in id (= time) order.
    pub fn list(&self, category: Category, entity_id: &Id) -> Result<Vec<Oplog>> {
        let prefix = stream_prefix(category, entity_id);
        let mut logs = Vec::new();
        for (_, value) in self.kv.iter_prefix(&prefix)? {
            logs.push(serde_json::from_slice(&value).map_err(storage_err)?);
        }
        Ok(logs)
    }

    /// Stream slice starting after `from` (exclusive), bounded by `limit`.
    pub fn list_from(
        &self,
        category: Category,
        entity_id: &Id,
        from: Option<Id>,
        limit: usize,
    ) -> Result<Vec<Oplog>> {
        let logs = self.list(category, entity_id)?;
        let out: Vec<Oplog> = logs
            .into_iter()
            .filter(|l| match from {
                Some(from) => l.id > from,
                None => true,
            })
            .take(limit)
            .collect();
        Ok(out)
    }

    /// Confirmed (Alive) logs created at or before `cutoff` - the set a
    /// merkle snapshot summarizes.
    pub fn confirmed_until(
        &self,
        category: Category,
        entity_id: &Id,
        cutoff: Timestamp,
    ) -> Result<Vec<Oplog>> {
        let logs = self.list(category, entity_id)?;
        Ok(logs
            .into_iter()
            .filter(|l| l.status == Status::Alive && l.create_ts <= cutoff)
            .collect())
    }

    /// Number of persisted logs in one stream.
    pub fn count(&self, category: Category, entity_id: &Id) -> Result<usize> {
        let prefix = stream_prefix(category, entity_id);
        Ok(self.kv.iter_prefix(&prefix)?.len())
    }

    /// Fetch several logs by id, erroring on the first gap.
    pub fn get_many(
        &self,
        category: Category,
        entity_id: &Id,
        ids: &[Id],
    ) -> Result<Vec<Oplog>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(category, entity_id, id)? {
                Some(log) => out.push(log),
                None => return Err(Error::NotFound),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OpCode;
    use opweave_store::MemKv;
    use opweave_types::Keypair;

    fn make_log(ts: u64, entity: Id, kp: &Keypair) -> Oplog {
        Oplog::new(
            Id::derive(b"obj", Timestamp::from_millis(ts), b"s"),
            entity,
            Category::Member,
            OpCode::AddMember,
            None,
            Id::derive(b"mlog", Timestamp::from_millis(1), b"s"),
            kp.id(),
            Timestamp::from_millis(ts),
            None,
        )
    }

    #[test]
    fn test_save_get_roundtrip() {
        let store = LogStore::new(Arc::new(MemKv::new()));
        let kp = Keypair::generate();
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let log = make_log(100, entity, &kp);

        store.save(&log).unwrap();
        let got = store.get(Category::Member, &entity, &log.id).unwrap();
        assert_eq!(got, Some(log));
    }

    #[test]
    fn test_list_in_time_order() {
        let store = LogStore::new(Arc::new(MemKv::new()));
        let kp = Keypair::generate();
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");

        let late = make_log(2000, entity, &kp);
        let early = make_log(1000, entity, &kp);
        store.save(&late).unwrap();
        store.save(&early).unwrap();

        let logs = store.list(Category::Member, &entity).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].create_ts < logs[1].create_ts);
    }

    #[test]
    fn test_confirmed_until_filters() {
        let store = LogStore::new(Arc::new(MemKv::new()));
        let kp = Keypair::generate();
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");

        let mut confirmed = make_log(1000, entity, &kp);
        confirmed.status = Status::Alive;
        let mut recent = make_log(5000, entity, &kp);
        recent.status = Status::Alive;
        let pending = make_log(1500, entity, &kp);

        store.save(&confirmed).unwrap();
        store.save(&recent).unwrap();
        store.save(&pending).unwrap();

        let set = store
            .confirmed_until(Category::Member, &entity, Timestamp::from_millis(2000))
            .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].id, confirmed.id);
    }

    #[test]
    fn test_list_from_pagination() {
        let store = LogStore::new(Arc::new(MemKv::new()));
        let kp = Keypair::generate();
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");

        let logs: Vec<Oplog> = (1..=5).map(|i| make_log(i * 100, entity, &kp)).collect();
        for log in &logs {
            store.save(log).unwrap();
        }

        let first_two = store
            .list_from(Category::Member, &entity, None, 2)
            .unwrap();
        assert_eq!(first_two.len(), 2);

        let rest = store
            .list_from(Category::Member, &entity, Some(first_two[1].id), 10)
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest[0].id > first_two[1].id);
    }

    #[test]
    fn test_get_many_gap_errors() {
        let store = LogStore::new(Arc::new(MemKv::new()));
        let kp = Keypair::generate();
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let log = make_log(100, entity, &kp);
        store.save(&log).unwrap();

        let missing = Id::derive(b"missing", Timestamp::from_millis(9), b"s");
        assert!(store
            .get_many(Category::Member, &entity, &[log.id, missing])
            .is_err());
    }
}
