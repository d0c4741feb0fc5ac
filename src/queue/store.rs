// Durable fix queue
//
// Append-ordered store of fix records with a per-record sent flag, backed by
// a fjall keyspace. A separate `pending` partition indexes unsent ids so that
// batch reads and counts never scan delivered history.

use crate::error::{Result, StorageError};
use crate::queue::record::{FixId, FixRecord, NewFix, StoredFix};
use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// How hard each committed write is pushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// fsync data and metadata after every write
    #[default]
    SyncAll,
    /// fsync data only
    SyncData,
    /// hand writes to the OS buffer, no fsync
    Buffer,
}

impl From<Durability> for PersistMode {
    fn from(d: Durability) -> Self {
        match d {
            Durability::SyncAll => PersistMode::SyncAll,
            Durability::SyncData => PersistMode::SyncData,
            Durability::Buffer => PersistMode::Buffer,
        }
    }
}

/// In-memory counters guarded by the single-writer lock
struct QueueState {
    next_id: u64,
    unsent: usize,
}

/// Durable, ordered, crash-surviving fix queue.
///
/// All mutations take the write lock, so an append racing with `mark_sent`
/// of other ids is serialized rather than lost. Reads share the read lock.
pub struct FixQueue {
    path: PathBuf,
    keyspace: Keyspace,
    fixes: PartitionHandle,
    pending: PartitionHandle,
    meta: PartitionHandle,
    durability: Durability,
    state: RwLock<QueueState>,
}

impl FixQueue {
    const META_NEXT_ID: &'static [u8] = b"next_id";
    const META_DEVICE_ID: &'static [u8] = b"device_id";
    const META_LAST_SYNC: &'static [u8] = b"last_sync_ms";

    /// Open or create the queue stored under `path`
    pub fn open(path: &Path, durability: Durability) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path).open()?;
        let fixes = keyspace.open_partition("fixes", PartitionCreateOptions::default())?;
        let pending = keyspace.open_partition("pending", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        // Pruning may have removed the newest records, so the high-water mark
        // in meta wins over the last key still present.
        let stored_next = match meta.get(Self::META_NEXT_ID)? {
            Some(bytes) => Self::decode_u64(&bytes).unwrap_or(1),
            None => 1,
        };
        let last_present = match fixes.last_key_value()? {
            Some((key, _)) => FixId::from_key(&key).map(|id| id.0 + 1).unwrap_or(1),
            None => 1,
        };
        let next_id = stored_next.max(last_present);
        let unsent = pending.len()?;

        tracing::debug!(
            "Opened fix queue at {} (next id {}, {} unsent)",
            path.display(),
            next_id,
            unsent
        );

        Ok(Self {
            path: path.to_path_buf(),
            keyspace,
            fixes,
            pending,
            meta,
            durability,
            state: RwLock::new(QueueState { next_id, unsent }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        self.keyspace.persist(self.durability.into())?;
        Ok(())
    }

    fn decode_u64(bytes: &[u8]) -> Option<u64> {
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    fn parse_key(key: &[u8]) -> Result<FixId> {
        FixId::from_key(key).ok_or_else(|| StorageError::Corrupt {
            id: FixId(0),
            reason: format!("malformed key of {} bytes", key.len()),
        })
    }

    fn load(&self, id: FixId) -> Result<StoredFix> {
        let value = self
            .fixes
            .get(id.to_key())?
            .ok_or_else(|| StorageError::Corrupt {
                id,
                reason: "pending entry without record".to_string(),
            })?;
        Ok(StoredFix::decode(&value)?)
    }

    /// Append an unsent fix. On error the fix is not queued.
    pub fn append(&self, fix: NewFix) -> Result<FixId> {
        let mut state = self.write_state();
        let id = FixId(state.next_id);
        let key = id.to_key();
        let value = StoredFix { fix, sent: false }.encode()?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.fixes, &key[..], value);
        batch.insert(&self.pending, &key[..], Vec::<u8>::new());
        batch.insert(&self.meta, Self::META_NEXT_ID, &(id.0 + 1).to_be_bytes()[..]);
        batch.commit()?;

        if let Err(e) = self.persist() {
            // Not durable, so withdraw it rather than report a half-queued fix.
            // The stored next_id stays advanced: after a restart this id is
            // skipped, which only leaves a gap.
            let mut undo = self.keyspace.batch();
            undo.remove(&self.fixes, &key[..]);
            undo.remove(&self.pending, &key[..]);
            if let Err(undo_err) = undo.commit() {
                tracing::error!("Failed to withdraw fix {}: {}", id, undo_err);
            }
            return Err(e);
        }

        state.next_id += 1;
        state.unsent += 1;
        Ok(id)
    }

    /// Up to `limit` unsent records, oldest first. Does not change any state.
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<FixRecord>> {
        let state = self.read_state();
        let mut batch = Vec::with_capacity(limit.min(state.unsent));

        for item in self.pending.iter().take(limit) {
            let (key, _) = item?;
            let id = Self::parse_key(&key)?;
            batch.push(self.load(id)?.into_record(id));
        }

        Ok(batch)
    }

    /// Flag records as delivered. Ids that are already sent or unknown are
    /// ignored. Returns how many records changed state.
    pub fn mark_sent(&self, ids: &[FixId]) -> Result<usize> {
        let mut state = self.write_state();

        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut batch = self.keyspace.batch();
        let mut changed = 0;

        for id in ids {
            let key = id.to_key();
            if !self.pending.contains_key(key)? {
                continue;
            }

            let mut stored = self.load(id)?;
            stored.sent = true;
            batch.insert(&self.fixes, &key[..], stored.encode()?);
            batch.remove(&self.pending, &key[..]);
            changed += 1;
        }

        if changed == 0 {
            return Ok(0);
        }

        let now_ms = Utc::now().timestamp_millis();
        batch.insert(&self.meta, Self::META_LAST_SYNC, &now_ms.to_be_bytes()[..]);
        batch.commit()?;

        // Committed marks are visible even if the fsync below fails; a lost
        // mark only causes a resend.
        state.unsent = state.unsent.saturating_sub(changed);
        self.persist()?;

        Ok(changed)
    }

    pub fn unsent_count(&self) -> usize {
        self.read_state().unsent
    }

    /// Number of records held, sent or not
    pub fn total_count(&self) -> Result<usize> {
        let _state = self.read_state();
        Ok(self.fixes.len()?)
    }

    /// Time of the last `mark_sent` that delivered at least one record
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let _state = self.read_state();
        let Some(bytes) = self.meta.get(Self::META_LAST_SYNC)? else {
            return Ok(None);
        };
        Ok(Self::decode_u64(&bytes)
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64)))
    }

    /// Device identifier persisted with the queue, generated on first use
    pub fn device_id(&self) -> Result<String> {
        let _state = self.write_state();

        if let Some(bytes) = self.meta.get(Self::META_DEVICE_ID)? {
            return String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Corrupt {
                id: FixId(0),
                reason: format!("device id is not UTF-8: {}", e),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.meta.insert(Self::META_DEVICE_ID, id.as_bytes())?;
        self.persist()?;
        tracing::info!("Generated device id {}", id);
        Ok(id)
    }

    /// Delete sent records for which `retain` returns false. Sent records are
    /// visited newest first; unsent records are never visited or removed.
    pub fn prune<F>(&self, mut retain: F) -> Result<usize>
    where
        F: FnMut(&FixRecord) -> bool,
    {
        let _state = self.write_state();
        let mut batch = self.keyspace.batch();
        let mut removed = 0;

        for item in self.fixes.iter().rev() {
            let (key, value) = item?;
            let id = Self::parse_key(&key)?;
            let stored = StoredFix::decode(&value)?;
            if !stored.sent {
                continue;
            }

            let record = stored.into_record(id);
            if !retain(&record) {
                batch.remove(&self.fixes, &key[..]);
                removed += 1;
            }
        }

        if removed > 0 {
            batch.commit()?;
            self.persist()?;
            tracing::info!("Pruned {} sent fixes", removed);
        }

        Ok(removed)
    }

    /// Index an id as pending without a record behind it
    #[cfg(test)]
    pub(crate) fn insert_orphan_pending(&self, id: FixId) -> Result<()> {
        let _state = self.write_state();
        self.pending.insert(&id.to_key()[..], Vec::<u8>::new())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn temp_queue() -> (FixQueue, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = FixQueue::open(temp_dir.path(), Durability::Buffer).unwrap();
        (queue, temp_dir)
    }

    fn fix(ts: i64) -> NewFix {
        NewFix {
            device_id: "device-1".to_string(),
            timestamp_ms: ts,
            latitude: 54.43,
            longitude: 10.19,
            speed: 4.2,
            bearing: 270.0,
        }
    }

    fn ids(records: &[FixRecord]) -> Vec<FixId> {
        records.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_append_assigns_sequential_ids() {
        let (queue, _temp) = temp_queue();

        assert_eq!(queue.append(fix(1000)).unwrap(), FixId(1));
        assert_eq!(queue.append(fix(2000)).unwrap(), FixId(2));
        assert_eq!(queue.append(fix(3000)).unwrap(), FixId(3));
        assert_eq!(queue.unsent_count(), 3);
        assert_eq!(queue.total_count().unwrap(), 3);
    }

    #[test]
    fn test_peek_is_oldest_first_and_stable() {
        let (queue, _temp) = temp_queue();
        for i in 0..5 {
            queue.append(fix(i * 1000)).unwrap();
        }

        let first = queue.peek_batch(3).unwrap();
        let second = queue.peek_batch(3).unwrap();

        assert_eq!(ids(&first), vec![FixId(1), FixId(2), FixId(3)]);
        assert_eq!(first, second);
        assert!(first.iter().all(|r| !r.sent));
        assert_eq!(first[2].fix.timestamp_ms, 2000);
    }

    #[test]
    fn test_peek_skips_sent_records() {
        let (queue, _temp) = temp_queue();
        for i in 0..5 {
            queue.append(fix(i)).unwrap();
        }

        queue.mark_sent(&[FixId(1), FixId(3)]).unwrap();

        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(ids(&batch), vec![FixId(2), FixId(4), FixId(5)]);
        assert_eq!(queue.unsent_count(), 3);
    }

    #[test]
    fn test_peek_zero_limit() {
        let (queue, _temp) = temp_queue();
        queue.append(fix(0)).unwrap();
        assert!(queue.peek_batch(0).unwrap().is_empty());
    }

    #[test]
    fn test_mark_sent_is_idempotent() {
        let (queue, _temp) = temp_queue();
        for i in 0..3 {
            queue.append(fix(i)).unwrap();
        }

        assert_eq!(queue.mark_sent(&[FixId(1), FixId(2)]).unwrap(), 2);
        assert_eq!(queue.mark_sent(&[FixId(1), FixId(2)]).unwrap(), 0);
        assert_eq!(queue.mark_sent(&[FixId(2), FixId(2)]).unwrap(), 0);
        assert_eq!(queue.unsent_count(), 1);
        assert_eq!(ids(&queue.peek_batch(10).unwrap()), vec![FixId(3)]);
    }

    #[test]
    fn test_mark_unknown_id_is_noop() {
        let (queue, _temp) = temp_queue();
        queue.append(fix(0)).unwrap();

        assert_eq!(queue.mark_sent(&[FixId(99)]).unwrap(), 0);
        assert_eq!(queue.unsent_count(), 1);
        assert!(queue.last_sync().unwrap().is_none());
    }

    #[test]
    fn test_last_sync_recorded() {
        let (queue, _temp) = temp_queue();
        queue.append(fix(0)).unwrap();

        let before = Utc::now();
        queue.mark_sent(&[FixId(1)]).unwrap();
        let last = queue.last_sync().unwrap().unwrap();

        assert!(last.timestamp_millis() >= before.timestamp_millis());
    }

    #[test]
    fn test_pending_without_record_is_corrupt() {
        let (queue, _temp) = temp_queue();
        queue.append(fix(0)).unwrap();
        queue.insert_orphan_pending(FixId(7)).unwrap();

        let err = queue.peek_batch(10).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { id: FixId(7), .. }));

        // Nothing was marked or removed
        assert_eq!(queue.unsent_count(), 1);
        assert_eq!(queue.total_count().unwrap(), 1);
    }

    #[test]
    fn test_prune_never_removes_unsent() {
        let (queue, _temp) = temp_queue();
        for i in 0..6 {
            queue.append(fix(i)).unwrap();
        }
        queue.mark_sent(&[FixId(1), FixId(2), FixId(3)]).unwrap();

        let removed = queue.prune(|_| false).unwrap();

        assert_eq!(removed, 3);
        assert_eq!(queue.total_count().unwrap(), 3);
        assert_eq!(queue.unsent_count(), 3);
        assert_eq!(
            ids(&queue.peek_batch(10).unwrap()),
            vec![FixId(4), FixId(5), FixId(6)]
        );
    }

    #[test]
    fn test_prune_visits_newest_first() {
        let (queue, _temp) = temp_queue();
        for i in 0..4 {
            queue.append(fix(i)).unwrap();
        }
        queue
            .mark_sent(&[FixId(1), FixId(2), FixId(3), FixId(4)])
            .unwrap();

        let mut kept = 0;
        let removed = queue
            .prune(|_| {
                kept += 1;
                kept <= 1
            })
            .unwrap();

        assert_eq!(removed, 3);
        // Next id must not be reused after pruning
        assert_eq!(queue.append(fix(9)).unwrap(), FixId(5));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp_dir = tempfile::tempdir().unwrap();

        {
            let queue = FixQueue::open(temp_dir.path(), Durability::SyncAll).unwrap();
            for i in 0..4 {
                queue.append(fix(i)).unwrap();
            }
            queue.mark_sent(&[FixId(1)]).unwrap();
        }

        let queue = FixQueue::open(temp_dir.path(), Durability::SyncAll).unwrap();
        assert_eq!(queue.unsent_count(), 3);
        assert_eq!(queue.total_count().unwrap(), 4);
        assert_eq!(queue.append(fix(10)).unwrap(), FixId(5));
        assert_eq!(queue.peek_batch(1).unwrap()[0].id, FixId(2));
    }

    #[test]
    fn test_device_id_is_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();

        let first = {
            let queue = FixQueue::open(temp_dir.path(), Durability::Buffer).unwrap();
            let id = queue.device_id().unwrap();
            assert_eq!(id, queue.device_id().unwrap());
            id
        };

        let queue = FixQueue::open(temp_dir.path(), Durability::Buffer).unwrap();
        assert_eq!(queue.device_id().unwrap(), first);
    }

    #[test]
    fn test_concurrent_append_and_mark() {
        let (queue, _temp) = temp_queue();
        for i in 0..50 {
            queue.append(fix(i)).unwrap();
        }
        let queue = std::sync::Arc::new(queue);

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 50..100 {
                    queue.append(fix(i)).unwrap();
                }
            })
        };
        let marker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for id in 1..=50 {
                    queue.mark_sent(&[FixId(id)]).unwrap();
                }
            })
        };
        writer.join().unwrap();
        marker.join().unwrap();

        assert_eq!(queue.unsent_count(), 50);
        assert_eq!(queue.total_count().unwrap(), 100);
        assert_eq!(queue.peek_batch(1).unwrap()[0].id, FixId(51));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_batch_bound(appended in 0usize..40, limit in 0usize..60) {
            let (queue, _temp) = temp_queue();
            for i in 0..appended {
                queue.append(fix(i as i64)).unwrap();
            }

            let batch = queue.peek_batch(limit).unwrap();
            prop_assert_eq!(batch.len(), limit.min(appended));
        }

        #[test]
        fn prop_repeated_flushes_deliver_everything(
            appended in 1usize..60,
            batch_size in 1usize..25,
        ) {
            let (queue, _temp) = temp_queue();
            for i in 0..appended {
                queue.append(fix(i as i64)).unwrap();
            }

            let mut delivered = Vec::new();
            loop {
                let batch = queue.peek_batch(batch_size).unwrap();
                if batch.is_empty() {
                    break;
                }
                let batch_ids = ids(&batch);
                queue.mark_sent(&batch_ids).unwrap();
                // Second mark of the same ids changes nothing
                prop_assert_eq!(queue.mark_sent(&batch_ids).unwrap(), 0);
                delivered.extend(batch_ids);
            }

            let expected: Vec<FixId> = (1..=appended as u64).map(FixId).collect();
            prop_assert_eq!(delivered, expected);
            prop_assert_eq!(queue.unsent_count(), 0);
        }
    }
}
