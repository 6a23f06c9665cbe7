//! 播放记录
//! 按 (work_id, source_key) 唯一，最近播放的在前，超过上限时淘汰最旧的

use crate::store::{self, keys, Store, StoreError};
use crate::types::PlaybackRecord;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 20;

pub struct HistoryStore {
    store: Arc<dyn Store>,
    capacity: usize,
    // 每次调用只做一次完整的读-改-写
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            lock: Mutex::new(()),
        }
    }

    /// 数据损坏时报错，不能当作空列表覆盖掉
    fn load(&self) -> Result<Vec<PlaybackRecord>, StoreError> {
        match self.store.get(keys::PLAY_HISTORY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, records: &[PlaybackRecord]) -> Result<(), StoreError> {
        store::set_json(self.store.as_ref(), keys::PLAY_HISTORY, records)
    }

    fn modify<R>(
        &self,
        f: impl FnOnce(&mut Vec<PlaybackRecord>) -> R,
    ) -> Result<R, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.load()?;
        let out = f(&mut records);
        self.save(&records)?;
        Ok(out)
    }

    /// 写入记录并移到最前
    pub fn upsert(&self, record: PlaybackRecord) -> Result<(), StoreError> {
        let capacity = self.capacity;
        self.modify(|records| {
            records.retain(|r| !r.same_identity(&record.work_id, &record.source_key));
            debug!(
                "记录播放: {} [{}] {}",
                record.title, record.source_key, record.episode_label
            );
            records.insert(0, record);
            records.truncate(capacity);
        })
    }

    pub fn find(&self, work_id: &str, source_key: &str) -> Result<Option<PlaybackRecord>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.same_identity(work_id, source_key)))
    }

    /// 删除记录，返回是否存在
    pub fn remove(&self, work_id: &str, source_key: &str) -> Result<bool, StoreError> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| !r.same_identity(work_id, source_key));
            records.len() != before
        })
    }

    pub fn list(&self) -> Result<Vec<PlaybackRecord>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.load()
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.store.remove(keys::PLAY_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::SortOrder;

    fn record(work_id: &str, source_key: &str, label: &str) -> PlaybackRecord {
        PlaybackRecord {
            work_id: work_id.to_string(),
            source_key: source_key.to_string(),
            title: format!("作品{}", work_id),
            poster_url: String::new(),
            episode_label: label.to_string(),
            timestamp_ms: 0,
            sort_order: SortOrder::Asc,
            skip_start_sec: 0,
            skip_end_sec: 0,
        }
    }

    fn history(capacity: usize) -> HistoryStore {
        HistoryStore::new(Arc::new(MemoryStore::new()), capacity)
    }

    #[test]
    fn test_upsert_is_unique_per_identity() {
        let history = history(DEFAULT_CAPACITY);
        history.upsert(record("1", "s1", "3")).unwrap();
        history.upsert(record("2", "s1", "1")).unwrap();
        let before = history.list().unwrap().len();

        history.upsert(record("1", "s1", "4")).unwrap();
        let all = history.list().unwrap();
        assert_eq!(all.len(), before);
        assert_eq!(
            all.iter().filter(|r| r.same_identity("1", "s1")).count(),
            1
        );
        assert_eq!(history.find("1", "s1").unwrap().unwrap().episode_label, "4");
        // 最近写入的排在最前
        assert_eq!(all[0].work_id, "1");
    }

    #[test]
    fn test_corrupt_history_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::PLAY_HISTORY, "[{broken").unwrap();
        let history = HistoryStore::new(store.clone(), DEFAULT_CAPACITY);

        assert!(matches!(history.list(), Err(StoreError::Serde(_))));
        assert!(matches!(
            history.upsert(record("1", "s1", "1")),
            Err(StoreError::Serde(_))
        ));
        assert_eq!(
            store.get(keys::PLAY_HISTORY).unwrap().as_deref(),
            Some("[{broken")
        );

        // 清空后可以重新记录
        history.clear().unwrap();
        history.upsert(record("1", "s1", "1")).unwrap();
        assert_eq!(history.list().unwrap().len(), 1);
    }

    #[test]
    fn test_same_work_different_source_is_distinct() {
        let history = history(DEFAULT_CAPACITY);
        history.upsert(record("1", "s1", "1")).unwrap();
        history.upsert(record("1", "s2", "2")).unwrap();
        assert_eq!(history.list().unwrap().len(), 2);
    }

    #[test]
    fn test_eviction_drops_least_recent() {
        let history = history(3);
        for i in 0..4 {
            history.upsert(record(&i.to_string(), "s", "1")).unwrap();
        }
        let all = history.list().unwrap();
        assert_eq!(all.len(), 3);
        assert!(history.find("0", "s").unwrap().is_none());
        let ids: Vec<_> = all.iter().map(|r| r.work_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let history = history(2);
        history.upsert(record("a", "s", "1")).unwrap();
        history.upsert(record("b", "s", "1")).unwrap();
        history.upsert(record("a", "s", "2")).unwrap();
        history.upsert(record("c", "s", "1")).unwrap();
        assert!(history.find("a", "s").unwrap().is_some());
        assert!(history.find("b", "s").unwrap().is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let history = history(DEFAULT_CAPACITY);
        history.upsert(record("1", "s1", "1")).unwrap();
        history.upsert(record("2", "s1", "1")).unwrap();
        assert!(history.remove("1", "s1").unwrap());
        assert!(!history.remove("1", "s1").unwrap());
        assert_eq!(history.list().unwrap().len(), 1);

        history.clear().unwrap();
        assert!(history.list().unwrap().is_empty());
    }
}
