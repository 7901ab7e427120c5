use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Apply, ApplyFn, DocumentStore, Outcome, StoreError, DEFAULT_MAX_RETRIES};

#[derive(Debug)]
struct Entry {
    value: Value,
    version: u64,
}

#[derive(Debug)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Entry>>,
    versions: AtomicU64,
    max_retries: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            versions: AtomicU64::new(0),
            max_retries: max_retries.max(1),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn write_locked(&self, docs: &mut BTreeMap<String, Entry>, path: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                let version = self.next_version();
                docs.insert(path.to_string(), Entry { value, version });
            }
            None => {
                docs.remove(path);
            }
        }
    }

    /// Synchronous write for tests that need to interleave with a running
    /// compare-and-apply function. Fails if the map is locked.
    #[cfg(test)]
    pub fn put_now(&self, path: &str, value: Value) -> bool {
        match self.docs.try_write() {
            Ok(mut docs) => {
                self.write_locked(&mut docs, path, Some(value));
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(path).map(|e| e.value.clone()))
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let prefix = format!("{path}/");
        let docs = self.docs.read().await;

        let children = docs
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, e)| {
                let key = &p[prefix.len()..];
                (!key.contains('/')).then(|| (key.to_string(), e.value.clone()))
            })
            .collect();

        Ok(children)
    }

    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        for (path, value) in writes {
            self.write_locked(&mut docs, &path, value);
        }
        Ok(())
    }

    async fn compare_and_apply_many(
        &self,
        paths: &[String],
        apply: &ApplyFn<'_>,
    ) -> Result<Outcome, StoreError> {
        for attempt in 1..=self.max_retries {
            let (values, versions): (Vec<Option<Value>>, Vec<Option<u64>>) = {
                let docs = self.docs.read().await;
                paths
                    .iter()
                    .map(|p| match docs.get(p) {
                        Some(e) => (Some(e.value.clone()), Some(e.version)),
                        None => (None, None),
                    })
                    .unzip()
            };

            let new_values = match apply(&values)? {
                Apply::Abort => return Ok(Outcome::Aborted(values)),
                Apply::Commit(new_values) => new_values,
            };
            if new_values.len() != paths.len() {
                return Err(StoreError::Arity {
                    expected: paths.len(),
                    returned: new_values.len(),
                });
            }

            let mut docs = self.docs.write().await;
            let unchanged = paths
                .iter()
                .zip(&versions)
                .all(|(p, v)| docs.get(p).map(|e| e.version) == *v);

            if unchanged {
                for (path, value) in paths.iter().zip(new_values.iter().cloned()) {
                    self.write_locked(&mut docs, path, value);
                }
                return Ok(Outcome::Committed(new_values));
            }

            drop(docs);
            log::debug!("Conflict on {:?}, attempt {}.", paths, attempt);
            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            paths: paths.to_vec(),
            attempts: self.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn increment(values: &[Option<Value>]) -> Result<Apply, StoreError> {
        let current = values[0].as_ref().and_then(Value::as_u64).unwrap_or(0);
        Ok(Apply::Commit(vec![Some(json!(current + 1))]))
    }

    #[tokio::test]
    async fn commits_against_absent_value() {
        let store = MemoryStore::new();
        let outcome = store.compare_and_apply("counter", &increment).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn abort_leaves_value_untouched() {
        let store = MemoryStore::new();
        store
            .update(vec![("counter".into(), Some(json!(7)))])
            .await
            .unwrap();

        let outcome = store
            .compare_and_apply("counter", &|_| Ok(Apply::Abort))
            .await
            .unwrap();

        match outcome {
            Outcome::Aborted(seen) => assert_eq!(seen, vec![Some(json!(7))]),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(7)));
    }

    #[tokio::test]
    async fn interleaved_writer_forces_a_retry() {
        let store = Arc::new(MemoryStore::new());
        let calls = AtomicUsize::new(0);
        let interloper = Arc::clone(&store);

        let outcome = store
            .compare_and_apply("counter", &|values| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    assert!(interloper.put_now("counter", json!(100)));
                }
                increment(values)
            })
            .await
            .unwrap();

        assert!(outcome.is_committed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(101)));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let store = Arc::new(MemoryStore::with_max_retries(3));
        let interloper = Arc::clone(&store);

        let err = store
            .compare_and_apply("counter", &|values| {
                interloper.put_now("counter", json!(0));
                increment(values)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Contention { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn multi_path_commit_is_all_or_nothing() {
        let store = Arc::new(MemoryStore::new());
        let interloper = Arc::clone(&store);
        let calls = AtomicUsize::new(0);
        let paths = vec!["a".to_string(), "b".to_string()];

        store
            .compare_and_apply_many(&paths, &|values| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    interloper.put_now("b", json!("theirs"));
                }
                let b = values[1].clone().unwrap_or(json!("none"));
                Ok(Apply::Commit(vec![Some(json!("mine")), Some(json!([b]))]))
            })
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(json!("mine")));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(["theirs"])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::with_max_retries(1_000));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.compare_and_apply("counter", &increment).await })
            })
            .collect();

        for task in futures_util::future::join_all(tasks).await {
            assert!(task.unwrap().unwrap().is_committed());
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(50)));
    }

    #[tokio::test]
    async fn children_lists_direct_descendants_only() {
        let store = MemoryStore::new();
        store
            .update(vec![
                ("users/u1/spendingHistory/002".into(), Some(json!(2))),
                ("users/u1/spendingHistory/001".into(), Some(json!(1))),
                ("users/u1/spendingHistory/001/nested".into(), Some(json!(9))),
                ("users/u10/spendingHistory/001".into(), Some(json!(5))),
            ])
            .await
            .unwrap();

        let children = store.children("users/u1/spendingHistory").await.unwrap();
        assert_eq!(
            children,
            vec![("001".to_string(), json!(1)), ("002".to_string(), json!(2))]
        );
    }
}
