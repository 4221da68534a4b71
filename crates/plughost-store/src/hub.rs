//! One logical database of named stores sharing a single connection.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::backend::StoreBackend;
use crate::store::Store;

#[derive(Default)]
struct HubState {
    stores: IndexMap<String, Store>,
    /// Names whose namespace is known to exist in the backend.
    upgraded: HashSet<String>,
    /// Stores waiting for the connection task.
    pending: Vec<Store>,
    connecting: bool,
    started: bool,
}

struct HubInner {
    database: String,
    backend: Arc<dyn StoreBackend>,
    state: Mutex<HubState>,
}

/// Hands out [`Store`]s by name and connects them in batches.
///
/// Every name requested before the connection task gets to run lands in the
/// same batch and therefore in the same schema upgrade. Only one connection
/// task exists at a time; names requested while it is busy are picked up by
/// its next round.
#[derive(Clone)]
pub struct StoreHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for StoreHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHub")
            .field("database", &self.inner.database)
            .field("stores", &self.names())
            .finish_non_exhaustive()
    }
}

impl StoreHub {
    pub fn new(database: impl Into<String>, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                database: database.into(),
                backend,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// The store called `name`, created on first use.
    ///
    /// Never blocks: a new store starts disconnected and is attached by the
    /// hub's connection task. Must be called from within a tokio runtime.
    pub fn open(&self, name: &str) -> Store {
        let mut state = self.inner.state.lock();
        if let Some(store) = state.stores.get(name) {
            return store.clone();
        }

        let store = Store::new(name);
        state.stores.insert(name.to_string(), store.clone());
        state.pending.push(store.clone());
        state.started = true;

        if !state.connecting {
            state.connecting = true;
            tokio::spawn(connect(self.inner.clone()));
        }
        store
    }

    /// An already opened store, without creating it.
    pub fn get(&self, name: &str) -> Option<Store> {
        self.inner.state.lock().stores.get(name).cloned()
    }

    /// Names of every store opened so far, in opening order.
    pub fn names(&self) -> Vec<String> {
        self.inner.state.lock().stores.keys().cloned().collect()
    }

    /// Whether any store has been requested, i.e. the connection has begun.
    pub fn connection_started(&self) -> bool {
        self.inner.state.lock().started
    }
}

async fn connect(inner: Arc<HubInner>) {
    loop {
        // Let opens issued in the same tick join this batch.
        tokio::task::yield_now().await;

        let (batch, new_names) = {
            let mut state = inner.state.lock();
            if state.pending.is_empty() {
                state.connecting = false;
                return;
            }
            let batch = std::mem::take(&mut state.pending);
            let new_names: Vec<String> = batch
                .iter()
                .map(|store| store.name().to_string())
                .filter(|name| !state.upgraded.contains(name))
                .collect();
            (batch, new_names)
        };

        if !new_names.is_empty() {
            if let Err(e) = inner.backend.upgrade(&inner.database, &new_names).await {
                tracing::error!(
                    database = %inner.database,
                    stores = ?new_names,
                    "store upgrade failed: {e}"
                );
                if requeue(&inner, batch) {
                    continue;
                }
                return;
            }
            inner.state.lock().upgraded.extend(new_names);
        }

        let mut failed = Vec::new();
        for store in batch {
            if let Err(e) = store.attach(&inner.database, inner.backend.clone()).await {
                tracing::error!(
                    database = %inner.database,
                    store = %store.name(),
                    "failed to attach store: {e}"
                );
                failed.push(store);
            }
        }
        if !failed.is_empty() && !requeue(&inner, failed) {
            return;
        }
    }
}

/// Put `stores` back at the head of the queue so a later open retries them.
///
/// Returns whether opens arrived meanwhile, in which case the connection task
/// keeps going; otherwise it is marked idle.
fn requeue(inner: &HubInner, stores: Vec<Store>) -> bool {
    let mut state = inner.state.lock();
    let later = std::mem::take(&mut state.pending);
    let arrived = !later.is_empty();
    state.pending = stores;
    state.pending.extend(later);
    if !arrived {
        state.connecting = false;
    }
    arrived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_simultaneous_opens_share_one_upgrade() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = StoreHub::new("plugins", backend.clone());
        assert!(!hub.connection_started());

        let a = hub.open("plugin-a");
        let b = hub.open("plugin-b");
        assert!(hub.connection_started());

        let fired = Arc::new(AtomicUsize::new(0));
        for store in [&a, &b] {
            let fired = fired.clone();
            store.when_ready(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        a.ready().await;
        b.ready().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(
            backend.upgrade_batches(),
            vec![(
                "plugins".to_string(),
                vec!["plugin-a".to_string(), "plugin-b".to_string()]
            )]
        );
    }

    #[tokio::test]
    async fn test_open_returns_shared_store() {
        let hub = StoreHub::new("db", Arc::new(MemoryBackend::new()));
        let first = hub.open("config");
        first.set("k", &1).unwrap();
        let second = hub.open("config");
        assert_eq!(second.get("k"), Some(json!(1)));
        assert_eq!(hub.names(), vec!["config"]);
        assert!(hub.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_later_open_upgrades_only_new_name() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = StoreHub::new("db", backend.clone());
        hub.open("config").ready().await;
        hub.open("plugin-registry").ready().await;

        let batches = backend.upgrade_batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].1, vec!["plugin-registry".to_string()]);
    }

    #[tokio::test]
    async fn test_defaults_survive_restart() {
        let backend = Arc::new(MemoryBackend::new());

        let hub = StoreHub::new("db", backend.clone());
        let store = hub.open("config");
        store.set_defaults([("volume", 5)]).unwrap();
        store.ready().await;
        store.set("volume", &9).unwrap();
        store.flush().await;

        let restarted = StoreHub::new("db", backend.clone());
        let store = restarted.open("config");
        store.set_defaults([("volume", 5)]).unwrap();
        store.ready().await;
        assert_eq!(store.get("volume"), Some(json!(9)));
        // Existing namespaces are re-declared without harm.
        assert_eq!(backend.namespaces("db"), vec!["config"]);
    }

    #[tokio::test]
    async fn test_pre_connection_writes_persist_once() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = StoreHub::new("db", backend.clone());
        let store = hub.open("s");
        store.set("a", &json!({"x": 1})).unwrap();
        store.set("b", &2).unwrap();
        store.flush().await;

        let persisted = backend.load("db", "s").await.unwrap();
        assert_eq!(
            persisted,
            vec![
                ("a".to_string(), json!({"x": 1})),
                ("b".to_string(), json!(2)),
            ]
        );
    }

    /// Fails the next upgrade or load once when armed, then delegates.
    struct FlakyBackend {
        inner: MemoryBackend,
        upgrade_fails: AtomicBool,
        load_fails: AtomicBool,
    }

    impl FlakyBackend {
        fn new(upgrade_fails: bool, load_fails: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryBackend::new(),
                upgrade_fails: AtomicBool::new(upgrade_fails),
                load_fails: AtomicBool::new(load_fails),
            })
        }
    }

    #[async_trait]
    impl StoreBackend for FlakyBackend {
        async fn upgrade(&self, database: &str, namespaces: &[String]) -> Result<(), StoreError> {
            if self.upgrade_fails.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("disk unavailable".into()));
            }
            self.inner.upgrade(database, namespaces).await
        }

        async fn load(
            &self,
            database: &str,
            namespace: &str,
        ) -> Result<Vec<(String, Value)>, StoreError> {
            if self.load_fails.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("read timed out".into()));
            }
            self.inner.load(database, namespace).await
        }

        async fn put(
            &self,
            database: &str,
            namespace: &str,
            key: &str,
            value: &Value,
        ) -> Result<(), StoreError> {
            self.inner.put(database, namespace, key, value).await
        }

        async fn delete(
            &self,
            database: &str,
            namespace: &str,
            key: &str,
        ) -> Result<(), StoreError> {
            self.inner.delete(database, namespace, key).await
        }

        async fn clear(&self, database: &str, namespace: &str) -> Result<(), StoreError> {
            self.inner.clear(database, namespace).await
        }
    }

    #[tokio::test]
    async fn test_failed_upgrade_is_retried_by_next_open() {
        let backend = FlakyBackend::new(true, false);
        let hub = StoreHub::new("db", backend.clone());
        let first = hub.open("first");

        // Give the connection task a chance to fail.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!first.is_connected());

        let second = hub.open("second");
        first.ready().await;
        second.ready().await;
        assert_eq!(
            backend.inner.upgrade_batches(),
            vec![(
                "db".to_string(),
                vec!["first".to_string(), "second".to_string()]
            )]
        );
    }

    #[tokio::test]
    async fn test_failed_attach_is_retried_by_next_open() {
        let backend = FlakyBackend::new(false, true);
        let hub = StoreHub::new("db", backend.clone());
        let first = hub.open("first");
        first.set("early", &1).unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!first.is_connected());

        let second = hub.open("second");
        tokio::time::timeout(std::time::Duration::from_secs(2), first.ready())
            .await
            .expect("first store never connected");
        second.ready().await;
        assert_eq!(first.get("early"), Some(json!(1)));

        // The namespace was created once; only the attach was repeated.
        assert_eq!(
            backend.inner.upgrade_batches(),
            vec![
                ("db".to_string(), vec!["first".to_string()]),
                ("db".to_string(), vec!["second".to_string()]),
            ]
        );
    }
}
