//! A single named key/value store.
//!
//! A [`Store`] is usable as soon as it is created. Until its hub attaches it
//! to a backend it only holds the mutations made locally; on attach it loads
//! the persisted entries, replays those mutations on top of them exactly once
//! and from then on forwards every mutation to a per-store writer task in
//! order.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backend::StoreBackend;
use crate::error::StoreError;
use crate::value::to_store_value;

/// Store contents in insertion order.
pub type Entries = IndexMap<String, Value>;

type ReadyCallback = Box<dyn FnOnce(&Store) + Send>;

#[derive(Debug, Clone)]
enum Mutation {
    Set(String, Value),
    Delete(String),
    Clear,
}

impl Mutation {
    fn apply_to(&self, data: &mut Entries) {
        match self {
            Mutation::Set(key, value) => {
                data.insert(key.clone(), value.clone());
            }
            Mutation::Delete(key) => {
                data.shift_remove(key);
            }
            Mutation::Clear => data.clear(),
        }
    }

    async fn persist(
        self,
        backend: &dyn StoreBackend,
        database: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        match self {
            Mutation::Set(key, value) => backend.put(database, namespace, &key, &value).await,
            Mutation::Delete(key) => backend.delete(database, namespace, &key).await,
            Mutation::Clear => backend.clear(database, namespace).await,
        }
    }
}

enum WriteOp {
    Apply(Mutation),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct StoreState {
    data: Entries,
    /// Mutations made before the store was attached, in order.
    pending: Vec<Mutation>,
    /// Default batches registered before the store was attached.
    defaults: Vec<Entries>,
    ready_callbacks: Vec<ReadyCallback>,
    /// Present once attached; doubles as the connected flag under the lock.
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
}

struct StoreInner {
    name: String,
    state: Mutex<StoreState>,
    connected: watch::Sender<bool>,
    snapshot: watch::Sender<Arc<Entries>>,
}

/// Handle to one named store. Clones share the same contents.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Store {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (connected, _) = watch::channel(false);
        let (snapshot, _) = watch::channel(Arc::new(Entries::new()));
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                state: Mutex::new(StoreState::default()),
                connected,
                snapshot,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the backing connection has been established. Never reverts.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Run `callback` once the store is connected.
    ///
    /// Runs immediately on the calling thread if already connected. Queued
    /// callbacks run in registration order right after the store connects.
    pub fn when_ready<F>(&self, callback: F)
    where
        F: FnOnce(&Store) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.writer.is_some() {
            drop(state);
            callback(self);
            return;
        }
        state.ready_callbacks.push(Box::new(callback));
    }

    /// Wait until the store is connected.
    pub async fn ready(&self) {
        let mut rx = self.inner.connected.subscribe();
        // The sender lives inside `self`, so this can only end by connecting.
        let _ = rx.wait_for(|connected| *connected).await;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().data.get(key).cloned()
    }

    /// Read and deserialize a value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.state.lock().data.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().data.keys().cloned().collect()
    }

    /// A copy of the current contents.
    pub fn entries(&self) -> Entries {
        self.inner.state.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `value` under `key`.
    ///
    /// Values without a lossless JSON form are rejected and leave the store
    /// untouched.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), StoreError> {
        let value = to_store_value(value)?;
        self.mutate(Mutation::Set(key.into(), value));
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let existed = self.contains_key(key);
        self.mutate(Mutation::Delete(key.to_string()));
        existed
    }

    pub fn clear(&self) {
        self.mutate(Mutation::Clear);
    }

    /// Set every key of `defaults` that the store does not already hold.
    ///
    /// Before the store is connected the defaults are deferred and only
    /// fill keys still missing once persisted data has been loaded, so a
    /// value saved in an earlier run is never overwritten.
    pub fn set_defaults<I, K, V>(&self, defaults: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Serialize,
    {
        let mut batch = Entries::new();
        for (key, value) in defaults {
            batch.insert(key.into(), to_store_value(&value)?);
        }

        let mut state = self.inner.state.lock();
        if state.writer.is_none() {
            state.defaults.push(batch);
            return Ok(());
        }

        let mut changed = false;
        for (key, value) in batch {
            if state.data.contains_key(&key) {
                continue;
            }
            let mutation = Mutation::Set(key, value);
            mutation.apply_to(&mut state.data);
            Self::forward(&mut state, mutation);
            changed = true;
        }
        if changed {
            self.publish(&state.data);
        }
        Ok(())
    }

    /// A live, read-only view of the contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            rx: self.inner.snapshot.subscribe(),
        }
    }

    /// Wait until every mutation made so far has reached the backend.
    pub async fn flush(&self) {
        self.ready().await;
        let (tx, rx) = oneshot::channel();
        let sent = {
            let state = self.inner.state.lock();
            state
                .writer
                .as_ref()
                .is_some_and(|writer| writer.send(WriteOp::Flush(tx)).is_ok())
        };
        if sent {
            let _ = rx.await;
        }
    }

    fn mutate(&self, mutation: Mutation) {
        let mut state = self.inner.state.lock();
        mutation.apply_to(&mut state.data);
        Self::forward(&mut state, mutation);
        self.publish(&state.data);
    }

    fn forward(state: &mut StoreState, mutation: Mutation) {
        match &state.writer {
            Some(writer) => {
                let _ = writer.send(WriteOp::Apply(mutation));
            }
            None => state.pending.push(mutation),
        }
    }

    fn publish(&self, data: &Entries) {
        self.inner.snapshot.send_replace(Arc::new(data.clone()));
    }

    /// Connect this store to `backend`. The namespace must already exist.
    pub(crate) async fn attach(
        &self,
        database: &str,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<(), StoreError> {
        let persisted = backend.load(database, &self.inner.name).await?;

        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.writer.is_some() {
                return Ok(());
            }

            let mut data: Entries = persisted.into_iter().collect();
            let mut writes = std::mem::take(&mut state.pending);
            for mutation in &writes {
                mutation.apply_to(&mut data);
            }
            for batch in std::mem::take(&mut state.defaults) {
                for (key, value) in batch {
                    if !data.contains_key(&key) {
                        let mutation = Mutation::Set(key, value);
                        mutation.apply_to(&mut data);
                        writes.push(mutation);
                    }
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            for mutation in writes {
                let _ = tx.send(WriteOp::Apply(mutation));
            }
            tokio::spawn(run_writer(
                database.to_string(),
                self.inner.name.clone(),
                backend,
                rx,
            ));

            state.writer = Some(tx);
            state.data = data;
            self.publish(&state.data);
            self.inner.connected.send_replace(true);
            std::mem::take(&mut state.ready_callbacks)
        };

        tracing::debug!(store = %self.inner.name, "store connected");
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }
}

async fn run_writer(
    database: String,
    namespace: String,
    backend: Arc<dyn StoreBackend>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Apply(mutation) => {
                if let Err(e) = mutation.persist(backend.as_ref(), &database, &namespace).await {
                    tracing::error!(store = %namespace, "failed to persist store mutation: {e}");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Read-only view of a store that tracks every mutation.
#[derive(Clone)]
pub struct StoreSnapshot {
    rx: watch::Receiver<Arc<Entries>>,
}

impl StoreSnapshot {
    /// Contents as of the latest mutation.
    pub fn current(&self) -> Arc<Entries> {
        self.rx.borrow().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.rx.borrow().get(key).cloned()
    }

    /// Wait for the next mutation and return the new contents.
    ///
    /// Returns `None` once the store itself has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Entries>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn backend_with(name: &str) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.upgrade("db", &[name.to_string()]).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_pre_connection_writes_flushed_once() {
        let backend = backend_with("s").await;
        backend.put("db", "s", "kept", &json!("old")).await.unwrap();
        backend.put("db", "s", "dropped", &json!(1)).await.unwrap();

        let store = Store::new("s");
        assert!(store.get("kept").is_none());
        store.set("fresh", &json!(true)).unwrap();
        store.delete("dropped");
        store.set("fresh", &json!(false)).unwrap();

        store.attach("db", backend.clone()).await.unwrap();
        store.flush().await;

        assert_eq!(store.get("kept"), Some(json!("old")));
        assert_eq!(store.get("fresh"), Some(json!(false)));
        assert!(store.get("dropped").is_none());

        let persisted = backend.load("db", "s").await.unwrap();
        assert_eq!(
            persisted,
            vec![
                ("kept".to_string(), json!("old")),
                ("fresh".to_string(), json!(false)),
            ]
        );
    }

    #[tokio::test]
    async fn test_ready_callbacks_run_in_order() {
        let backend = backend_with("s").await;
        let store = Store::new("s");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            store.when_ready(move |_| order.lock().push(i));
        }
        assert!(order.lock().is_empty());
        assert!(!store.is_connected());

        store.attach("db", backend).await.unwrap();
        assert!(store.is_connected());
        assert_eq!(*order.lock(), vec![0, 1, 2]);

        // Already connected: runs synchronously.
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.when_ready(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_defaults_never_overwrite_persisted() {
        let backend = backend_with("s").await;
        backend.put("db", "s", "theme", &json!("dark")).await.unwrap();

        let store = Store::new("s");
        store
            .set_defaults([("theme", json!("light")), ("size", json!(12))])
            .unwrap();
        // Deferred until connected.
        assert!(store.get("size").is_none());

        store.attach("db", backend.clone()).await.unwrap();
        assert_eq!(store.get("theme"), Some(json!("dark")));
        assert_eq!(store.get("size"), Some(json!(12)));

        store.set("size", &14).unwrap();
        store.set_defaults([("size", 12), ("extra", 1)]).unwrap();
        assert_eq!(store.get("size"), Some(json!(14)));
        assert_eq!(store.get("extra"), Some(json!(1)));

        store.flush().await;
        let persisted: Entries = backend.load("db", "s").await.unwrap().into_iter().collect();
        assert_eq!(persisted["theme"], json!("dark"));
        assert_eq!(persisted["size"], json!(14));
    }

    #[tokio::test]
    async fn test_defaults_skip_keys_written_before_connect() {
        let backend = backend_with("s").await;
        let store = Store::new("s");
        store.set_defaults([("mode", "auto")]).unwrap();
        store.set("mode", "manual").unwrap();
        store.attach("db", backend).await.unwrap();
        assert_eq!(store.get("mode"), Some(json!("manual")));
    }

    #[tokio::test]
    async fn test_snapshot_tracks_mutations() {
        let store = Store::new("s");
        let mut snapshot = store.snapshot();
        assert!(snapshot.current().is_empty());

        store.set("a", &1).unwrap();
        let after = snapshot.changed().await.unwrap();
        assert_eq!(after.get("a"), Some(&json!(1)));

        store.delete("a");
        assert!(snapshot.changed().await.unwrap().is_empty());
        assert!(snapshot.get("a").is_none());
    }

    #[tokio::test]
    async fn test_rejected_value_leaves_store_untouched() {
        let store = Store::new("s");
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not strings");
        assert!(matches!(store.set("k", &bad), Err(StoreError::Value(_))));
        assert!(store.is_empty());

        store.set("x", &1.5).unwrap();
        assert!(matches!(store.set("x", &f64::NAN), Err(StoreError::Value(_))));
        assert!(matches!(
            store.set("y", &vec![f64::INFINITY]),
            Err(StoreError::Value(_))
        ));
        assert_eq!(store.get("x"), Some(json!(1.5)));
        assert!(!store.contains_key("y"));
    }

    #[tokio::test]
    async fn test_get_as_typed() {
        let store = Store::new("s");
        store.set("list", &vec![1, 2, 3]).unwrap();
        let list: Option<Vec<u32>> = store.get_as("list").unwrap();
        assert_eq!(list, Some(vec![1, 2, 3]));
        assert!(store.get_as::<String>("list").is_err());
        assert_eq!(store.get_as::<String>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_is_persisted() {
        let backend = backend_with("s").await;
        let store = Store::new("s");
        store.attach("db", backend.clone()).await.unwrap();
        store.set("a", &1).unwrap();
        store.set("b", &2).unwrap();
        store.clear();
        store.set("c", &3).unwrap();
        store.flush().await;
        assert_eq!(store.keys(), vec!["c"]);
        assert_eq!(backend.load("db", "s").await.unwrap().len(), 1);
    }
}
