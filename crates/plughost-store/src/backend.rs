//! Durable storage media behind a [`StoreHub`](crate::StoreHub).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StoreError;

/// A durable medium holding one key/value namespace per store name.
///
/// Namespaces are grouped by logical `database`. A namespace must be created
/// by [`upgrade`](StoreBackend::upgrade) before it can be read or written.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Create every namespace in `namespaces` that does not exist yet.
    ///
    /// All names are created in one atomic step; on error none of them are.
    async fn upgrade(&self, database: &str, namespaces: &[String]) -> Result<(), StoreError>;

    /// All entries of a namespace, in insertion order.
    async fn load(&self, database: &str, namespace: &str)
        -> Result<Vec<(String, Value)>, StoreError>;

    /// Insert or overwrite one entry. Overwriting keeps the original position.
    async fn put(
        &self,
        database: &str,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), StoreError>;

    async fn delete(&self, database: &str, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// Remove every entry of a namespace; the namespace itself remains.
    async fn clear(&self, database: &str, namespace: &str) -> Result<(), StoreError>;
}

type NamespaceKey = (String, String);

#[derive(Default)]
struct MemoryState {
    namespaces: HashSet<NamespaceKey>,
    entries: HashMap<NamespaceKey, IndexMap<String, Value>>,
    upgrades: Vec<(String, Vec<String>)>,
}

/// In-process backend. Data lives as long as the backend value.
///
/// Records every upgrade batch so callers can observe how namespace
/// creation was grouped.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `upgrade` call so far as `(database, namespaces)`.
    pub fn upgrade_batches(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().upgrades.clone()
    }

    /// Names of the namespaces that exist in `database`.
    pub fn namespaces(&self, database: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .namespaces
            .iter()
            .filter(|(db, _)| db == database)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn check_namespace(
        state: &MemoryState,
        database: &str,
        namespace: &str,
    ) -> Result<NamespaceKey, StoreError> {
        let key = (database.to_string(), namespace.to_string());
        if !state.namespaces.contains(&key) {
            return Err(StoreError::Backend(format!(
                "namespace '{namespace}' does not exist in '{database}'"
            )));
        }
        Ok(key)
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn upgrade(&self, database: &str, namespaces: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .upgrades
            .push((database.to_string(), namespaces.to_vec()));
        for name in namespaces {
            state
                .namespaces
                .insert((database.to_string(), name.clone()));
        }
        Ok(())
    }

    async fn load(
        &self,
        database: &str,
        namespace: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let state = self.state.lock();
        let key = Self::check_namespace(&state, database, namespace)?;
        Ok(state
            .entries
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(
        &self,
        database: &str,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let ns = Self::check_namespace(&state, database, namespace)?;
        state
            .entries
            .entry(ns)
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, database: &str, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let ns = Self::check_namespace(&state, database, namespace)?;
        if let Some(entries) = state.entries.get_mut(&ns) {
            entries.shift_remove(key);
        }
        Ok(())
    }

    async fn clear(&self, database: &str, namespace: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let ns = Self::check_namespace(&state, database, namespace)?;
        state.entries.remove(&ns);
        Ok(())
    }
}
