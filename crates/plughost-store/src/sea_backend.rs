//! Database-backed store medium (sea-orm; sqlite or postgres).

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde_json::Value;

use crate::backend::StoreBackend;
use crate::entities::{store_entry, store_namespace};
use crate::error::StoreError;

/// Stores namespaces and entries in the `store_namespaces` / `store_entries`
/// tables created by `plughost-migration`.
#[derive(Clone)]
pub struct SeaOrmBackend {
    db: DatabaseConnection,
}

impl SeaOrmBackend {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get the database connection.
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn namespace_exists<C: ConnectionTrait>(
        conn: &C,
        database: &str,
        namespace: &str,
    ) -> Result<bool, StoreError> {
        let found = store_namespace::Entity::find()
            .filter(store_namespace::Column::Database.eq(database))
            .filter(store_namespace::Column::Name.eq(namespace))
            .one(conn)
            .await?;
        Ok(found.is_some())
    }

    async fn require_namespace(&self, database: &str, namespace: &str) -> Result<(), StoreError> {
        if !Self::namespace_exists(&self.db, database, namespace).await? {
            return Err(StoreError::Backend(format!(
                "namespace '{namespace}' does not exist in '{database}'"
            )));
        }
        Ok(())
    }

    fn entry_filter(
        database: &str,
        namespace: &str,
    ) -> sea_orm::Select<store_entry::Entity> {
        store_entry::Entity::find()
            .filter(store_entry::Column::Database.eq(database))
            .filter(store_entry::Column::Namespace.eq(namespace))
    }
}

#[async_trait]
impl StoreBackend for SeaOrmBackend {
    async fn upgrade(&self, database: &str, namespaces: &[String]) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;
        let now = chrono::Utc::now().fixed_offset();

        for name in namespaces {
            if Self::namespace_exists(&txn, database, name).await? {
                continue;
            }
            store_namespace::ActiveModel {
                database: Set(database.to_string()),
                name: Set(name.clone()),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        tracing::debug!(database = %database, namespaces = ?namespaces, "store schema upgraded");
        Ok(())
    }

    async fn load(
        &self,
        database: &str,
        namespace: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        self.require_namespace(database, namespace).await?;

        let rows = Self::entry_filter(database, namespace)
            .order_by_asc(store_entry::Column::Id)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<(String, Value), StoreError> {
                Ok((row.key, serde_json::from_str(&row.value)?))
            })
            .collect()
    }

    async fn put(
        &self,
        database: &str,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.require_namespace(database, namespace).await?;

        let entry = store_entry::ActiveModel {
            database: Set(database.to_string()),
            namespace: Set(namespace.to_string()),
            key: Set(key.to_string()),
            value: Set(serde_json::to_string(value)?),
            updated_at: Set(chrono::Utc::now().fixed_offset()),
            ..Default::default()
        };

        store_entry::Entity::insert(entry)
            .on_conflict(
                OnConflict::columns([
                    store_entry::Column::Database,
                    store_entry::Column::Namespace,
                    store_entry::Column::Key,
                ])
                .update_columns([store_entry::Column::Value, store_entry::Column::UpdatedAt])
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete(&self, database: &str, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.require_namespace(database, namespace).await?;
        store_entry::Entity::delete_many()
            .filter(store_entry::Column::Database.eq(database))
            .filter(store_entry::Column::Namespace.eq(namespace))
            .filter(store_entry::Column::Key.eq(key))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn clear(&self, database: &str, namespace: &str) -> Result<(), StoreError> {
        self.require_namespace(database, namespace).await?;
        store_entry::Entity::delete_many()
            .filter(store_entry::Column::Database.eq(database))
            .filter(store_entry::Column::Namespace.eq(namespace))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plughost_migration::{Migrator, MigratorTrait};
    use serde_json::json;

    async fn sqlite_backend(dir: &tempfile::TempDir) -> SeaOrmBackend {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display());
        let db = sea_orm::Database::connect(&url)
            .await
            .expect("failed to open sqlite database");
        Migrator::up(&db, None).await.expect("migrations failed");
        SeaOrmBackend::new(db)
    }

    #[tokio::test]
    async fn test_upgrade_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite_backend(&dir).await;
        let names = vec!["config".to_string(), "plugin-registry".to_string()];
        backend.upgrade("main", &names).await.unwrap();
        backend.upgrade("main", &names).await.unwrap();
        assert!(backend.load("main", "config").await.unwrap().is_empty());
        assert!(backend.load("other", "config").await.is_err());
    }

    #[tokio::test]
    async fn test_put_load_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite_backend(&dir).await;
        backend.upgrade("main", &["ns".to_string()]).await.unwrap();

        backend.put("main", "ns", "b", &json!({"n": 1})).await.unwrap();
        backend.put("main", "ns", "a", &json!([1, 2])).await.unwrap();
        backend.put("main", "ns", "b", &json!({"n": 2})).await.unwrap();

        let entries = backend.load("main", "ns").await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("b".to_string(), json!({"n": 2})),
                ("a".to_string(), json!([1, 2])),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite_backend(&dir).await;
        backend
            .upgrade("main", &["ns".to_string(), "other".to_string()])
            .await
            .unwrap();
        backend.put("main", "ns", "a", &json!(1)).await.unwrap();
        backend.put("main", "ns", "b", &json!(2)).await.unwrap();
        backend.put("main", "other", "a", &json!(3)).await.unwrap();

        backend.delete("main", "ns", "a").await.unwrap();
        assert_eq!(backend.load("main", "ns").await.unwrap().len(), 1);

        backend.clear("main", "ns").await.unwrap();
        assert!(backend.load("main", "ns").await.unwrap().is_empty());
        assert_eq!(backend.load("main", "other").await.unwrap().len(), 1);
    }
}
