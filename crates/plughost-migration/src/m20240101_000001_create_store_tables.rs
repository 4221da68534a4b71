use sea_orm_migration::prelude::*;

/// Migration 1: Create the durable store tables.
///
/// Two tables:
/// - `store_namespaces`: every namespace created by a schema upgrade, per logical database
/// - `store_entries`: key/value rows; the auto-increment id preserves insertion order
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ── store_namespaces table ────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(StoreNamespaces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StoreNamespaces::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(StoreNamespaces::Database)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(StoreNamespaces::Name).string_len(255).not_null())
                    .col(
                        ColumnDef::new(StoreNamespaces::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_store_namespaces_database_name")
                    .table(StoreNamespaces::Table)
                    .col(StoreNamespaces::Database)
                    .col(StoreNamespaces::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ── store_entries table ───────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(StoreEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StoreEntries::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StoreEntries::Database).string_len(255).not_null())
                    .col(ColumnDef::new(StoreEntries::Namespace).string_len(255).not_null())
                    .col(ColumnDef::new(StoreEntries::Key).string_len(1024).not_null())
                    .col(ColumnDef::new(StoreEntries::Value).text().not_null())
                    .col(
                        ColumnDef::new(StoreEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_store_entries_namespace_key")
                    .table(StoreEntries::Table)
                    .col(StoreEntries::Database)
                    .col(StoreEntries::Namespace)
                    .col(StoreEntries::Key)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StoreEntries::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(StoreNamespaces::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum StoreNamespaces {
    Table,
    Id,
    Database,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum StoreEntries {
    Table,
    Id,
    Database,
    Namespace,
    Key,
    Value,
    UpdatedAt,
}
