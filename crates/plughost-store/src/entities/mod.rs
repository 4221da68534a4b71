pub mod store_entry;
pub mod store_namespace;
