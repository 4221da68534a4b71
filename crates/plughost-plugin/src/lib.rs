//! Plugin runtime for plughost.
//!
//! Plugins are untrusted code installed locally or fetched from a remote
//! source. The [`Runtime`] keeps their records in a [`PluginRegistry`],
//! evaluates them through a [`PluginLoader`] and hands each one a
//! rate-limited [`SandboxContext`] as its only capability. The whole state
//! can be exported to and merged back from a portable [`Snapshot`].

pub mod error;
pub mod fetch;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod ratelimit;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod snapshot;
pub mod wasm;

pub use error::PluginError;
pub use fetch::{HttpFetcher, SourceFetcher};
pub use host::{Host, NullHost};
pub use loader::{PluginHooks, PluginLoader};
pub use manifest::PluginManifest;
pub use record::{NewLocalPlugin, PluginOrigin, PluginRecord, RecordPatch};
pub use registry::{PluginRegistry, DEV_PLUGIN_ID};
pub use runtime::{PluginState, Runtime, RuntimeConfig, StopAll};
pub use sandbox::{Sandbox, SandboxConfig, SandboxContext};
pub use snapshot::{verify, ImportReport, Snapshot, SnapshotEntry};
pub use wasm::WasmLoader;
