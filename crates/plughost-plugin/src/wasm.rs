//! WebAssembly plugins run under Extism (wasmtime).
//!
//! A plugin's `code` is a base64-encoded WASM module. Lifecycle hooks are the
//! optional exports `on_load`, `on_unload`, `on_update`, `on_settings_change`
//! and `settings_view`. Every export receives a JSON document describing the
//! plugin's state and may answer with side-effect requests:
//!
//! ```json
//! {"host_requests": [{"function": "log_info", "args": {"message": "hi"}}]}
//! ```
//!
//! Requests are executed against the plugin's [`SandboxContext`], so they
//! are subject to the same rate limits as any other capability call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::PluginError;
use crate::loader::{PluginHooks, PluginLoader};
use crate::record::PluginRecord;
use crate::sandbox::{HttpMethod, HttpRequest, LogLevel, SandboxConfig, SandboxContext};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",              // Extism host functions
    "extism:host/env",  // Extism kernel
    "extism:host/user", // Extism user host functions
];

// ─── Host requests ──────────────────────────────────────────────────────

/// A side-effect request returned by a plugin export.
#[derive(Debug, Clone, Deserialize)]
struct HostRequest {
    function: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Default, Deserialize)]
struct PluginResponse {
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

/// What remains to be done after a request ran against the sandbox.
#[derive(Debug, PartialEq)]
enum RequestOutcome {
    Done,
    /// Call `callback` with `payload` now.
    Deliver { callback: String, payload: Value },
    /// Call `callback` after `delay`.
    Schedule { delay: Duration, callback: String },
}

fn str_arg<'a>(req: &'a HostRequest, name: &str) -> Result<&'a str, PluginError> {
    req.args[name].as_str().ok_or_else(|| {
        PluginError::Sandbox(format!("{}: missing string argument '{name}'", req.function))
    })
}

fn callback_arg(req: &HostRequest) -> Option<String> {
    req.args["callback"].as_str().map(str::to_string)
}

/// Run one request against the sandbox.
async fn execute(ctx: &SandboxContext, req: &HostRequest) -> Result<RequestOutcome, PluginError> {
    match req.function.as_str() {
        "log_info" | "log_warn" | "log_error" => {
            let level = match req.function.as_str() {
                "log_info" => LogLevel::Info,
                "log_warn" => LogLevel::Warn,
                _ => LogLevel::Error,
            };
            ctx.log(level, req.args["message"].as_str().unwrap_or_default())?;
            Ok(RequestOutcome::Done)
        }
        "http_get" | "http_post" => {
            let request = HttpRequest {
                method: if req.function == "http_get" {
                    HttpMethod::Get
                } else {
                    HttpMethod::Post
                },
                url: str_arg(req, "url")?.to_string(),
                headers: serde_json::from_value(req.args["headers"].clone()).unwrap_or_default(),
                body: req.args["body"].as_str().map(str::to_string),
            };
            let response = ctx.fetch(request).await?;
            Ok(match callback_arg(req) {
                Some(callback) => RequestOutcome::Deliver {
                    callback,
                    payload: serde_json::to_value(response)?,
                },
                None => RequestOutcome::Done,
            })
        }
        "set_timer" => {
            let delay = req.args["delay_ms"].as_u64().ok_or_else(|| {
                PluginError::Sandbox("set_timer: missing numeric argument 'delay_ms'".into())
            })?;
            let callback = callback_arg(req).ok_or_else(|| {
                PluginError::Sandbox("set_timer: missing string argument 'callback'".into())
            })?;
            Ok(RequestOutcome::Schedule {
                delay: Duration::from_millis(delay),
                callback,
            })
        }
        "store_set" => {
            let key = str_arg(req, "key")?;
            ctx.store()?.set(key, &req.args["value"])?;
            Ok(RequestOutcome::Done)
        }
        "store_delete" => {
            let key = str_arg(req, "key")?;
            ctx.store()?.delete(key);
            Ok(RequestOutcome::Done)
        }
        other => Err(PluginError::Sandbox(format!(
            "unknown host function '{other}'"
        ))),
    }
}

// ─── Validation ─────────────────────────────────────────────────────────

fn evaluation_error(id: &str, message: impl Into<String>) -> PluginError {
    PluginError::Evaluation {
        id: id.to_string(),
        message: message.into(),
    }
}

/// Decode the base64 payload of a record into WASM bytes.
fn decode_code(id: &str, code: &str) -> Result<Vec<u8>, PluginError> {
    let compact: String = code.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| evaluation_error(id, format!("code is not valid base64: {e}")))
}

/// Check magic bytes and import namespaces.
fn validate_wasm(id: &str, wasm_bytes: &[u8]) -> Result<(), PluginError> {
    use wasmparser::{Parser, Payload};

    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(evaluation_error(
            id,
            "invalid WASM binary: magic bytes mismatch",
        ));
    }

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload =
            payload.map_err(|e| evaluation_error(id, format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import
                    .map_err(|e| evaluation_error(id, format!("failed to read import: {e}")))?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(evaluation_error(
                        id,
                        format!(
                            "unauthorized import namespace: '{}' (function: '{}'); \
                             allowed namespaces: {:?}",
                            import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}

// ─── Loader ─────────────────────────────────────────────────────────────

/// Loads base64 WASM plugins into Extism sandboxes.
#[derive(Debug, Clone)]
pub struct WasmLoader {
    config: SandboxConfig,
}

impl WasmLoader {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PluginLoader for WasmLoader {
    async fn load(
        &self,
        record: &PluginRecord,
        context: SandboxContext,
    ) -> Result<Box<dyn PluginHooks>, PluginError> {
        let id = record.id.as_str();
        let wasm_bytes = decode_code(id, &record.code)?;
        validate_wasm(id, &wasm_bytes)?;

        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((self.config.memory_limit / 65536) as u32);

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(false)
            .with_fuel_limit(self.config.fuel_limit)
            .build()
            .map_err(|e| evaluation_error(id, e.to_string()))?;

        tracing::debug!(plugin = %id, "wasm module instantiated");

        Ok(Box::new(WasmHooks {
            module: Arc::new(WasmModule {
                id: id.to_string(),
                plugin: Mutex::new(plugin),
                ctx: context,
            }),
        }))
    }
}

struct WasmModule {
    id: String,
    plugin: Mutex<extism::Plugin>,
    ctx: SandboxContext,
}

impl WasmModule {
    /// JSON document passed to every export.
    fn input(&self, extra: Option<(&str, &Value)>) -> Vec<u8> {
        let store = self
            .ctx
            .store()
            .map(|s| Value::Object(s.entries().into_iter().collect()))
            .unwrap_or(Value::Null);
        let mut doc = json!({ "plugin_id": self.id, "store": store });
        if let Some((key, value)) = extra {
            doc[key] = value.clone();
        }
        serde_json::to_vec(&doc).unwrap_or_default()
    }

    /// Call an export if it exists. `Ok(None)` means it does not.
    fn call_export(&self, name: &str, input: &[u8]) -> Result<Option<Vec<u8>>, PluginError> {
        let mut plugin = self.plugin.lock();
        if !plugin.function_exists(name) {
            return Ok(None);
        }
        plugin
            .call::<&[u8], Vec<u8>>(name, input)
            .map(Some)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    PluginError::Sandbox(format!("plugin {} exceeded its fuel limit", self.id))
                } else {
                    PluginError::Hook(format!("{name}: {msg}"))
                }
            })
    }

    /// Call an export and carry out the requests it returns.
    fn run(self: Arc<Self>, name: String, input: Vec<u8>) -> BoxFuture<'static, Result<(), PluginError>> {
        async move {
            let Some(output) = self.call_export(&name, &input)? else {
                return Ok(());
            };
            if output.is_empty() {
                return Ok(());
            }
            match serde_json::from_slice::<PluginResponse>(&output) {
                Ok(response) => self.process(response.host_requests).await,
                Err(_) => {
                    tracing::debug!(plugin = %self.id, export = %name, "export returned non-JSON output");
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn process(self: &Arc<Self>, requests: Vec<HostRequest>) {
        if !requests.is_empty() {
            tracing::debug!(
                plugin = %self.id,
                count = requests.len(),
                "processing host function requests"
            );
        }

        for req in requests {
            let outcome = match execute(&self.ctx, &req).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        plugin = %self.id,
                        function = %req.function,
                        "host function request failed: {e}"
                    );
                    continue;
                }
            };

            match outcome {
                RequestOutcome::Done => {}
                RequestOutcome::Deliver { callback, payload } => {
                    let input = self.input(Some(("response", &payload)));
                    if let Err(e) = self.clone().run(callback.clone(), input).await {
                        tracing::error!(plugin = %self.id, callback = %callback, "callback failed: {e}");
                    }
                }
                RequestOutcome::Schedule { delay, callback } => {
                    let module = self.clone();
                    let scheduled = self.ctx.set_timer(delay, move || async move {
                        let input = module.input(None);
                        if let Err(e) = module.clone().run(callback.clone(), input).await {
                            tracing::error!(plugin = %module.id, callback = %callback, "timer callback failed: {e}");
                        }
                    });
                    if let Err(e) = scheduled {
                        tracing::error!(plugin = %self.id, "set_timer request failed: {e}");
                    }
                }
            }
        }
    }
}

struct WasmHooks {
    module: Arc<WasmModule>,
}

#[async_trait]
impl PluginHooks for WasmHooks {
    async fn on_load(&self) -> Result<(), PluginError> {
        let input = self.module.input(None);
        self.module.clone().run("on_load".into(), input).await
    }

    async fn on_unload(&self) -> Result<(), PluginError> {
        let input = self.module.input(None);
        self.module.clone().run("on_unload".into(), input).await
    }

    async fn on_update(&self) -> Result<(), PluginError> {
        let input = self.module.input(None);
        self.module.clone().run("on_update".into(), input).await
    }

    async fn on_settings_change(&self, settings: &Value) -> Result<(), PluginError> {
        let input = self.module.input(Some(("settings", settings)));
        self.module
            .clone()
            .run("on_settings_change".into(), input)
            .await
    }

    fn settings_view(&self) -> Option<Value> {
        let input = self.module.input(None);
        match self.module.call_export("settings_view", &input) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(plugin = %self.module.id, "settings_view failed: {e}");
                None
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
