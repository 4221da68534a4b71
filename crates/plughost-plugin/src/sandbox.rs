//! Capability sandbox handed to running plugin code.
//!
//! Every plugin gets its own [`Sandbox`]. The plugin only ever sees a
//! [`SandboxContext`]: logging, outbound HTTP, timers, its private store and
//! the host. Each metered capability has an independent rate limiter; once
//! the sandbox is disposed its timers are cancelled and every further call
//! through a stale context fails instead of acting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use plughost_store::Store;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::error::PluginError;
use crate::host::Host;
use crate::ratelimit::RateLimiter;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Limits applied to every plugin sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Log calls per window (default: 100).
    pub log_quota: u32,
    /// HTTP requests per window (default: 30).
    pub network_quota: u32,
    /// Timers scheduled per window (default: 50).
    pub timer_quota: u32,
    /// Rolling window shared by all quotas (default: 60s).
    pub rate_window: Duration,
    /// Longest delay a timer may request (default: 1h).
    pub max_timer_delay: Duration,
    /// HTTP request timeout in seconds (default: 10).
    pub http_timeout_secs: u64,
    /// Maximum HTTP response body size (default: 10 MB).
    pub max_response_bytes: usize,
    /// Allow requests to loopback and private addresses (default: false).
    pub allow_private_hosts: bool,
    /// WASM memory cap in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// WASM fuel per call (default: 1_000_000).
    pub fuel_limit: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            log_quota: 100,
            network_quota: 30,
            timer_quota: 50,
            rate_window: Duration::from_secs(60),
            max_timer_delay: Duration::from_secs(3600),
            http_timeout_secs: 10,
            max_response_bytes: 10 * 1024 * 1024,
            allow_private_hosts: false,
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            log_quota: env_or("PLUGIN_LOG_QUOTA", 100),
            network_quota: env_or("PLUGIN_NETWORK_QUOTA", 30),
            timer_quota: env_or("PLUGIN_TIMER_QUOTA", 50),
            rate_window: Duration::from_secs(env_or("PLUGIN_RATE_WINDOW_SECS", 60)),
            max_timer_delay: Duration::from_secs(env_or("PLUGIN_MAX_TIMER_DELAY_SECS", 3600)),
            http_timeout_secs: env_or("PLUGIN_HTTP_TIMEOUT_SECS", 10),
            max_response_bytes: env_or::<usize>("PLUGIN_MAX_RESPONSE_MB", 10) * 1024 * 1024,
            allow_private_hosts: std::env::var("PLUGIN_ALLOW_PRIVATE_HOSTS")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
            memory_limit: env_or::<usize>("PLUGIN_MEMORY_LIMIT_MB", 32) * 1024 * 1024,
            fuel_limit: env_or("PLUGIN_FUEL_LIMIT", 1_000_000),
        }
    }

    /// HTTP client shared by all sandboxes built from this config.
    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.http_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default()
    }
}

// ─── Capability types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Outbound request made by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::new(),
            body: Some(body.into()),
        }
    }
}

/// HTTP response returned to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy)]
enum Capability {
    Log,
    Network,
    Timer,
}

impl Capability {
    fn name(self) -> &'static str {
        match self {
            Capability::Log => "log",
            Capability::Network => "network",
            Capability::Timer => "timer",
        }
    }
}

struct Limiters {
    log: RateLimiter,
    network: RateLimiter,
    timer: RateLimiter,
}

impl Limiters {
    fn get(&self, capability: Capability) -> &RateLimiter {
        match capability {
            Capability::Log => &self.log,
            Capability::Network => &self.network,
            Capability::Timer => &self.timer,
        }
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

struct SandboxShared {
    plugin_id: String,
    config: SandboxConfig,
    http: reqwest::Client,
    store: Store,
    host: Arc<dyn Host>,
    disposed: AtomicBool,
    limiters: Limiters,
    timers: Mutex<HashMap<u64, AbortHandle>>,
    next_timer: AtomicU64,
}

/// Owner of everything allocated on behalf of one running plugin.
pub struct Sandbox {
    shared: Arc<SandboxShared>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin_id", &self.shared.plugin_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub fn new(
        plugin_id: impl Into<String>,
        config: SandboxConfig,
        http: reqwest::Client,
        store: Store,
        host: Arc<dyn Host>,
    ) -> Self {
        let window = config.rate_window;
        let limiters = Limiters {
            log: RateLimiter::new(config.log_quota, window),
            network: RateLimiter::new(config.network_quota, window),
            timer: RateLimiter::new(config.timer_quota, window),
        };
        Self {
            shared: Arc::new(SandboxShared {
                plugin_id: plugin_id.into(),
                config,
                http,
                store,
                host,
                disposed: AtomicBool::new(false),
                limiters,
                timers: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    /// The capability object given to plugin code.
    pub fn context(&self) -> SandboxContext {
        SandboxContext {
            shared: self.shared.clone(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Cancel every pending timer and revoke all contexts.
    ///
    /// Returns the number of timers cancelled. Idempotent.
    pub fn dispose(&self) -> usize {
        self.shared.disposed.store(true, Ordering::SeqCst);
        let timers: Vec<AbortHandle> = self.shared.timers.lock().drain().map(|(_, h)| h).collect();
        for handle in &timers {
            handle.abort();
        }
        tracing::debug!(
            plugin = %self.shared.plugin_id,
            timers = timers.len(),
            "sandbox disposed"
        );
        timers.len()
    }
}

/// Capabilities available to a plugin. Cheap to clone.
#[derive(Clone)]
pub struct SandboxContext {
    shared: Arc<SandboxShared>,
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("plugin_id", &self.shared.plugin_id)
            .finish_non_exhaustive()
    }
}

impl SandboxContext {
    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    fn check_alive(&self) -> Result<(), PluginError> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(PluginError::Sandbox("sandbox disposed".into()));
        }
        Ok(())
    }

    fn admit(&self, capability: Capability) -> Result<(), PluginError> {
        self.check_alive()?;
        if !self.shared.limiters.get(capability).check() {
            tracing::warn!(
                plugin = %self.shared.plugin_id,
                capability = capability.name(),
                "rate limit exceeded"
            );
            return Err(PluginError::RateLimitExceeded {
                id: self.shared.plugin_id.clone(),
                capability: capability.name(),
            });
        }
        Ok(())
    }

    // ── Logging ──────────────────────────────────────────────────────

    /// Log a message on behalf of the plugin.
    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), PluginError> {
        self.admit(Capability::Log)?;
        let msg = sanitize_log_message(message);
        let plugin = &self.shared.plugin_id;
        match level {
            LogLevel::Debug => tracing::debug!(plugin = %plugin, "{msg}"),
            LogLevel::Info => tracing::info!(plugin = %plugin, "{msg}"),
            LogLevel::Warn => tracing::warn!(plugin = %plugin, "{msg}"),
            LogLevel::Error => tracing::error!(plugin = %plugin, "{msg}"),
        }
        Ok(())
    }

    // ── HTTP ─────────────────────────────────────────────────────────

    /// Only http and https URLs are reachable; private addresses are
    /// blocked unless the config allows them.
    fn check_url(&self, url_str: &str) -> Result<(), PluginError> {
        let url = url::Url::parse(url_str)
            .map_err(|_| PluginError::Sandbox(format!("invalid URL: {url_str}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PluginError::Sandbox(format!(
                "scheme '{}' is not allowed; use http or https",
                url.scheme()
            )));
        }

        if self.shared.config.allow_private_hosts {
            return Ok(());
        }

        let host = match url.host() {
            Some(h) => h,
            None => return Ok(()),
        };
        let blocked = match host {
            url::Host::Domain(d) => {
                matches!(d, "localhost" | "metadata.google.internal")
            }
            url::Host::Ipv4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            url::Host::Ipv6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local()
                    || v6.to_ipv4_mapped().is_some_and(|v4| {
                        v4.is_private() || v4.is_loopback() || v4.is_link_local()
                    })
            }
        };
        if blocked {
            return Err(PluginError::Sandbox(format!(
                "HTTP requests to '{host}' are blocked (private/reserved address)"
            )));
        }
        Ok(())
    }

    /// Perform an HTTP request.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, PluginError> {
        self.check_alive()?;
        self.check_url(&request.url)?;
        self.admit(Capability::Network)?;

        let mut req = match request.method {
            HttpMethod::Get => self.shared.http.get(&request.url),
            HttpMethod::Post => self
                .shared
                .http
                .post(&request.url)
                .body(request.body.unwrap_or_default()),
        };
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;

        self.read_response(resp).await
    }

    /// Read HTTP response with body size limit.
    async fn read_response(&self, resp: reqwest::Response) -> Result<HttpResponse, PluginError> {
        let max = self.shared.config.max_response_bytes;
        if resp.content_length().is_some_and(|len| len as usize > max) {
            return Err(PluginError::Http(format!(
                "response body too large (max: {max} bytes)"
            )));
        }

        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body_bytes = resp
            .bytes()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;

        if body_bytes.len() > max {
            return Err(PluginError::Http(format!(
                "response body too large: {} bytes (max: {max} bytes)",
                body_bytes.len()
            )));
        }

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body_bytes).to_string(),
        })
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Run `task` once after `delay`.
    pub fn set_timer<F, Fut>(&self, delay: Duration, task: F) -> Result<TimerId, PluginError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.check_alive()?;
        let max = self.shared.config.max_timer_delay;
        if delay > max {
            return Err(PluginError::Sandbox(format!(
                "timer delay {}ms exceeds the maximum of {}ms",
                delay.as_millis(),
                max.as_millis()
            )));
        }
        self.admit(Capability::Timer)?;

        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SandboxShared> = Arc::downgrade(&self.shared);

        // Hold the map while spawning so the task cannot remove itself first.
        let mut timers = self.shared.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.disposed.load(Ordering::SeqCst) {
                return;
            }
            shared.timers.lock().remove(&id);
            drop(shared);
            task().await;
        });
        timers.insert(id, handle.abort_handle());
        Ok(TimerId(id))
    }

    /// Cancel a pending timer. Returns whether it was still pending.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        match self.shared.timers.lock().remove(&id.0) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }

    // ── Store and host ───────────────────────────────────────────────

    /// The plugin's private store.
    pub fn store(&self) -> Result<Store, PluginError> {
        self.check_alive()?;
        Ok(self.shared.store.clone())
    }

    pub fn host(&self) -> Arc<dyn Host> {
        self.shared.host.clone()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
