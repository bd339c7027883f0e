use hapax_core::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration document — maps onto the structure in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HapaxConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub providers: HashMap<String, ProviderEntry>,
    pub provider_preference: Vec<String>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    pub routes: Vec<RouteConfig>,
    pub test_mode: bool,
}

/// A provider entry under `providers.<name>` — the name itself is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
    pub api_key: String,
    pub endpoint: Option<String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            provider_type: "generic".into(),
            model: String::new(),
            api_key: String::new(),
            endpoint: None,
        }
    }
}

impl ProviderEntry {
    pub fn into_provider_config(self, name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            provider_type: self.provider_type,
            model: self.model,
            api_key: self.api_key,
            endpoint: self.endpoint,
        }
    }
}

// ── Server ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: DurationSecs,
    pub write_timeout: DurationSecs,
    pub max_header_bytes: usize,
    pub shutdown_timeout: DurationSecs,
    pub http3: Http3Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: DurationSecs(15),
            write_timeout: DurationSecs(15),
            max_header_bytes: 1 << 20,
            shutdown_timeout: DurationSecs(5),
            http3: Http3Config::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Http3Config {
    pub enabled: bool,
    pub port: u16,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub idle_timeout: DurationSecs,
    pub max_bi_streams_concurrent: u64,
    pub max_uni_streams_concurrent: u64,
    pub max_stream_receive_window: u64,
    pub max_connection_receive_window: u64,
    pub enable_0rtt: bool,
    pub allow_0rtt_replay: bool,
    pub max_0rtt_size: u64,
    pub udp_receive_buffer_size: usize,
}

impl Default for Http3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8443,
            tls_cert_file: None,
            tls_key_file: None,
            idle_timeout: DurationSecs(30),
            max_bi_streams_concurrent: 100,
            max_uni_streams_concurrent: 100,
            max_stream_receive_window: 1 << 20,
            max_connection_receive_window: 10 << 20,
            enable_0rtt: false,
            allow_0rtt_replay: false,
            max_0rtt_size: 16 * 1024,
            udp_receive_buffer_size: 2 << 20,
        }
    }
}

/// A plain integer number of seconds — `toml` stores durations as integers
/// in this codebase rather than pulling in `humantime` for a config surface
/// this small.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(pub i64);

impl DurationSecs {
    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.max(0) as u64)
    }
}

// ── LLM ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub endpoint: Option<String>,
    pub system_prompt: Option<String>,
    pub max_context_tokens: usize,
    pub cache: Option<serde_json::Value>,
    pub retry: Option<serde_json::Value>,
    pub options: serde_json::Value,
    pub health_check: HealthCheckConfig,
    pub backup_providers: Vec<BackupProvider>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            api_key: String::new(),
            endpoint: None,
            system_prompt: None,
            max_context_tokens: 8192,
            cache: None,
            retry: None,
            options: serde_json::Value::Object(Default::default()),
            health_check: HealthCheckConfig::default(),
            backup_providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupProvider {
    pub provider: String,
    pub model: String,
    pub api_key: String,
}

impl Default for BackupProvider {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: DurationSecs,
    pub timeout: DurationSecs,
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DurationSecs(60),
            timeout: DurationSecs(5),
            failure_threshold: 3,
        }
    }
}

// ── Circuit breaker ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub max_requests: u32,
    pub interval: DurationSecs,
    pub timeout: DurationSecs,
    pub failure_threshold: u32,
    pub reset_timeout: DurationSecs,
    pub test_mode: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: DurationSecs(60),
            timeout: DurationSecs(30),
            failure_threshold: 5,
            reset_timeout: DurationSecs(30),
            test_mode: false,
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub initial_size: usize,
    pub state_path: Option<String>,
    pub save_interval: DurationSecs,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_size: 100,
            state_path: None,
            save_interval: DurationSecs(30),
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
        }
    }
}

// ── Routes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    pub handler: String,
    pub version: Option<String>,
    pub methods: Vec<String>,
    pub headers: HashMap<String, String>,
    pub middleware: Vec<String>,
    pub health_check: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            handler: String::new(),
            version: None,
            methods: Vec::new(),
            headers: HashMap::new(),
            middleware: Vec::new(),
            health_check: false,
        }
    }
}

// ── Default for root ────────────────────────────────────────────

impl Default for HapaxConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            providers: HashMap::new(),
            provider_preference: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
            routes: Vec::new(),
            test_mode: false,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────

impl HapaxConfig {
    /// Validate the config per spec §6. Returns a joined error message on
    /// the first category of failures found; a valid-but-reloaded config
    /// that fails validation is discarded and logged by the watcher (§4.7),
    /// never allowed to replace the previous snapshot.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.server.read_timeout.0 < 0 || self.server.write_timeout.0 < 0 {
            errors.push("server.read_timeout/write_timeout must not be negative".to_string());
        }
        if self.server.shutdown_timeout.0 < 0 {
            errors.push("server.shutdown_timeout must not be negative".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be in 1..65535".to_string());
        }

        if self.server.http3.enabled {
            if self.server.http3.tls_cert_file.is_none() || self.server.http3.tls_key_file.is_none()
            {
                errors.push(
                    "server.http3.enabled requires both tls_cert_file and tls_key_file"
                        .to_string(),
                );
            }
            if self.server.http3.max_stream_receive_window == 0 {
                errors.push(
                    "server.http3.max_stream_receive_window must be positive".to_string(),
                );
            }
        }

        if self.llm.provider.is_empty() {
            errors.push("llm.provider must not be empty".to_string());
        }
        if self.llm.model.is_empty() {
            errors.push("llm.model must not be empty".to_string());
        }

        for (name, provider) in &self.providers {
            if provider.model.is_empty() {
                errors.push(format!("providers.{name}.model must not be empty"));
            }
        }

        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            errors.push(format!(
                "logging.level '{}' is invalid (expected one of {})",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            errors.push(format!(
                "logging.format '{}' is invalid (expected one of {})",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for route in &self.routes {
            if route.path.is_empty() {
                errors.push("routes[].path must not be empty".to_string());
            }
            if route.handler.is_empty() {
                errors.push("routes[].handler must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}
