//! Configuration file support for cvm-syncd
//!
//! Loads and validates the daemon configuration from a YAML file.
//! Default location: /etc/contrail/contrail-vcenter-manager/config.yaml

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use cvm_sync_common::{CvmError, CvmResult, VlanIdPool, VLAN_ID_MAX, VLAN_ID_MIN};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/contrail/contrail-vcenter-manager/config.yaml";

/// Module name reported to the collectors.
pub const MODULE_NAME: &str = "contrail-vcenter-manager";

/// Default instance id.
pub const INSTANCE_ID_DEFAULT: &str = "0";

/// HTTP introspection port of the vCenter manager.
pub const INTROSPECT_PORT: u16 = 9090;

/// Backend endpoint and credentials. Opaque to the sync core; handed to the
/// API clients as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Client-specific keys (datacenter, dvswitch, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// VLAN id range handed to the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlanConfig {
    #[serde(default = "default_vlan_start")]
    pub start: u16,

    #[serde(default = "default_vlan_end")]
    pub end: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Contrail level name (SYS_DEBUG, SYS_INFO, SYS_NOTICE, ...) or a
    /// tracing level name
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Log file; stderr when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Introspection settings as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectSettings {
    #[serde(default = "default_introspect_enabled")]
    pub enabled: bool,

    #[serde(default = "default_http_server_ip")]
    pub http_server_ip: String,

    /// Whitespace-separated "host:port" list
    #[serde(default)]
    pub collectors: String,
}

/// Simulation mode: replay a recorded update stream instead of talking to
/// a real platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// JSON-lines file of recorded update batches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_file: Option<PathBuf>,
}

/// Complete cvm-syncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CvmConfig {
    #[serde(default)]
    pub esxi: EndpointConfig,

    #[serde(default)]
    pub vcenter: EndpointConfig,

    #[serde(default)]
    pub vnc: EndpointConfig,

    #[serde(default)]
    pub vlan: VlanConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub introspect: IntrospectSettings,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

// Default functions
fn default_vlan_start() -> u16 {
    VLAN_ID_MIN
}

fn default_vlan_end() -> u16 {
    VLAN_ID_MAX
}

fn default_logging_level() -> String {
    "SYS_NOTICE".to_string()
}

fn default_introspect_enabled() -> bool {
    true
}

fn default_http_server_ip() -> String {
    "0.0.0.0".to_string()
}

impl Default for VlanConfig {
    fn default() -> Self {
        Self {
            start: default_vlan_start(),
            end: default_vlan_end(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_logging_level(),
            file: None,
        }
    }
}

impl Default for IntrospectSettings {
    fn default() -> Self {
        Self {
            enabled: default_introspect_enabled(),
            http_server_ip: default_http_server_ip(),
            collectors: String::new(),
        }
    }
}

impl VlanConfig {
    /// Builds an empty allocator for this range.
    pub fn build_pool(&self) -> CvmResult<VlanIdPool> {
        VlanIdPool::new(self.start, self.end)
    }
}

impl CvmConfig {
    /// Loads and validates configuration from `path`.
    pub fn load(path: impl AsRef<Path>) -> CvmResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CvmError::invalid_config(path.display().to_string(), format!("cannot read: {e}"))
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(content: &str) -> CvmResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| CvmError::invalid_config("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> CvmResult<()> {
        self.vlan.build_pool()?;
        filter_directive(&self.logging.level)?;
        Ok(())
    }
}

/// Maps SYS_NOTICE to SYS_INFO; other levels pass through.
///
/// Contrail deployments default to SYS_NOTICE, which has no direct
/// counterpart one step above info.
pub fn translate_log_level(level: &str) -> &str {
    if level == "SYS_NOTICE" {
        "SYS_INFO"
    } else {
        level
    }
}

/// Returns the `EnvFilter` directive for a configured level.
pub fn filter_directive(level: &str) -> CvmResult<&'static str> {
    let directive = match translate_log_level(level).to_ascii_uppercase().as_str() {
        "SYS_EMERG" | "SYS_ALERT" | "SYS_CRIT" | "SYS_ERR" | "ERROR" => "error",
        "SYS_WARN" | "WARN" => "warn",
        "SYS_INFO" | "INFO" => "info",
        "SYS_DEBUG" | "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => {
            return Err(CvmError::invalid_config(
                "logging.level",
                format!("unknown level '{level}'"),
            ))
        }
    };
    Ok(directive)
}

/// Introspection identity derived from the loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntrospectConfig {
    pub hostname: String,
    pub module_name: String,
    pub instance_id: String,
    pub introspect_port: u16,
    pub http_server_ip: String,
    /// Shuffled so daemons spread over the collectors
    pub collectors: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub logging_level: String,
}

impl IntrospectConfig {
    pub fn derive<R: Rng + ?Sized>(config: &CvmConfig, hostname: String, rng: &mut R) -> Self {
        let mut collectors: Vec<String> = config
            .introspect
            .collectors
            .split_whitespace()
            .map(str::to_string)
            .collect();
        collectors.shuffle(rng);

        Self {
            hostname,
            module_name: MODULE_NAME.to_string(),
            instance_id: INSTANCE_ID_DEFAULT.to_string(),
            introspect_port: INTROSPECT_PORT,
            http_server_ip: config.introspect.http_server_ip.clone(),
            collectors,
            log_file: config.logging.file.clone(),
            logging_level: translate_log_level(&config.logging.level).to_string(),
        }
    }
}

/// Best-effort local hostname.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
