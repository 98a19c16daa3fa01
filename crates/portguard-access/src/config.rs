//! Gateway configuration.
//!
//! One immutable [`Config`] tree is loaded at startup (JSON file plus
//! daemon flag overrides) and handed to constructors. No component reads
//! configuration from anywhere else afterwards.

use portguard_enforcer::NetworkProfile;
use portguard_types::{Ipv4Address, MacAddress};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Which enforcement backend the process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcerMode {
    /// Record intent in memory; never touch the host.
    Simulation,
    /// Drive iptables/ebtables on the host.
    Active,
}

/// Which persistence backend the process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Client-facing interface name.
    pub client: String,
    /// Upstream interface name.
    pub uplink: String,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            client: "wlan0".to_string(),
            uplink: "eth0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub portal_ip: Ipv4Address,
    pub portal_port: u16,
    /// Client subnet in CIDR form; informational, passed through to the
    /// facade.
    pub subnet: Option<String>,
    pub gateway_ip: Ipv4Address,
    /// Gateway MAC; when absent the daemon discovers it from the client
    /// interface.
    pub gateway_mac: Option<MacAddress>,
    /// Whether TCP/443 is included in the portal redirect.
    pub redirect_https: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            portal_ip: Ipv4Address::new(192, 168, 4, 1),
            portal_port: 8080,
            subnet: Some("192.168.4.0/24".to_string()),
            gateway_ip: Ipv4Address::new(192, 168, 4, 1),
            gateway_mac: None,
            redirect_https: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerSettings {
    pub mode: EnforcerMode,
    /// Per-operation deadline in seconds.
    pub deadline_secs: u64,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self {
            mode: EnforcerMode::Simulation,
            deadline_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Duration granted when the caller does not specify one.
    pub default_duration_secs: u64,
    /// Ceiling on total session duration, extensions included.
    pub max_duration_secs: u64,
    /// Ceiling on concurrent devices per credential, enforced by the
    /// facade; carried here so one config file describes the deployment.
    pub max_devices: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_duration_secs: 3600,
            max_duration_secs: 86_400,
            max_devices: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationSettings {
    /// Seconds between cycles.
    pub cadence_secs: u64,
    /// Sessions get this long past expiry before the sweep revokes them.
    pub grace_secs: u64,
    /// Retry attempts per failed ledger row before it is promoted to
    /// dead.
    pub retry_budget: u32,
    /// Age after which a pending ledger row is treated as a crash
    /// leftover.
    pub pending_grace_secs: u64,
    /// Whether the drift check against the backend snapshot runs.
    pub drift_check: bool,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            cadence_secs: 60,
            grace_secs: 5,
            retry_budget: 3,
            pending_grace_secs: 15,
            drift_check: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Sink buffer capacity in records.
    pub buffer: usize,
    /// Days of audit history the facade retains; informational here.
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            buffer: 1024,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub mode: StoreMode,
    pub redis_host: String,
    pub redis_port: u16,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            mode: StoreMode::Memory,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Auth attempts allowed per window; enforced by the facade, which
    /// turns violations into device blocks the access plane honors.
    pub max_attempts: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_secs: 300,
        }
    }
}

/// Binding registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingSettings {
    /// Rebinds per MAC per hour above which RAPID_REBIND is reported.
    pub rapid_rebind_threshold: u32,
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            rapid_rebind_threshold: 6,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interfaces: InterfaceSettings,
    pub network: NetworkSettings,
    pub enforcer: EnforcerSettings,
    pub session: SessionSettings,
    pub binding: BindingSettings,
    pub reconciliation: ReconciliationSettings,
    pub audit: AuditSettings,
    pub store: StoreSettings,
    pub rate_limit: RateLimitSettings,
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.portal_port == 0 {
            return Err(ConfigError::Invalid("portal_port must be non-zero".into()));
        }
        if self.session.default_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_duration_secs must be non-zero".into(),
            ));
        }
        if self.session.default_duration_secs > self.session.max_duration_secs {
            return Err(ConfigError::Invalid(
                "default_duration_secs exceeds max_duration_secs".into(),
            ));
        }
        if self.reconciliation.cadence_secs == 0 {
            return Err(ConfigError::Invalid("cadence_secs must be non-zero".into()));
        }
        if self.interfaces.client == self.interfaces.uplink {
            return Err(ConfigError::Invalid(
                "client and uplink interfaces must differ".into(),
            ));
        }
        Ok(())
    }

    /// Builds the network profile handed to the rule synthesizers.
    /// `gateway_mac` is the resolved address when the config left it
    /// blank for discovery.
    pub fn network_profile(&self, gateway_mac: MacAddress) -> NetworkProfile {
        NetworkProfile {
            client_interface: self.interfaces.client.clone(),
            uplink_interface: self.interfaces.uplink.clone(),
            portal_ip: self.network.portal_ip,
            portal_port: self.network.portal_port,
            gateway_ip: self.network.gateway_ip,
            gateway_mac: self.network.gateway_mac.unwrap_or(gateway_mac),
            redirect_https: self.network.redirect_https,
        }
    }

    /// Per-operation enforcement deadline.
    pub fn enforcer_deadline(&self) -> Duration {
        Duration::from_secs(self.enforcer.deadline_secs)
    }
}
