//! Loopback tool configuration management

use anyhow::{Context, Result, anyhow};
use engine::{BackendKind, TransportSettings};
use protocol::{Direction, EndpointAddress, EndpointType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub pipe: PipeSettings,
    #[serde(default)]
    pub scenario: ScenarioSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Endpoints of the OUT/IN pipe pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeSettings {
    #[serde(default = "PipeSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    #[serde(default = "PipeSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    #[serde(default = "PipeSettings::default_max_packet_size")]
    pub max_packet_size: u16,
    /// bulk or interrupt
    #[serde(default = "PipeSettings::default_transfer_type")]
    pub transfer_type: EndpointType,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            out_endpoint: Self::default_out_endpoint(),
            in_endpoint: Self::default_in_endpoint(),
            max_packet_size: Self::default_max_packet_size(),
            transfer_type: Self::default_transfer_type(),
        }
    }
}

impl PipeSettings {
    fn default_out_endpoint() -> u8 {
        0x01
    }

    fn default_in_endpoint() -> u8 {
        0x81
    }

    fn default_max_packet_size() -> u16 {
        512
    }

    fn default_transfer_type() -> EndpointType {
        EndpointType::Bulk
    }
}

/// What the scenario submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSettings {
    /// Number of echo round trips, also the length of the IRP list
    #[serde(default = "ScenarioSettings::default_transfers")]
    pub transfers: usize,
    /// Bytes per transfer
    #[serde(default = "ScenarioSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Children in the composite round (0 skips it)
    #[serde(default = "ScenarioSettings::default_composite_children")]
    pub composite_children: usize,
    /// Completions to observe from the resubmitting reader (0 skips it)
    #[serde(default = "ScenarioSettings::default_resubmit_count")]
    pub resubmit_count: usize,
    /// How long to wait for a read before giving up on it
    #[serde(default = "ScenarioSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            transfers: Self::default_transfers(),
            buffer_size: Self::default_buffer_size(),
            composite_children: Self::default_composite_children(),
            resubmit_count: Self::default_resubmit_count(),
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

impl ScenarioSettings {
    fn default_transfers() -> usize {
        8
    }

    fn default_buffer_size() -> usize {
        64
    }

    fn default_composite_children() -> usize {
        3
    }

    fn default_resubmit_count() -> usize {
        4
    }

    fn default_read_timeout_ms() -> u64 {
        1000
    }
}

impl LoopbackConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the standard locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-irp/loopback.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: LoopbackConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-irp").join("loopback.toml")
        } else {
            PathBuf::from(".config/usb-irp/loopback.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let out = Self::validate_endpoint(self.pipe.out_endpoint, "out_endpoint")?;
        let inp = Self::validate_endpoint(self.pipe.in_endpoint, "in_endpoint")?;
        if out.direction() != Direction::Out {
            return Err(anyhow!(
                "out_endpoint 0x{:02x} is an IN address",
                self.pipe.out_endpoint
            ));
        }
        if inp.direction() != Direction::In {
            return Err(anyhow!(
                "in_endpoint 0x{:02x} is an OUT address",
                self.pipe.in_endpoint
            ));
        }
        if out.number() == 0 {
            return Err(anyhow!("Endpoint 0 is reserved for the control pipe"));
        }
        if self.transport.backend == BackendKind::Loopback && out.number() != inp.number() {
            return Err(anyhow!(
                "Loopback backend echoes per endpoint number, got {} and {}",
                out.number(),
                inp.number()
            ));
        }

        if !matches!(
            self.pipe.transfer_type,
            EndpointType::Bulk | EndpointType::Interrupt
        ) {
            return Err(anyhow!(
                "Invalid transfer type {:?}, must be bulk or interrupt",
                self.pipe.transfer_type
            ));
        }
        if self.pipe.max_packet_size == 0 {
            return Err(anyhow!("max_packet_size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.transport.fault_rate) {
            return Err(anyhow!(
                "Invalid fault rate {}, must be between 0 and 1",
                self.transport.fault_rate
            ));
        }
        for &address in &self.transport.stalled_endpoints {
            Self::validate_endpoint(address, "stalled_endpoints")?;
        }

        if self.scenario.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }

        Ok(())
    }

    fn validate_endpoint(address: u8, name: &str) -> Result<EndpointAddress> {
        EndpointAddress::new(address)
            .map_err(|e| anyhow!("Invalid {} 0x{:02x}: {}", name, address, e))
    }
}
