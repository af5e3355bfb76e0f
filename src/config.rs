//! Gateway configuration types: §6.
//!
//! YAML loading and the REST/CLI surfaces that populate these structs live
//! outside the core (§1 Out of scope); this module only defines the shape
//! and a couple of constructors for building one programmatically or from
//! a small JSON file, mirroring the teacher's `AppState` default-config
//! fallback.

use serde::{Deserialize, Serialize};

fn default_max_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u32 {
    360
}

/// One instrument's connection and routing configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub name: String,
    pub port: u16,
    pub driver_identifier: String,
    pub enabled: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u32,
    /// `0` disables keep-alive; valid range [0, 1440] (§4.9). Immutable
    /// after startup per the Open Question resolution in spec.md §9.
    pub keep_alive_interval_minutes: u32,
    pub order_queue: String,
    pub result_queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl InstrumentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.keep_alive_interval_minutes > 1440 {
            return Err(format!(
                "instrument {}: keep_alive_interval_minutes must be in [0, 1440]",
                self.name
            ));
        }
        let read_timeout = crate::protocol::constants::SOCKET_READ_TIMEOUT_SECS;
        if self.keep_alive_interval_minutes > 0
            && (self.keep_alive_interval_minutes as u64) * 60 >= read_timeout
        {
            return Err(format!(
                "instrument {}: keep_alive_interval_minutes must be strictly less than the {}s socket read timeout",
                self.name, read_timeout
            ));
        }
        Ok(())
    }
}

/// Top-level gateway configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    pub messaging_enabled: bool,
    pub instruments: Vec<InstrumentConfig>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub broker_url: Option<String>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), String> {
        for instrument in &self.instruments {
            instrument.validate()?;
        }
        let mut ports = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if instrument.enabled && !ports.insert(instrument.port) {
                return Err(format!("duplicate port {} across instruments", instrument.port));
            }
        }
        Ok(())
    }

    /// A single-instrument default used when no config file is supplied,
    /// mirroring the teacher's `create_default_meril_analyzer()` fallback.
    pub fn default_single_instrument(name: &str, port: u16) -> Self {
        Self {
            messaging_enabled: true,
            instruments: vec![InstrumentConfig {
                name: name.to_string(),
                port,
                driver_identifier: "generic".to_string(),
                enabled: true,
                max_connections: 1,
                connection_timeout_seconds: 360,
                keep_alive_interval_minutes: 1,
                order_queue: format!("{name}.orders"),
                result_queue: format!("{name}.results"),
                exchange: "lis.astm".to_string(),
                routing_key: format!("astm.{name}"),
            }],
            database_url: None,
            broker_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_keep_alive_not_below_read_timeout() {
        let mut cfg = GatewayConfig::default_single_instrument("X", 5600);
        cfg.instruments[0].keep_alive_interval_minutes = 6; // 360s, not < 360s
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ports() {
        let mut cfg = GatewayConfig::default_single_instrument("X", 5600);
        let mut second = cfg.instruments[0].clone();
        second.name = "Y".to_string();
        cfg.instruments.push(second);
        assert!(cfg.validate().is_err());
    }
}
