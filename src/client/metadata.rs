//! Identity reported alongside records sent to the events API.

use crate::config::Config;

/// Reported in place of machine details when IP reporting is disabled.
const NOT_AVAILABLE: &str = "NA";
const UNKNOWN: &str = "unknown";

/// SDK version and machine details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkMetadata {
    pub sdk_version: String,
    pub machine_name: String,
    pub machine_ip: String,
}

impl SdkMetadata {
    pub fn from_config(config: &Config) -> Self {
        let sdk_version = format!("rust-{}", crate::VERSION);
        if !config.ip_addresses_enabled {
            return Self {
                sdk_version,
                machine_name: NOT_AVAILABLE.to_string(),
                machine_ip: NOT_AVAILABLE.to_string(),
            };
        }

        let machine_name = config.machine_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| UNKNOWN.to_string())
        });
        let machine_ip = config
            .machine_ip
            .clone()
            .or_else(detect_local_ip)
            .unwrap_or_else(|| UNKNOWN.to_string());

        Self {
            sdk_version,
            machine_name,
            machine_ip,
        }
    }
}

/// Address of the interface used for the default route, not the public IP.
fn detect_local_ip() -> Option<String> {
    match local_ip_address::local_ip() {
        Ok(ip) => Some(ip.to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "failed to detect local IP address");
            None
        }
    }
}
