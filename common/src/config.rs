use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub i2c_address: u8,
    pub sda_pin: i32,
    pub scl_pin: i32,
    pub write_protect_pin: i32,
    pub retries: u8,
    pub retry_delay_ms: u32,
    pub write_cycle_ms: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            i2c_address: 0x50,
            sda_pin: 18,
            scl_pin: 19,
            write_protect_pin: 25,
            retries: 3,
            retry_delay_ms: 1_000,
            write_cycle_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub static_ladder: bool,
    pub static_base: [u8; 4],
    pub static_count: u8,
    pub gateway: [u8; 4],
    pub subnet: [u8; 4],
    pub static_poll_attempts: u32,
    pub dhcp_poll_attempts: u32,
    pub poll_interval_ms: u32,
    pub candidate_gap_ms: u32,
    pub provisioning_connect_timeout_ms: u32,
    pub discovery_port: u16,
    /// Fixed reply port. `None` answers on the sender's source port + 1.
    pub response_port: Option<u16>,
    pub firmware_version: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            static_ladder: true,
            static_base: [192, 168, 137, 15],
            static_count: 10,
            gateway: [192, 168, 137, 1],
            subnet: [255, 255, 255, 0],
            static_poll_attempts: 20,
            dhcp_poll_attempts: 30,
            poll_interval_ms: 500,
            candidate_gap_ms: 1_000,
            provisioning_connect_timeout_ms: 15_000,
            discovery_port: 8888,
            response_port: None,
            firmware_version: "OTA_BOOTLOADER".to_string(),
            http_port: 80,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.static_count = self.static_count.min(50);
        let last = u16::from(self.static_base[3]) + u16::from(self.static_count);
        if last > 255 {
            self.static_count = 255_u8.saturating_sub(self.static_base[3]);
        }
        self.static_poll_attempts = self.static_poll_attempts.clamp(1, 120);
        self.dhcp_poll_attempts = self.dhcp_poll_attempts.clamp(1, 120);
        self.poll_interval_ms = self.poll_interval_ms.clamp(50, 5_000);
        self.provisioning_connect_timeout_ms =
            self.provisioning_connect_timeout_ms.clamp(1_000, 60_000);
        if self.discovery_port == 0 {
            self.discovery_port = 8888;
        }
        if self.firmware_version.trim().is_empty() {
            self.firmware_version = "OTA_BOOTLOADER".to_string();
        }
    }

    pub fn gateway_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.gateway)
    }

    pub fn subnet_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.subnet)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub idle_timeout_ms: u64,
    pub restart_delay_ms: u32,
    pub reset_button_pin: i32,
    pub reset_hold_ms: u64,
    pub reset_sample_ms: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            rate_limit_max: 5,
            rate_limit_window_ms: 60_000,
            idle_timeout_ms: 30_000,
            restart_delay_ms: 500,
            reset_button_pin: 34,
            reset_hold_ms: 3_000,
            reset_sample_ms: 10,
        }
    }
}

impl ProvisioningConfig {
    pub fn sanitize(&mut self) {
        self.rate_limit_max = self.rate_limit_max.max(1);
        self.rate_limit_window_ms = self.rate_limit_window_ms.max(1_000);
        self.idle_timeout_ms = self.idle_timeout_ms.max(1_000);
        self.reset_sample_ms = self.reset_sample_ms.clamp(1, 100);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FailsafeConfig {
    pub recheck_interval_ms: u64,
    pub boot_wait_attempts: u8,
    pub boot_wait_interval_ms: u32,
    pub safe_shutdown_timeout_ms: u64,
    /// Output parked low before a fallback. Negative when the firmware
    /// drives nothing.
    pub actuator_enable_pin: i32,
    pub restart_trigger_pin: i32,
    pub restart_delay_ms: u32,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 2_000,
            boot_wait_attempts: 3,
            boot_wait_interval_ms: 5_000,
            safe_shutdown_timeout_ms: 30_000,
            actuator_enable_pin: -1,
            restart_trigger_pin: 32,
            restart_delay_ms: 1_000,
        }
    }
}

impl FailsafeConfig {
    pub fn actuator_pin(&self) -> Option<i32> {
        (self.actuator_enable_pin >= 0).then_some(self.actuator_enable_pin)
    }

    pub fn sanitize(&mut self) {
        self.recheck_interval_ms = self.recheck_interval_ms.clamp(2_000, 10_000);
        self.safe_shutdown_timeout_ms = self.safe_shutdown_timeout_ms.clamp(1_000, 120_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OtaConfig {
    pub max_push_body: usize,
    pub restart_delay_ms: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            max_push_body: 16 * 1024,
            restart_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExperimentConfig {
    pub resolution_bits: u8,
    pub duration_s: u32,
    pub default_count: u32,
    pub sample_gap_ms: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            resolution_bits: 10,
            duration_s: 0,
            default_count: 20,
            sample_gap_ms: 100,
        }
    }
}

impl ExperimentConfig {
    pub fn sanitize(&mut self) {
        self.resolution_bits = self.resolution_bits.clamp(9, 12);
        if self.default_count == 0 {
            self.default_count = 20;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub provisioning: ProvisioningConfig,
    pub failsafe: FailsafeConfig,
    pub ota: OtaConfig,
    pub experiment: ExperimentConfig,
    /// Shared secret for the identity repair command. Empty disables it.
    pub repair_token: String,
}

impl DeviceConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.identity.retries = self.identity.retries.clamp(1, 10);
        self.network.sanitize();
        self.provisioning.sanitize();
        self.failsafe.sanitize();
        self.experiment.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            DeviceConfig::from_json(br#"{"network":{"discovery_port":9999}}"#).unwrap();

        assert_eq!(config.network.discovery_port, 9999);
        assert_eq!(config.network.dhcp_poll_attempts, 30);
        assert_eq!(config.identity, IdentityConfig::default());
        assert_eq!(config.failsafe.actuator_pin(), None);
    }

    #[test]
    fn actuator_pin_is_opt_in() {
        let config =
            DeviceConfig::from_json(br#"{"failsafe":{"actuator_enable_pin":25}}"#).unwrap();

        assert_eq!(config.failsafe.actuator_pin(), Some(25));
        assert_eq!(config.failsafe.safe_shutdown_timeout_ms, 30_000);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = DeviceConfig::default();
        config.failsafe.recheck_interval_ms = 50;
        config.experiment.resolution_bits = 16;
        config.network.static_base = [10, 0, 0, 250];
        config.network.static_count = 20;

        config.sanitize();

        assert_eq!(config.failsafe.recheck_interval_ms, 2_000);
        assert_eq!(config.experiment.resolution_bits, 12);
        assert_eq!(config.network.static_count, 5);
    }
}
