use std::net::Ipv4Addr;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{config::NetworkConfig, credentials::WifiCredentials, identity::Delay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum IpAssignment {
    Static {
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        subnet: Ipv4Addr,
    },
    Dhcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WifiError {
    #[error("station configuration rejected: {0}")]
    Config(String),
    #[error("wifi driver error {0}")]
    Driver(i32),
}

/// Station-mode radio. `begin` only starts association; callers poll
/// `is_connected`.
pub trait WifiLink {
    fn begin(&mut self, credentials: &WifiCredentials, ip: &IpAssignment) -> Result<(), WifiError>;
    fn is_connected(&mut self) -> bool;
    fn disconnect(&mut self);
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Static-IP ladder followed by DHCP. Every phase is bounded by a poll
/// count, so a full sweep has a fixed worst case.
#[derive(Debug, Clone)]
pub struct ConnectStrategy {
    ladder: Vec<Ipv4Addr>,
    gateway: Ipv4Addr,
    subnet: Ipv4Addr,
    static_polls: u32,
    dhcp_polls: u32,
    poll_interval_ms: u32,
    candidate_gap_ms: u32,
}

const STATIC_DISCONNECT_SETTLE_MS: u32 = 500;

impl ConnectStrategy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        let ladder = if config.static_ladder {
            let [a, b, c, base] = config.static_base;
            (0..config.static_count)
                .map(|step| Ipv4Addr::new(a, b, c, base.saturating_add(step)))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            ladder,
            gateway: config.gateway_addr(),
            subnet: config.subnet_addr(),
            static_polls: config.static_poll_attempts,
            dhcp_polls: config.dhcp_poll_attempts,
            poll_interval_ms: config.poll_interval_ms,
            candidate_gap_ms: config.candidate_gap_ms,
        }
    }

    pub fn candidates(&self) -> Vec<IpAssignment> {
        self.ladder
            .iter()
            .map(|ip| IpAssignment::Static {
                ip: *ip,
                gateway: self.gateway,
                subnet: self.subnet,
            })
            .chain(std::iter::once(IpAssignment::Dhcp))
            .collect()
    }

    /// Runs the full sweep. `on_poll` fires after each wait so the caller
    /// can feed its watchdog.
    pub fn connect<W: WifiLink, D: Delay>(
        &self,
        link: &mut W,
        delay: &mut D,
        credentials: &WifiCredentials,
        mut on_poll: impl FnMut(),
    ) -> Option<IpAssignment> {
        for (index, ip) in self.ladder.iter().enumerate() {
            let assignment = IpAssignment::Static {
                ip: *ip,
                gateway: self.gateway,
                subnet: self.subnet,
            };
            info!(
                "trying static ip {ip} ({}/{})",
                index + 1,
                self.ladder.len()
            );
            if self.attempt(
                link,
                delay,
                credentials,
                &assignment,
                self.static_polls,
                &mut on_poll,
            ) {
                info!("connected to `{}` with static ip {ip}", credentials.ssid());
                return Some(assignment);
            }
            link.disconnect();
            delay.delay_ms(STATIC_DISCONNECT_SETTLE_MS);
            delay.delay_ms(self.candidate_gap_ms);
        }

        if !self.ladder.is_empty() {
            warn!("static ip ladder exhausted, falling back to dhcp");
        }

        if self.attempt(
            link,
            delay,
            credentials,
            &IpAssignment::Dhcp,
            self.dhcp_polls,
            &mut on_poll,
        ) {
            info!(
                "connected to `{}` via dhcp ({})",
                credentials.ssid(),
                link.local_ip()
                    .map_or_else(|| "no address".to_string(), |ip| ip.to_string())
            );
            return Some(IpAssignment::Dhcp);
        }

        link.disconnect();
        warn!("wifi connection to `{}` failed", credentials.ssid());
        None
    }

    /// Single DHCP attempt bounded by `timeout_ms`, used to confirm freshly
    /// provisioned credentials.
    pub fn probe_dhcp<W: WifiLink, D: Delay>(
        &self,
        link: &mut W,
        delay: &mut D,
        credentials: &WifiCredentials,
        timeout_ms: u32,
    ) -> bool {
        let polls = (timeout_ms / self.poll_interval_ms.max(1)).max(1);
        self.attempt(
            link,
            delay,
            credentials,
            &IpAssignment::Dhcp,
            polls,
            &mut || {},
        )
    }

    fn attempt<W: WifiLink, D: Delay>(
        &self,
        link: &mut W,
        delay: &mut D,
        credentials: &WifiCredentials,
        assignment: &IpAssignment,
        polls: u32,
        on_poll: &mut impl FnMut(),
    ) -> bool {
        if let Err(err) = link.begin(credentials, assignment) {
            warn!("wifi begin failed for {assignment:?}: {err}");
            return false;
        }

        for _ in 0..polls {
            if link.is_connected() {
                return true;
            }
            delay.delay_ms(self.poll_interval_ms);
            on_poll();
        }
        link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingDelay, SimWifi};
    use pretty_assertions::assert_eq;

    fn credentials() -> WifiCredentials {
        WifiCredentials::new("LabNet", "12345678").unwrap()
    }

    #[test]
    fn ladder_covers_configured_range_then_dhcp() {
        let strategy = ConnectStrategy::from_config(&NetworkConfig::default());
        let candidates = strategy.candidates();

        assert_eq!(candidates.len(), 11);
        assert_eq!(
            candidates[0],
            IpAssignment::Static {
                ip: Ipv4Addr::new(192, 168, 137, 15),
                gateway: Ipv4Addr::new(192, 168, 137, 1),
                subnet: Ipv4Addr::new(255, 255, 255, 0),
            }
        );
        assert!(matches!(
            candidates[9],
            IpAssignment::Static { ip, .. } if ip == Ipv4Addr::new(192, 168, 137, 24)
        ));
        assert_eq!(candidates[10], IpAssignment::Dhcp);
    }

    #[test]
    fn first_free_static_address_wins() {
        let strategy = ConnectStrategy::from_config(&NetworkConfig::default());
        let mut wifi = SimWifi::default();
        wifi.static_ok = Some(Ipv4Addr::new(192, 168, 137, 17));
        let mut delay = RecordingDelay::default();

        let outcome = strategy.connect(&mut wifi, &mut delay, &credentials(), || {});

        assert!(matches!(
            outcome,
            Some(IpAssignment::Static { ip, .. }) if ip == Ipv4Addr::new(192, 168, 137, 17)
        ));
        assert_eq!(wifi.begins.len(), 3);
    }

    #[test]
    fn falls_back_to_dhcp_after_ladder() {
        let strategy = ConnectStrategy::from_config(&NetworkConfig::default());
        let mut wifi = SimWifi::default();
        wifi.dhcp_ok = true;
        let mut delay = RecordingDelay::default();
        let mut polls = 0;

        let outcome = strategy.connect(&mut wifi, &mut delay, &credentials(), || polls += 1);

        assert_eq!(outcome, Some(IpAssignment::Dhcp));
        assert_eq!(wifi.begins.len(), 11);
        assert_eq!(polls, 10 * 20 + wifi.polls_to_connect);
    }

    #[test]
    fn dhcp_only_sweep_is_bounded() {
        let mut config = NetworkConfig::default();
        config.static_ladder = false;
        let strategy = ConnectStrategy::from_config(&config);
        let mut wifi = SimWifi::default();
        let mut delay = RecordingDelay::default();

        let outcome = strategy.connect(&mut wifi, &mut delay, &credentials(), || {});

        assert_eq!(outcome, None);
        assert_eq!(wifi.begins, vec![IpAssignment::Dhcp]);
        assert_eq!(delay.calls, vec![500; 30]);
    }

    #[test]
    fn provisioning_probe_respects_timeout() {
        let strategy = ConnectStrategy::from_config(&NetworkConfig::default());
        let mut wifi = SimWifi::default();
        let mut delay = RecordingDelay::default();

        assert!(!strategy.probe_dhcp(&mut wifi, &mut delay, &credentials(), 15_000));
        assert_eq!(delay.total_ms(), 15_000);
    }
}
