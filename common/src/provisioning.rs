use core::fmt;
use std::collections::VecDeque;

use log::{info, warn};

use crate::config::ProvisioningConfig;
use crate::credentials::{
    CredentialError, KeyValueStore, MacAddress, WifiCredentialStore, WifiCredentials,
    MAC_TEXT_LEN, PASS_MAX_LEN, SSID_MAX_LEN,
};

pub const DEVICE_NAME_PREFIX: &str = "LabExpertOTA";
pub const SERVICE_UUID: &str = "0000FFF0-0000-1000-8000-00805F9B34FB";
pub const SERVICE_UUID16: u16 = 0xFFF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Ssid,
    Password,
    Status,
    Commit,
    HostMac,
}

impl Characteristic {
    pub const ALL: [Self; 5] = [
        Self::Ssid,
        Self::Password,
        Self::Status,
        Self::Commit,
        Self::HostMac,
    ];

    pub fn uuid16(self) -> u16 {
        match self {
            Self::Ssid => 0xFFF1,
            Self::Password => 0xFFF2,
            Self::Status => 0xFFF3,
            Self::Commit => 0xFFF4,
            Self::HostMac => 0xFFF5,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid16() == uuid)
    }

    /// Longest value kept from a write; extra bytes are dropped.
    pub fn max_len(self) -> usize {
        match self {
            Self::Ssid => SSID_MAX_LEN,
            Self::Password => PASS_MAX_LEN,
            Self::HostMac => MAC_TEXT_LEN,
            Self::Status | Self::Commit => 0,
        }
    }
}

/// Notifications sent on the status characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Stored { ssid: String, masked_password: String },
    WifiOk,
    WifiFail,
    InvalidSsid,
    InvalidPass,
    RateLimited,
    Timeout,
    NvsErr,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored {
                ssid,
                masked_password,
            } => write!(f, "STORED SSID:{ssid} PASS:{masked_password}"),
            Self::WifiOk => f.write_str("WIFI_OK"),
            Self::WifiFail => f.write_str("WIFI_FAIL"),
            Self::InvalidSsid => f.write_str("INVALID_SSID"),
            Self::InvalidPass => f.write_str("INVALID_PASS"),
            Self::RateLimited => f.write_str("RATE_LIMITED"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::NvsErr => f.write_str("NVS_ERR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningAction {
    Notify(StatusMessage),
    /// Try the stored network once, then report via `finish_commit`.
    TestConnection(WifiCredentials),
    Restart { after_ms: u32 },
}

/// Rolling-window limiter: at most `max` attempts in any `window_ms`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max: usize,
    window_ms: u64,
    attempts: VecDeque<u64>,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: u64) -> Self {
        Self {
            max: max.max(1) as usize,
            window_ms,
            attempts: VecDeque::new(),
        }
    }

    /// Records an attempt at `now_ms` unless the window is already full.
    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        while self
            .attempts
            .front()
            .is_some_and(|at| now_ms.saturating_sub(*at) >= self.window_ms)
        {
            self.attempts.pop_front();
        }
        if self.attempts.len() >= self.max {
            return false;
        }
        self.attempts.push_back(now_ms);
        true
    }
}

/// Bluetooth credential intake. Characteristic writes only fill buffers;
/// every decision happens on commit, on the thread that owns the session.
pub struct ProvisioningSession<S> {
    store: WifiCredentialStore<S>,
    ssid: Vec<u8>,
    password: Vec<u8>,
    host_mac: Vec<u8>,
    limiter: RateLimiter,
    idle_timeout_ms: u64,
    restart_delay_ms: u32,
    deadline_ms: u64,
    stored: bool,
}

impl<S: KeyValueStore> ProvisioningSession<S> {
    pub fn new(store: WifiCredentialStore<S>, config: &ProvisioningConfig, now_ms: u64) -> Self {
        Self {
            store,
            ssid: Vec::new(),
            password: Vec::new(),
            host_mac: Vec::new(),
            limiter: RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms),
            idle_timeout_ms: config.idle_timeout_ms,
            restart_delay_ms: config.restart_delay_ms,
            deadline_ms: now_ms + config.idle_timeout_ms,
            stored: false,
        }
    }

    /// Handles a characteristic write. Only a commit produces actions.
    pub fn on_write(
        &mut self,
        characteristic: Characteristic,
        value: &[u8],
        now_ms: u64,
    ) -> Vec<ProvisioningAction> {
        let keep = &value[..value.len().min(characteristic.max_len())];
        match characteristic {
            Characteristic::Ssid => self.ssid = keep.to_vec(),
            Characteristic::Password => self.password = keep.to_vec(),
            Characteristic::HostMac => {
                self.host_mac = keep.to_vec();
                info!("host mac received: {}", String::from_utf8_lossy(keep));
            }
            Characteristic::Commit => return self.commit(now_ms),
            Characteristic::Status => {}
        }
        Vec::new()
    }

    pub fn commit(&mut self, now_ms: u64) -> Vec<ProvisioningAction> {
        if self.stored {
            return Vec::new();
        }
        self.deadline_ms = now_ms + self.idle_timeout_ms;
        if !self.limiter.try_acquire(now_ms) {
            warn!("provisioning commit rate limited");
            return vec![ProvisioningAction::Notify(StatusMessage::RateLimited)];
        }

        let ssid = std::str::from_utf8(&self.ssid).unwrap_or_default();
        let password = std::str::from_utf8(&self.password).unwrap_or_default();
        let credentials = match WifiCredentials::new(ssid, password) {
            Ok(credentials) => credentials,
            Err(CredentialError::InvalidPassword) => {
                return vec![ProvisioningAction::Notify(StatusMessage::InvalidPass)]
            }
            Err(_) => return vec![ProvisioningAction::Notify(StatusMessage::InvalidSsid)],
        };

        let host_mac = self.parsed_host_mac();
        if let Err(err) = self.store.save(&credentials, host_mac.as_ref()) {
            warn!("failed to persist provisioned credentials: {err}");
            return vec![ProvisioningAction::Notify(StatusMessage::NvsErr)];
        }

        self.stored = true;
        vec![
            ProvisioningAction::Notify(StatusMessage::Stored {
                ssid: credentials.ssid().to_string(),
                masked_password: credentials.masked_password(),
            }),
            ProvisioningAction::TestConnection(credentials),
        ]
    }

    fn parsed_host_mac(&self) -> Option<MacAddress> {
        if self.host_mac.is_empty() {
            return None;
        }
        let raw = String::from_utf8_lossy(&self.host_mac);
        match raw.parse() {
            Ok(mac) => Some(mac),
            Err(err) => {
                warn!("ignoring host mac: {err}");
                None
            }
        }
    }

    /// Reports the connection test and schedules the restart, which happens
    /// whatever the outcome.
    pub fn finish_commit(&mut self, connected: bool) -> Vec<ProvisioningAction> {
        let status = if connected {
            StatusMessage::WifiOk
        } else {
            StatusMessage::WifiFail
        };
        info!("provisioning finished ({status}), restarting");
        vec![
            ProvisioningAction::Notify(status),
            ProvisioningAction::Restart {
                after_ms: self.restart_delay_ms,
            },
        ]
    }

    /// Emits `TIMEOUT` once per idle window until credentials are stored.
    pub fn tick(&mut self, now_ms: u64) -> Option<StatusMessage> {
        if self.stored || now_ms < self.deadline_ms {
            return None;
        }
        self.deadline_ms = now_ms + self.idle_timeout_ms;
        Some(StatusMessage::Timeout)
    }
}

/// Debounced long-press detector for the factory-reset button.
#[derive(Debug, Clone)]
pub struct ResetButton {
    hold_ms: u64,
    pressed_since: Option<u64>,
    fired: bool,
}

impl ResetButton {
    pub fn new(config: &ProvisioningConfig) -> Self {
        Self {
            hold_ms: config.reset_hold_ms,
            pressed_since: None,
            fired: false,
        }
    }

    /// Feeds one sample; returns `true` once per continuous hold.
    pub fn sample(&mut self, pressed: bool, now_ms: u64) -> bool {
        if !pressed {
            self.pressed_since = None;
            self.fired = false;
            return false;
        }
        let since = *self.pressed_since.get_or_insert(now_ms);
        if !self.fired && now_ms.saturating_sub(since) >= self.hold_ms {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Clears stored credentials after a long press. The caller restarts.
pub fn factory_reset<S: KeyValueStore>(store: &WifiCredentialStore<S>) -> Result<(), CredentialError> {
    warn!("factory reset requested");
    store.clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{StoreError, WIFI_NAMESPACE};
    use crate::sim::MemoryStore;
    use pretty_assertions::assert_eq;

    fn session(store: MemoryStore) -> ProvisioningSession<MemoryStore> {
        ProvisioningSession::new(
            WifiCredentialStore::new(store),
            &ProvisioningConfig::default(),
            0,
        )
    }

    #[test]
    fn labnet_scenario_stores_tests_and_restarts() {
        let store = MemoryStore::default();
        let mut session = session(store.clone());

        session.on_write(Characteristic::Ssid, b"LabNet", 10);
        session.on_write(Characteristic::Password, b"12345678", 20);
        let actions = session.on_write(Characteristic::Commit, b"1", 30);

        let credentials = WifiCredentials::new("LabNet", "12345678").unwrap();
        assert_eq!(
            actions,
            vec![
                ProvisioningAction::Notify(StatusMessage::Stored {
                    ssid: "LabNet".to_string(),
                    masked_password: "********".to_string(),
                }),
                ProvisioningAction::TestConnection(credentials.clone()),
            ]
        );
        assert_eq!(
            WifiCredentialStore::new(store).load(),
            Some(credentials)
        );

        let finish = session.finish_commit(false);
        assert_eq!(
            finish,
            vec![
                ProvisioningAction::Notify(StatusMessage::WifiFail),
                ProvisioningAction::Restart { after_ms: 500 },
            ]
        );
    }

    #[test]
    fn status_strings_match_protocol() {
        let stored = StatusMessage::Stored {
            ssid: "LabNet".to_string(),
            masked_password: "********".to_string(),
        };
        assert_eq!(stored.to_string(), "STORED SSID:LabNet PASS:********");
        assert_eq!(StatusMessage::RateLimited.to_string(), "RATE_LIMITED");
        assert_eq!(StatusMessage::NvsErr.to_string(), "NVS_ERR");
    }

    #[test]
    fn invalid_input_keeps_session_open() {
        let store = MemoryStore::default();
        let mut session = session(store.clone());

        session.on_write(Characteristic::Ssid, b"Lab Net", 0);
        session.on_write(Characteristic::Password, b"12345678", 0);
        assert_eq!(
            session.commit(1),
            vec![ProvisioningAction::Notify(StatusMessage::InvalidSsid)]
        );

        session.on_write(Characteristic::Ssid, b"LabNet", 0);
        session.on_write(Characteristic::Password, b"short", 0);
        assert_eq!(
            session.commit(2),
            vec![ProvisioningAction::Notify(StatusMessage::InvalidPass)]
        );
        assert!(store.is_empty());

        session.on_write(Characteristic::Password, b"longenough", 0);
        assert_eq!(session.commit(3).len(), 2);
    }

    #[test]
    fn sixth_commit_in_window_is_rate_limited() {
        let mut session = session(MemoryStore::default());

        for at in 0..5 {
            assert_eq!(
                session.commit(at * 1_000),
                vec![ProvisioningAction::Notify(StatusMessage::InvalidSsid)]
            );
        }
        assert_eq!(
            session.commit(10_000),
            vec![ProvisioningAction::Notify(StatusMessage::RateLimited)]
        );
        assert_eq!(
            session.commit(60_000),
            vec![ProvisioningAction::Notify(StatusMessage::InvalidSsid)]
        );
    }

    #[test]
    fn oversized_writes_are_truncated() {
        let store = MemoryStore::default();
        let mut session = session(store.clone());
        let long_ssid = "S".repeat(40);

        session.on_write(Characteristic::Ssid, long_ssid.as_bytes(), 0);
        session.on_write(Characteristic::Password, b"12345678", 0);
        session.on_write(Characteristic::HostMac, b"aa:bb:cc:dd:ee:ff:00:11", 0);
        session.commit(0);

        let stored = WifiCredentialStore::new(store.clone());
        assert_eq!(stored.load().unwrap().ssid(), "S".repeat(32));
        assert_eq!(
            stored.host_mac(),
            Some("AA:BB:CC:DD:EE:FF".parse().unwrap())
        );
        assert_eq!(
            store.get_str(WIFI_NAMESPACE, "hostmac").unwrap().as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }

    #[derive(Clone, Default)]
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get_str(&self, _: &str, _: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        fn set_str(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("flash full".to_string()))
        }
        fn get_u16(&self, _: &str, _: &str) -> Result<Option<u16>, StoreError> {
            Ok(None)
        }
        fn set_u16(&self, _: &str, _: &str, _: u16) -> Result<(), StoreError> {
            Err(StoreError::Backend("flash full".to_string()))
        }
        fn remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn storage_failure_reports_nvs_err() {
        let mut session = ProvisioningSession::new(
            WifiCredentialStore::new(BrokenStore),
            &ProvisioningConfig::default(),
            0,
        );
        session.on_write(Characteristic::Ssid, b"LabNet", 0);
        session.on_write(Characteristic::Password, b"12345678", 0);

        assert_eq!(
            session.commit(0),
            vec![ProvisioningAction::Notify(StatusMessage::NvsErr)]
        );
    }

    #[test]
    fn idle_timeout_repeats_without_closing() {
        let mut session = session(MemoryStore::default());

        assert_eq!(session.tick(29_999), None);
        assert_eq!(session.tick(30_000), Some(StatusMessage::Timeout));
        assert_eq!(session.tick(45_000), None);
        assert_eq!(session.tick(60_000), Some(StatusMessage::Timeout));
    }

    #[test]
    fn reset_button_needs_a_continuous_hold() {
        let mut button = ResetButton::new(&ProvisioningConfig::default());

        assert!(!button.sample(true, 0));
        assert!(!button.sample(true, 2_990));
        assert!(!button.sample(false, 3_000));
        assert!(!button.sample(true, 3_010));
        assert!(!button.sample(true, 6_000));
        assert!(button.sample(true, 6_010));
        assert!(!button.sample(true, 9_100));
    }

    #[test]
    fn uuids_round_trip() {
        for characteristic in Characteristic::ALL {
            assert_eq!(
                Characteristic::from_uuid16(characteristic.uuid16()),
                Some(characteristic)
            );
        }
        assert_eq!(Characteristic::from_uuid16(0xFFF6), None);
    }
}
