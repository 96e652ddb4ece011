use core::fmt;
use core::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const WIFI_NAMESPACE: &str = "wifi";
pub const KEY_SSID: &str = "ssid";
pub const KEY_PASS: &str = "pass";
pub const KEY_HOST_MAC: &str = "hostmac";

pub const SSID_MAX_LEN: usize = 32;
pub const PASS_MIN_LEN: usize = 8;
pub const PASS_MAX_LEN: usize = 64;
pub const MAC_TEXT_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored value for {namespace}.{key} is corrupt")]
    Corrupt {
        namespace: &'static str,
        key: &'static str,
    },
}

/// Namespaced non-volatile key/value storage (NVS on hardware). Handles are
/// cheap clones sharing one backend.
pub trait KeyValueStore {
    fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_u16(&self, namespace: &str, key: &str) -> Result<Option<u16>, StoreError>;
    fn set_u16(&self, namespace: &str, key: &str, value: u16) -> Result<(), StoreError>;
    fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("ssid must be 1-{SSID_MAX_LEN} characters of [0-9A-Za-z._-]")]
    InvalidSsid,
    #[error("password must be {PASS_MIN_LEN}-{PASS_MAX_LEN} printable characters")]
    InvalidPassword,
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn is_valid_ssid(ssid: &str) -> bool {
    (1..=SSID_MAX_LEN).contains(&ssid.len())
        && ssid
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'-'))
}

pub fn is_valid_password(password: &str) -> bool {
    (PASS_MIN_LEN..=PASS_MAX_LEN).contains(&password.len())
        && password
            .bytes()
            .all(|c| (0x20..=0x7E).contains(&c) && c != b'"' && c != b'`')
}

/// A validated SSID/password pair. Construction is the only validation
/// point, so an invalid pair can never reach the store.
#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    ssid: String,
    password: String,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, CredentialError> {
        if !is_valid_ssid(ssid) {
            return Err(CredentialError::InvalidSsid);
        }
        if !is_valid_password(password) {
            return Err(CredentialError::InvalidPassword);
        }
        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn masked_password(&self) -> String {
        "*".repeat(self.password.len())
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &self.masked_password())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Last five hex digits of the address, the short id the backend
    /// knows devices by.
    pub fn device_id(&self) -> String {
        let compact = hex::encode_upper(self.0);
        compact[compact.len() - 5..].to_string()
    }

    pub fn ble_device_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", hex::encode_upper(&self.0[1..]))
    }
}

impl FromStr for MacAddress {
    type Err = CredentialError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let compact: String = value
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        let mut bytes = [0_u8; 6];
        hex::decode_to_slice(&compact, &mut bytes)
            .map_err(|_| CredentialError::InvalidMac(value.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Owner of the `wifi` namespace.
#[derive(Clone)]
pub struct WifiCredentialStore<S> {
    store: S,
}

impl<S: KeyValueStore> WifiCredentialStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Missing, partial or invalid entries all read as "no credentials".
    pub fn load(&self) -> Option<WifiCredentials> {
        let ssid = self.read(KEY_SSID)?;
        let password = self.read(KEY_PASS)?;
        match WifiCredentials::new(&ssid, &password) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!("stored wifi credentials rejected: {err}");
                None
            }
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get_str(WIFI_NAMESPACE, key) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to read {WIFI_NAMESPACE}.{key}: {err}");
                None
            }
        }
    }

    pub fn save(
        &self,
        credentials: &WifiCredentials,
        host_mac: Option<&MacAddress>,
    ) -> Result<(), CredentialError> {
        self.store
            .set_str(WIFI_NAMESPACE, KEY_SSID, credentials.ssid())?;
        self.store
            .set_str(WIFI_NAMESPACE, KEY_PASS, credentials.password())?;
        if let Some(mac) = host_mac {
            self.store
                .set_str(WIFI_NAMESPACE, KEY_HOST_MAC, &mac.to_string())?;
        }
        info!(
            "wifi credentials stored for `{}` (host mac {})",
            credentials.ssid(),
            host_mac.map_or_else(|| "unchanged".to_string(), ToString::to_string)
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        for key in [KEY_SSID, KEY_PASS, KEY_HOST_MAC] {
            self.store.remove(WIFI_NAMESPACE, key)?;
        }
        info!("wifi credentials cleared");
        Ok(())
    }

    pub fn host_mac(&self) -> Option<MacAddress> {
        let raw = self.read(KEY_HOST_MAC)?;
        match raw.parse() {
            Ok(mac) => Some(mac),
            Err(err) => {
                warn!("ignoring stored host mac: {err}");
                None
            }
        }
    }
}
