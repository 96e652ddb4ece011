use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{KeyValueStore, MacAddress, StoreError, WifiCredentialStore};

pub const DISCOVERY_MAGIC: &str = "LABEXPERT_DISCOVERY";
pub const RESPONSE_MAGIC: &str = "LABEXPERT_RESPONSE";
pub const MAX_PACKET_LEN: usize = 512;

pub const MQTT_NAMESPACE: &str = "mqtt";
pub const KEY_BROKER: &str = "broker";
pub const KEY_PORT: &str = "port";
pub const KEY_BACKEND_MAC: &str = "backend_mac";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("packet is not a discovery request")]
    NotDiscovery,
    #[error("malformed discovery envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    magic: String,
    #[serde(default)]
    backend_mac: Option<String>,
    #[serde(default)]
    mqtt_broker: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAnnouncement {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryRequest {
    /// Raw announced MAC, kept as text so a malformed value can still be
    /// logged and rejected.
    pub backend_mac: Option<String>,
    pub broker: Option<BrokerAnnouncement>,
}

impl DiscoveryRequest {
    /// Accepts the bare magic string or the JSON envelope.
    pub fn parse(packet: &[u8]) -> Result<Self, DiscoveryError> {
        let text = std::str::from_utf8(packet)
            .map_err(|_| DiscoveryError::NotDiscovery)?
            .trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if text == DISCOVERY_MAGIC {
            return Ok(Self::default());
        }
        if !text.starts_with('{') {
            return Err(DiscoveryError::NotDiscovery);
        }

        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
        if envelope.magic != DISCOVERY_MAGIC {
            return Err(DiscoveryError::NotDiscovery);
        }

        let broker = envelope
            .mqtt_broker
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .map(|host| BrokerAnnouncement {
                host,
                port: envelope.mqtt_port.unwrap_or(DEFAULT_MQTT_PORT),
            });

        Ok(Self {
            backend_mac: envelope
                .backend_mac
                .map(|mac| mac.trim().to_string())
                .filter(|mac| !mac.is_empty()),
            broker,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryResponse {
    pub device_id: String,
    pub ip_address: String,
    pub firmware_version: String,
    pub sensor_type: String,
    pub availability: u8,
    pub magic: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_mac: Option<MacAddress>,
}

/// What the responder needs to know about the device at reply time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub device_id: String,
    pub ip_address: String,
    pub firmware_version: String,
    pub sensor_type: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAssignment {
    pub broker_host: String,
    pub port: u16,
    #[serde(default)]
    pub backend_mac: Option<MacAddress>,
}

/// Owner of the `mqtt` namespace.
#[derive(Clone)]
pub struct BrokerStore<S> {
    store: S,
}

impl<S: KeyValueStore> BrokerStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Option<BrokerAssignment> {
        let host = match self.store.get_str(MQTT_NAMESPACE, KEY_BROKER) {
            Ok(Some(host)) if !host.trim().is_empty() => host,
            Ok(_) => return None,
            Err(err) => {
                warn!("failed to read {MQTT_NAMESPACE}.{KEY_BROKER}: {err}");
                return None;
            }
        };
        let port = match self.store.get_u16(MQTT_NAMESPACE, KEY_PORT) {
            Ok(Some(port)) => port,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to read {MQTT_NAMESPACE}.{KEY_PORT}: {err}");
                return None;
            }
        };
        Some(BrokerAssignment {
            broker_host: host,
            port,
            backend_mac: self.backend_mac(),
        })
    }

    pub fn backend_mac(&self) -> Option<MacAddress> {
        self.store
            .get_str(MQTT_NAMESPACE, KEY_BACKEND_MAC)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
    }

    /// The broker host is cleared first and written last, so an
    /// interrupted save never loads as a valid record.
    pub fn save(&self, assignment: &BrokerAssignment) -> Result<(), StoreError> {
        self.store.remove(MQTT_NAMESPACE, KEY_BROKER)?;
        self.store
            .set_u16(MQTT_NAMESPACE, KEY_PORT, assignment.port)?;
        if let Some(mac) = &assignment.backend_mac {
            // best effort
            if let Err(err) = self
                .store
                .set_str(MQTT_NAMESPACE, KEY_BACKEND_MAC, &mac.to_string())
            {
                warn!("failed to persist backend mac: {err}");
            }
        }
        self.store
            .set_str(MQTT_NAMESPACE, KEY_BROKER, &assignment.broker_host)?;
        info!(
            "mqtt broker stored: {}:{}",
            assignment.broker_host, assignment.port
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerDecision {
    /// The request carried no broker information.
    NotAnnounced,
    Accepted(BrokerAssignment),
    /// A broker was already accepted this session.
    AlreadyAccepted,
    Rejected {
        announced: Option<String>,
        trusted: MacAddress,
    },
    /// Trusted, but the store refused it. A later announcement may retry.
    NotSaved(StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledDiscovery {
    pub response: DiscoveryResponse,
    pub broker: BrokerDecision,
}

/// Answers discovery requests and applies the accept-once broker rule for
/// the current boot session.
pub struct DiscoveryResponder<S> {
    wifi: WifiCredentialStore<S>,
    brokers: BrokerStore<S>,
    accepted: Option<BrokerAssignment>,
}

impl<S: KeyValueStore + Clone> DiscoveryResponder<S> {
    pub fn new(store: S) -> Self {
        Self {
            wifi: WifiCredentialStore::new(store.clone()),
            brokers: BrokerStore::new(store),
            accepted: None,
        }
    }
}

impl<S: KeyValueStore> DiscoveryResponder<S> {
    pub fn accepted(&self) -> Option<&BrokerAssignment> {
        self.accepted.as_ref()
    }

    /// `wifi.hostmac` when provisioned with one, else the MAC persisted with
    /// the last accepted broker.
    pub fn trust_anchor(&self) -> Option<MacAddress> {
        self.wifi.host_mac().or_else(|| self.brokers.backend_mac())
    }

    pub fn handle(
        &mut self,
        packet: &[u8],
        device: &Advertisement,
    ) -> Result<HandledDiscovery, DiscoveryError> {
        let request = DiscoveryRequest::parse(packet)?;
        let broker = self.consider_broker(&request);

        let response = DiscoveryResponse {
            device_id: device.device_id.clone(),
            ip_address: device.ip_address.clone(),
            firmware_version: device.firmware_version.clone(),
            sensor_type: device.sensor_type.clone(),
            availability: u8::from(device.available),
            magic: RESPONSE_MAGIC,
            backend_mac: self.trust_anchor(),
        };
        Ok(HandledDiscovery { response, broker })
    }

    fn consider_broker(&mut self, request: &DiscoveryRequest) -> BrokerDecision {
        let Some(announcement) = &request.broker else {
            return BrokerDecision::NotAnnounced;
        };
        if self.accepted.is_some() {
            info!("ignoring broker {} (already accepted)", announcement.host);
            return BrokerDecision::AlreadyAccepted;
        }

        let announced = request
            .backend_mac
            .as_deref()
            .and_then(|raw| raw.parse::<MacAddress>().ok());

        if let Some(trusted) = self.trust_anchor() {
            if announced != Some(trusted) {
                warn!(
                    "broker announcement from {} rejected: backend mac does not match",
                    request.backend_mac.as_deref().unwrap_or("<none>")
                );
                return BrokerDecision::Rejected {
                    announced: request.backend_mac.clone(),
                    trusted,
                };
            }
        }

        let assignment = BrokerAssignment {
            broker_host: announcement.host.clone(),
            port: announcement.port,
            backend_mac: announced,
        };
        if let Err(err) = self.brokers.save(&assignment) {
            warn!("broker {} not stored: {err}", assignment.broker_host);
            return BrokerDecision::NotSaved(err);
        }
        self.accepted = Some(assignment.clone());
        BrokerDecision::Accepted(assignment)
    }
}

/// Discovery replies go back to a fixed port when configured, else to the
/// sender's source port + 1.
pub fn response_port(source_port: u16, configured: Option<u16>) -> u16 {
    configured.unwrap_or_else(|| source_port.wrapping_add(1))
}
