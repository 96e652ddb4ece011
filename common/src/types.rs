use serde::{Deserialize, Serialize};

use crate::{
    discovery::BrokerAssignment,
    failsafe::FailsafeAction,
    identity::IdentityTag,
    ota::OtaProgress,
    partition::SlotId,
    sensor::{SensorKind, Temperature},
};

pub const UNKNOWN_SENSOR: &str = "UNKNOWN";

/// `GET /info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoPayload {
    pub sensor_type: String,
    pub sensor_id: String,
}

/// `GET /id`. Carries the sensor type code, not the device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdPayload {
    pub id: String,
}

/// `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub firmware_version: String,
    pub running_slot: SlotId,
    pub boot_slot: Option<SlotId>,
    pub identity: Option<IdentityTag>,
    pub failsafe: FailsafeAction,
    pub ip_address: Option<String>,
    pub wifi_ssid: Option<String>,
    pub broker: Option<BrokerAssignment>,
    pub ota: OtaProgress,
    pub uptime_ms: u64,
}

impl DeviceSnapshot {
    /// Minimal status page served on `/`, with the firmware upload form.
    pub fn to_html(&self) -> String {
        let identity = self
            .identity
            .map_or_else(|| UNKNOWN_SENSOR.to_string(), |tag| tag.to_string());
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>LabExpert OTA</title></head>\
             <body><h1>LabExpert OTA</h1><table>\
             <tr><td>Device</td><td>{}</td></tr>\
             <tr><td>Firmware</td><td>{}</td></tr>\
             <tr><td>Sensor</td><td>{}</td></tr>\
             <tr><td>Running</td><td>{}</td></tr>\
             <tr><td>Address</td><td>{}</td></tr>\
             <tr><td>Update</td><td>{}/{} bytes</td></tr>\
             </table>\
             <form method=\"POST\" action=\"/update\" enctype=\"multipart/form-data\">\
             <input type=\"file\" name=\"update\"><input type=\"submit\" value=\"Update\">\
             </form></body></html>",
            escape_html(&self.device_id),
            escape_html(&self.firmware_version),
            escape_html(&identity),
            self.running_slot.label(),
            escape_html(self.ip_address.as_deref().unwrap_or("-")),
            self.ota.bytes_written,
            self.ota.expected_size,
        )
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// `POST /identity/repair`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepairRequest {
    pub tag: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One reading on `sensors/{id}/data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPayload {
    pub c: f32,
    pub f: f32,
    pub k: f32,
    /// Milliseconds since the experiment started.
    pub ts: u64,
    pub cnt: u32,
    /// Conversion plus readout time in milliseconds.
    pub pt: u32,
}

impl DataPayload {
    pub fn new(reading: Temperature, ts: u64, cnt: u32, pt: u32) -> Self {
        Self {
            c: reading.celsius,
            f: reading.fahrenheit(),
            k: reading.kelvin(),
            ts,
            cnt,
            pt,
        }
    }
}

/// `sensors/{id}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub status: String,
    pub sensor_id: String,
    pub sensor_type: SensorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Announcement published on connect and on the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sensor_id: String,
    pub sensor_type: SensorKind,
}

impl IdentifyPayload {
    pub fn new(sensor_id: &str, sensor_type: SensorKind) -> Self {
        Self {
            kind: "sensor_identify",
            sensor_id: sensor_id.to_string(),
            sensor_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn status_payload_omits_empty_message() {
        let payload = StatusPayload {
            status: "experiment_started".into(),
            sensor_id: "2AB9F".into(),
            sensor_type: SensorKind::Thr,
            message: None,
        };

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"status": "experiment_started", "sensor_id": "2AB9F", "sensor_type": "THR"})
        );
    }

    #[test]
    fn status_page_escapes_values() {
        let snapshot = DeviceSnapshot {
            device_id: "2AB9F".into(),
            firmware_version: "OTA_BOOTLOADER".into(),
            running_slot: SlotId::A,
            boot_slot: Some(SlotId::A),
            identity: Some(IdentityTag::parse("<A>").unwrap()),
            failsafe: FailsafeAction::Continue,
            ip_address: None,
            wifi_ssid: None,
            broker: None,
            ota: OtaProgress {
                state: crate::ota::OtaState::Idle,
                expected_size: 0,
                bytes_written: 0,
            },
            uptime_ms: 0,
        };

        let page = snapshot.to_html();
        assert!(page.contains("&lt;A&gt;"));
        assert!(page.contains("action=\"/update\""));
        assert!(page.contains("ota_0"));
    }

    #[test]
    fn identify_payload_shape() {
        assert_eq!(
            serde_json::to_value(IdentifyPayload::new("2AB9F", SensorKind::Thr)).unwrap(),
            json!({"type": "sensor_identify", "sensor_id": "2AB9F", "sensor_type": "THR"})
        );
    }
}
