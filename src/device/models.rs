use serde::{Serialize, Serializer};

use crate::serial::{SerialPortDescriptor, WifiInfo};

/// Connection state of one transport, owned by its worker
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Everything the device layer reports to its consumers.
/// Serialized as `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Notification {
    Warning(String),
    SocketStatusChanged(bool),
    /// Camera configuration as JSON text
    SocketConfig(String),
    /// Encoded image, hex in JSON
    SocketImage(#[serde(serialize_with = "serialize_hex")] Vec<u8>),
    /// `ip:port` of the preferred discovered camera
    SocketSearchResult(String),
    SerialListChanged(Vec<SerialPortDescriptor>),
    SerialStatusChanged(bool),
    WifiSsidList(Vec<String>),
    WifiInfo(WifiInfo),
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl Notification {
    pub fn warning(text: impl Into<String>) -> Self {
        Notification::Warning(text.into())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"warning","data":"unserializable notification: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_json_shape() {
        let value: serde_json::Value = serde_json::from_str(&Notification::SocketStatusChanged(true).to_json()).unwrap();
        assert_eq!(value, json!({"event": "socketStatusChanged", "data": true}));

        let value: serde_json::Value =
            serde_json::from_str(&Notification::SocketImage(vec![0xde, 0xad]).to_json()).unwrap();
        assert_eq!(value, json!({"event": "socketImage", "data": "dead"}));

        let info = WifiInfo {
            ssid: Some("lab".into()),
            password: None,
            connected: Some(true),
        };
        let value: serde_json::Value = serde_json::from_str(&Notification::WifiInfo(info).to_json()).unwrap();
        assert_eq!(
            value,
            json!({"event": "wifiInfo", "data": {"ssid": "lab", "password": null, "connected": true}})
        );
    }

    #[test]
    fn test_port_list_json() {
        let ports = vec![SerialPortDescriptor {
            port_name: "COM3".into(),
            description: "USB-SERIAL CH340".into(),
        }];
        let value: serde_json::Value =
            serde_json::from_str(&Notification::SerialListChanged(ports).to_json()).unwrap();
        assert_eq!(
            value,
            json!({"event": "serialListChanged", "data": [{"port_name": "COM3", "description": "USB-SERIAL CH340"}]})
        );
    }
}
