//! Inbound command envelopes.
//!
//! Consumers send JSON such as `{"driver":"serial","command":"connect","com":"COM3","baud":9600}`.
//! Envelopes are decoded here into closed per-driver command types; workers
//! never see raw JSON.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::device::{DeviceError, Result};

pub const SOCKET_DRIVER: &str = "socket";
pub const SERIAL_DRIVER: &str = "serial";

/// How the camera to connect to is identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraTarget {
    Address(SocketAddr),
    /// Id announced by a discovery beacon
    Discovered(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Connect(CameraTarget),
    Disconnect,
    Ping,
    GetConfig,
    /// Validated JSON text
    SetConfig(String),
    /// JSON text sent as the control body
    Control(String),
    Upgrade(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    /// `com` is either a port name or a port description
    Connect { com: String, baud: u32 },
    Disconnect,
    ConnectWifi { ssid: String, password: String },
    DisconnectWifi,
    GetSsid,
    GetPassword,
    GetWifiStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Socket(SocketCommand),
    Serial(SerialCommand),
}

impl Command {
    /// Decode and validate one envelope
    pub fn parse(message: &str) -> Result<Command> {
        let value: Value = serde_json::from_str(message).map_err(|e| DeviceError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Command> {
        let fields = match value {
            Value::Object(fields) => fields,
            other => return Err(DeviceError::Decode(format!("expected an object, got {}", other))),
        };
        let envelope = Envelope::new(&fields)?;

        match envelope.driver {
            SOCKET_DRIVER => envelope.socket_command().map(Command::Socket),
            SERIAL_DRIVER => envelope.serial_command().map(Command::Serial),
            other => Err(DeviceError::UnknownDriver(other.to_string())),
        }
    }

    pub fn driver(&self) -> &'static str {
        match self {
            Command::Socket(_) => SOCKET_DRIVER,
            Command::Serial(_) => SERIAL_DRIVER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Socket(command) => command.name(),
            Command::Serial(command) => command.name(),
        }
    }

    /// Wire form of this command
    pub fn to_envelope(&self) -> Value {
        let mut envelope = json!({ "driver": self.driver(), "command": self.name() });
        let extra = match self {
            Command::Socket(SocketCommand::Connect(CameraTarget::Address(addr))) => {
                json!({ "ip": addr.ip().to_string(), "port": addr.port() })
            }
            Command::Socket(SocketCommand::Connect(CameraTarget::Discovered(id))) => json!({ "id": id }),
            Command::Socket(SocketCommand::SetConfig(config)) => json!({ "config": config }),
            Command::Socket(SocketCommand::Control(control)) => json!({ "control": control }),
            Command::Socket(SocketCommand::Upgrade(path)) => json!({ "filePath": path.to_string_lossy() }),
            Command::Serial(SerialCommand::Connect { com, baud }) => json!({ "com": com, "baud": baud }),
            Command::Serial(SerialCommand::ConnectWifi { ssid, password }) => {
                json!({ "ssid": ssid, "password": password })
            }
            _ => json!({}),
        };

        if let (Some(envelope), Value::Object(extra)) = (envelope.as_object_mut(), extra) {
            envelope.extend(extra);
        }
        envelope
    }
}

impl SocketCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SocketCommand::Connect(_) => "connect",
            SocketCommand::Disconnect => "disconnect",
            SocketCommand::Ping => "ping",
            SocketCommand::GetConfig => "get_config",
            SocketCommand::SetConfig(_) => "set_config",
            SocketCommand::Control(_) => "control",
            SocketCommand::Upgrade(_) => "upgrade",
        }
    }
}

impl SerialCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SerialCommand::Connect { .. } => "connect",
            SerialCommand::Disconnect => "disconnect",
            SerialCommand::ConnectWifi { .. } => "connectWifi",
            SerialCommand::DisconnectWifi => "disconnectWifi",
            SerialCommand::GetSsid => "getSsid",
            SerialCommand::GetPassword => "getPassword",
            SerialCommand::GetWifiStatus => "getWifiStatus",
        }
    }
}

struct Envelope<'a> {
    driver: &'a str,
    command: &'a str,
    fields: &'a Map<String, Value>,
}

impl<'a> Envelope<'a> {
    fn new(fields: &'a Map<String, Value>) -> Result<Self> {
        let text = |name: &'static str| {
            fields
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| DeviceError::Decode(format!("envelope has no '{}'", name)))
        };
        Ok(Self {
            driver: text("driver")?,
            command: text("command")?,
            fields,
        })
    }

    fn unknown(&self) -> DeviceError {
        DeviceError::UnknownCommand {
            driver: self.driver.to_string(),
            command: self.command.to_string(),
        }
    }

    fn missing(&self, field: &'static str) -> DeviceError {
        DeviceError::MissingField {
            command: self.command.to_string(),
            field,
        }
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidField {
            command: self.command.to_string(),
            field,
            reason: reason.into(),
        }
    }

    fn field(&self, name: &'static str) -> Option<&'a Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    fn required(&self, name: &'static str) -> Result<&'a Value> {
        self.field(name).ok_or_else(|| self.missing(name))
    }

    fn string(&self, name: &'static str) -> Result<String> {
        self.required(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(name, "expected a string"))
    }

    /// Integer that may also arrive as a numeric string
    fn number(&self, name: &'static str) -> Result<u64> {
        let value = self.required(name)?;
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| self.invalid(name, format!("expected a non-negative integer, got {}", value)))
    }

    fn socket_command(&self) -> Result<SocketCommand> {
        let command = match self.command {
            "connect" => SocketCommand::Connect(self.camera_target()?),
            "disconnect" => SocketCommand::Disconnect,
            "ping" => SocketCommand::Ping,
            "get_config" => SocketCommand::GetConfig,
            "set_config" => SocketCommand::SetConfig(self.config()?),
            "control" => SocketCommand::Control(self.control()?),
            "upgrade" => {
                let path = self.string("filePath")?;
                if path.trim().is_empty() {
                    return Err(self.invalid("filePath", "empty path"));
                }
                SocketCommand::Upgrade(PathBuf::from(path))
            }
            _ => return Err(self.unknown()),
        };
        Ok(command)
    }

    fn camera_target(&self) -> Result<CameraTarget> {
        if self.field("ip").is_none() {
            let id = self.field("id").or_else(|| self.field("uuid")).ok_or_else(|| self.missing("ip"))?;
            return id
                .as_str()
                .filter(|id| !id.is_empty())
                .map(|id| CameraTarget::Discovered(id.to_string()))
                .ok_or_else(|| self.invalid("id", "expected a non-empty string"));
        }

        let ip: IpAddr = self
            .string("ip")?
            .trim()
            .parse()
            .map_err(|e| self.invalid("ip", format!("{}", e)))?;
        let port = self.number("port")?;
        let port = u16::try_from(port)
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| self.invalid("port", format!("{} is not a usable port", port)))?;
        Ok(CameraTarget::Address(SocketAddr::new(ip, port)))
    }

    /// Config must be JSON; objects are accepted and serialized compactly
    fn config(&self) -> Result<String> {
        let value = self.required("config")?;
        match value {
            Value::String(text) => {
                serde_json::from_str::<Value>(text).map_err(|e| self.invalid("config", format!("not JSON: {}", e)))?;
                Ok(text.clone())
            }
            Value::Object(_) | Value::Array(_) => Ok(value.to_string()),
            other => Err(self.invalid("config", format!("expected JSON text, got {}", other))),
        }
    }

    /// Bare words become JSON string literals so the body is always JSON
    fn control(&self) -> Result<String> {
        match self.required("control")? {
            Value::String(text) if serde_json::from_str::<Value>(text).is_ok() => Ok(text.clone()),
            Value::String(text) => Ok(Value::String(text.clone()).to_string()),
            value => Ok(value.to_string()),
        }
    }

    fn serial_command(&self) -> Result<SerialCommand> {
        let command = match self.command {
            "connect" => {
                let com = self.string("com")?;
                if com.trim().is_empty() {
                    return Err(self.invalid("com", "empty port"));
                }
                let baud = self.number("baud")?;
                let baud = u32::try_from(baud)
                    .ok()
                    .filter(|&b| b != 0)
                    .ok_or_else(|| self.invalid("baud", format!("{} is not a usable baud rate", baud)))?;
                SerialCommand::Connect { com, baud }
            }
            "disconnect" => SerialCommand::Disconnect,
            "connectWifi" => SerialCommand::ConnectWifi {
                ssid: self.string("ssid")?,
                password: self.string("password")?,
            },
            "disconnectWifi" => SerialCommand::DisconnectWifi,
            "getSsid" => SerialCommand::GetSsid,
            "getPassword" => SerialCommand::GetPassword,
            "getWifiStatus" => SerialCommand::GetWifiStatus,
            _ => return Err(self.unknown()),
        };
        Ok(command)
    }
}
