use crate::serial::{SerialError, SerialInterface, SerialPortDescriptor};

/// Change between two consecutive port scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    PortAdded(String),
    PortRemoved(String),
}

/// Source of the OS serial port list
pub trait PortScanner: Send + Sync + 'static {
    fn scan(&self) -> Result<Vec<SerialPortDescriptor>, SerialError>;
}

/// Enumerates real ports through `serialport`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortScanner;

impl PortScanner for SystemPortScanner {
    fn scan(&self) -> Result<Vec<SerialPortDescriptor>, SerialError> {
        SerialInterface::discover_ports()
    }
}

impl<F> PortScanner for F
where
    F: Fn() -> Result<Vec<SerialPortDescriptor>, SerialError> + Send + Sync + 'static,
{
    fn scan(&self) -> Result<Vec<SerialPortDescriptor>, SerialError> {
        self()
    }
}

/// Remembers the previous scan so only real changes are reported
#[derive(Debug, Default)]
pub struct PortListTracker {
    last: Option<Vec<SerialPortDescriptor>>,
}

impl PortListTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sorted list when it differs from the previous scan.
    /// The first scan always counts as a change.
    pub fn update(&mut self, mut ports: Vec<SerialPortDescriptor>) -> Option<Vec<SerialPortDescriptor>> {
        ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        if self.last.as_ref() == Some(&ports) {
            return None;
        }

        for event in diff(self.last.as_deref().unwrap_or(&[]), &ports) {
            log::info!("Serial port change: {:?}", event);
        }
        self.last = Some(ports.clone());
        Some(ports)
    }

    pub fn ports(&self) -> &[SerialPortDescriptor] {
        self.last.as_deref().unwrap_or(&[])
    }
}

fn diff(before: &[SerialPortDescriptor], after: &[SerialPortDescriptor]) -> Vec<PortEvent> {
    let added = after
        .iter()
        .filter(|p| !before.iter().any(|b| b.port_name == p.port_name))
        .map(|p| PortEvent::PortAdded(p.port_name.clone()));
    let removed = before
        .iter()
        .filter(|p| !after.iter().any(|a| a.port_name == p.port_name))
        .map(|p| PortEvent::PortRemoved(p.port_name.clone()));
    added.chain(removed).collect()
}

/// Map what the user picked (port name or its description) to a port name.
/// Unknown values pass through so ports missing from the scan can still be opened.
pub fn resolve_port(ports: &[SerialPortDescriptor], selection: &str) -> String {
    ports
        .iter()
        .find(|p| p.port_name == selection)
        .or_else(|| ports.iter().find(|p| p.description == selection))
        .map(|p| p.port_name.clone())
        .unwrap_or_else(|| selection.to_string())
}
