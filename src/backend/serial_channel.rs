//! Serial channel for instrument communication
//!
//! This module provides the byte-level link to an instrument. The
//! [`SerialLink`] trait is the contract the device layer programs against;
//! [`SerialChannel`] implements it over the `serialport` crate, and the
//! simulator implements it for tests and hardware-free runs.
//!
//! # Behavior when not connected
//!
//! Every operation is a no-op on a closed channel: writes report zero bytes,
//! reads return nothing, [`SerialLink::read_line`] returns an empty string.
//! Driver faults (bad port name, port busy, I/O failure) are logged and
//! reported as `false`/zero rather than propagated.
//!
//! # Locking
//!
//! All port access goes through one mutex, so a channel can be shared between
//! a single writer and a single reader. It is not meant to be shared by
//! independent devices.

use crate::error::Result;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default baud rate used by the instruments
pub const DEFAULT_BAUD_RATE: u32 = 460_800;

/// Timeout applied until [`SerialLink::set_timeout`] is called
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Information about an enumerable serial endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// System port name (e.g. `/dev/ttyACM0`, `COM3`)
    pub port: String,
    /// Human readable description (manufacturer and product for USB ports)
    pub description: String,
    /// Hardware identifier (`USB VID:PID=0483:5740 SER=...`)
    pub hardware_id: String,
}

impl PortDescriptor {
    /// Check whether the descriptor text carries the expected driver signature
    ///
    /// Matching is case-insensitive and considers both the description and the
    /// hardware id. An empty signature matches every port.
    pub fn matches_signature(&self, signature: &str) -> bool {
        if signature.is_empty() {
            return true;
        }
        let signature = signature.to_lowercase();
        self.description.to_lowercase().contains(&signature)
            || self.hardware_id.to_lowercase().contains(&signature)
    }
}

impl std::fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} [{}]", self.port, self.description, self.hardware_id)
    }
}

impl From<serialport::SerialPortInfo> for PortDescriptor {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let (description, hardware_id) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = [usb.manufacturer, usb.product]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut hardware_id = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial) = usb.serial_number {
                    hardware_id.push_str(&format!(" SER={}", serial));
                }
                (description, hardware_id)
            }
            SerialPortType::BluetoothPort => ("Bluetooth".to_string(), String::new()),
            SerialPortType::PciPort => ("PCI".to_string(), String::new()),
            SerialPortType::Unknown => ("Unknown".to_string(), String::new()),
        };
        Self {
            port: info.port_name,
            description,
            hardware_id,
        }
    }
}

/// Byte-level link to one instrument
///
/// Implementations must be `Send` so devices can be polled from the
/// acquisition thread.
#[cfg_attr(test, mockall::automock)]
pub trait SerialLink: Send {
    /// Open the named endpoint, returning `false` on any failure
    fn connect(&self, port: &str) -> bool;

    /// Close the endpoint (idempotent)
    fn disconnect(&self);

    /// Check if an endpoint is open
    fn is_connected(&self) -> bool;

    /// Name of the open endpoint
    fn port_name(&self) -> Option<String>;

    /// Write raw bytes, returning the number written
    fn write(&self, data: &[u8]) -> usize;

    /// Read up to `count` bytes, stopping early on timeout
    fn read(&self, count: usize) -> Vec<u8>;

    /// Read up to and including a newline; empty when nothing arrives in time
    fn read_line(&self) -> String;

    /// Number of received bytes waiting to be read
    fn bytes_available(&self) -> usize;

    /// Flush pending output
    fn flush(&self);

    /// Discard buffered input
    fn purge(&self);

    /// Set the blocking read timeout
    fn set_timeout(&self, timeout: Duration);

    /// List every enumerable endpoint
    fn list_all_ports(&self) -> Vec<PortDescriptor>;

    /// List endpoints not held open by any process
    fn list_free_ports(&self) -> Vec<String>;
}

struct ChannelState {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
    timeout: Duration,
}

/// Serial channel backed by the `serialport` crate
pub struct SerialChannel {
    baud_rate: u32,
    state: Mutex<ChannelState>,
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl SerialChannel {
    /// Create a closed channel using the given baud rate
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            state: Mutex::new(ChannelState {
                port: None,
                port_name: None,
                timeout: DEFAULT_TIMEOUT,
            }),
        }
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enumerate ports through the driver, reporting enumeration failures
    pub fn try_available_ports() -> Result<Vec<PortDescriptor>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(PortDescriptor::from).collect())
    }

    /// Enumerate ports through the driver, logging enumeration failures
    pub fn available_ports() -> Vec<PortDescriptor> {
        Self::try_available_ports().unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            Vec::new()
        })
    }

    /// Probe each port with an exclusive open; success means the port is free
    pub fn free_ports(baud_rate: u32) -> Vec<String> {
        Self::available_ports()
            .into_iter()
            .filter(|p| match serialport::new(&p.port, baud_rate).open() {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!("Port {} is busy: {}", p.port, e);
                    false
                }
            })
            .map(|p| p.port)
            .collect()
    }
}

impl SerialLink for SerialChannel {
    fn connect(&self, port: &str) -> bool {
        let mut state = self.lock();
        if state.port.is_some() {
            tracing::warn!(
                "Channel already open on {:?}, refusing to open {}",
                state.port_name,
                port
            );
            return false;
        }

        match serialport::new(port, self.baud_rate)
            .timeout(state.timeout)
            .open()
        {
            Ok(handle) => {
                tracing::debug!("Opened {} at {} baud", port, self.baud_rate);
                state.port = Some(handle);
                state.port_name = Some(port.to_string());
                true
            }
            Err(e) => {
                tracing::warn!("Failed to open {}: {}", port, e);
                false
            }
        }
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        if let Some(name) = state.port_name.take() {
            tracing::debug!("Closing {}", name);
        }
        state.port = None;
    }

    fn is_connected(&self) -> bool {
        self.lock().port.is_some()
    }

    fn port_name(&self) -> Option<String> {
        self.lock().port_name.clone()
    }

    fn write(&self, data: &[u8]) -> usize {
        let mut state = self.lock();
        let Some(port) = state.port.as_mut() else {
            return 0;
        };
        match port.write_all(data) {
            Ok(()) => {
                tracing::trace!("TX {:?}", String::from_utf8_lossy(data));
                data.len()
            }
            Err(e) => {
                tracing::warn!("Serial write failed: {}", e);
                0
            }
        }
    }

    fn read(&self, count: usize) -> Vec<u8> {
        let mut state = self.lock();
        let Some(port) = state.port.as_mut() else {
            return Vec::new();
        };

        let mut buffer = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Serial read failed: {}", e);
                    break;
                }
            }
        }
        buffer.truncate(filled);
        buffer
    }

    fn read_line(&self) -> String {
        let mut state = self.lock();
        let deadline = Instant::now() + state.timeout;
        let Some(port) = state.port.as_mut() else {
            return String::new();
        };

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while Instant::now() < deadline {
            match port.read(&mut byte) {
                Ok(1) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Serial readline failed: {}", e);
                    break;
                }
            }
        }

        let line = String::from_utf8_lossy(&line).into_owned();
        tracing::trace!("RX {:?}", line);
        line
    }

    fn bytes_available(&self) -> usize {
        let state = self.lock();
        match state.port.as_ref().map(|p| p.bytes_to_read()) {
            Some(Ok(n)) => n as usize,
            Some(Err(e)) => {
                tracing::warn!("Failed to query receive buffer: {}", e);
                0
            }
            None => 0,
        }
    }

    fn flush(&self) {
        let mut state = self.lock();
        if let Some(port) = state.port.as_mut() {
            if let Err(e) = port.flush() {
                tracing::warn!("Serial flush failed: {}", e);
            }
        }
    }

    fn purge(&self) {
        let state = self.lock();
        if let Some(port) = state.port.as_ref() {
            if let Err(e) = port.clear(ClearBuffer::Input) {
                tracing::warn!("Serial purge failed: {}", e);
            }
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        let mut state = self.lock();
        state.timeout = timeout;
        if let Some(port) = state.port.as_mut() {
            if let Err(e) = port.set_timeout(timeout) {
                tracing::warn!("Failed to set serial timeout: {}", e);
            }
        }
    }

    fn list_all_ports(&self) -> Vec<PortDescriptor> {
        Self::available_ports()
    }

    fn list_free_ports(&self) -> Vec<String> {
        Self::free_ports(self.baud_rate)
    }
}
