//! Devices
//!
//! A [`Device`] is either physical (a live instrument behind a serial link) or
//! virtual (data replayed from a saved session). Both carry a [`DeviceInfo`];
//! only physical devices implement the [`Acquire`] capability.
//!
//! # Physical device states
//!
//! ```text
//! Disconnected --try_connect--> Connected(idle) --start--> Connected(running)
//!       ^                            |    ^                       |
//!       +---------disconnect---------+    +---------stop----------+
//! ```

use crate::backend::framer::PacketBuffer;
use crate::backend::protocol::{Command, ControlProtocol};
use crate::backend::serial_channel::{PortDescriptor, SerialLink};
use crate::config::{DeviceDescriptor, DeviceSettings, SerialSettings};
use crate::error::{DaqError, Result, ResultExt};
use crate::types::{DeviceInfo, DeviceKind, DeviceSnapshot};
use std::time::{Duration, Instant};

/// How often the receive buffer is checked while waiting for the stop reply
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Sequence discontinuity observed while reading telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketGap {
    /// Id that would have continued the sequence
    pub expected: u32,
    /// Id actually received
    pub received: u32,
}

/// Result of one read cycle
///
/// A cycle that aborts on a fatal error still reports the packets it had
/// already appended before the failure.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Packets appended to the node buffers
    pub ingested: usize,
    /// Discontinuities seen during the cycle
    pub gaps: Vec<PacketGap>,
    /// Error that aborted the cycle
    pub error: Option<DaqError>,
}

impl ReadOutcome {
    /// Whether the cycle ran to completion
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Operations only live instruments support
pub trait Acquire {
    /// Scan free ports for the instrument with this device's id
    ///
    /// Returns `Ok(false)` when no candidate port answered with the right id.
    fn try_connect(&mut self) -> Result<bool>;

    /// Set the telemetry period
    fn set_sampling_period(&mut self, period_ms: u32) -> Result<()>;

    /// Start streaming
    fn start(&mut self) -> Result<()>;

    /// Stop streaming and drain in-flight telemetry
    fn stop(&mut self) -> Result<()>;

    /// Stop if running, then close the link
    fn disconnect(&mut self) -> Result<()>;

    /// Move received bytes into the node buffers
    fn read_data(&mut self) -> ReadOutcome;

    /// Whether the identity handshake succeeded and the link is open
    fn is_connected(&self) -> bool;

    /// Whether the instrument is streaming
    fn is_running(&self) -> bool;
}

/// A serial-connected instrument
pub struct PhysicalDevice {
    info: DeviceInfo,
    link: Box<dyn SerialLink>,
    buffer: PacketBuffer,
    prev_packet_id: Option<u32>,
    connected: bool,
    running: bool,
    serial: SerialSettings,
    timing: DeviceSettings,
}

impl PhysicalDevice {
    /// Create a disconnected device using the given link
    pub fn new(
        info: DeviceInfo,
        link: Box<dyn SerialLink>,
        serial: SerialSettings,
        timing: DeviceSettings,
    ) -> Self {
        Self {
            info,
            link,
            buffer: PacketBuffer::new(),
            prev_packet_id: None,
            connected: false,
            running: false,
            serial,
            timing,
        }
    }

    /// Create a device from a configuration block
    pub fn from_descriptor(
        descriptor: &DeviceDescriptor,
        link: Box<dyn SerialLink>,
        serial: SerialSettings,
        timing: DeviceSettings,
    ) -> Self {
        let info = DeviceInfo::with_node_names(descriptor.id, &descriptor.name, &descriptor.nodes);
        Self::new(info, link, serial, timing)
    }

    /// Identity and node data
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Port the device is connected on
    pub fn port_name(&self) -> Option<String> {
        self.link.port_name()
    }

    /// Sequence id of the last ingested packet
    pub fn prev_packet_id(&self) -> Option<u32> {
        self.prev_packet_id
    }

    fn protocol(&self) -> ControlProtocol<'_> {
        ControlProtocol::new(self.link.as_ref())
    }

    fn ensure_link(&self, operation: &str) -> Result<()> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(DaqError::InvalidState(format!(
                "cannot {} device ({}): not connected",
                operation,
                self.info.label()
            )))
        }
    }

    fn candidate_ports(&self) -> Vec<PortDescriptor> {
        let free = self.link.list_free_ports();
        self.link
            .list_all_ports()
            .into_iter()
            .filter(|p| free.contains(&p.port))
            .filter(|p| p.matches_signature(&self.serial.port_signature))
            .collect()
    }

    /// Bring the instrument on the open port to a known state and check its id
    fn identify(&mut self, port: &str) -> Result<()> {
        if let Err(e) = self.stop() {
            tracing::warn!("Best-effort stop on {} failed: {}", port, e);
        }

        let tokens = self
            .protocol()
            .write_and_tokenize_result(&Command::IdentityQuery.to_wire())?;

        match tokens.as_slice() {
            [id] if id.trim().parse::<i32>().ok() == Some(self.info.id) => Ok(()),
            _ => Err(DaqError::IdentityMismatch {
                port: port.to_string(),
                expected: self.info.id,
                received: tokens.join(","),
            }),
        }
    }

    fn unresponsive(&self, message: String) -> DaqError {
        DaqError::DeviceUnresponsive {
            device: self.info.label(),
            message,
        }
    }
}

impl Acquire for PhysicalDevice {
    fn try_connect(&mut self) -> Result<bool> {
        if !self.info.is_configured() {
            return Err(DaqError::NotConfigured {
                name: self.info.name.clone(),
                id: self.info.id,
                nodes: self.info.nodes.len(),
            });
        }
        if self.connected {
            return Ok(true);
        }

        let label = self.info.label();
        tracing::info!("Initializing device ({})", label);

        let candidates = self.candidate_ports();
        if candidates.is_empty() {
            tracing::warn!("No available serial ports found for device ({})", label);
            return Ok(false);
        }

        self.link.set_timeout(self.serial.command_timeout());
        for candidate in &candidates {
            tracing::debug!("Trying {}", candidate);
            if !self.link.connect(&candidate.port) {
                tracing::warn!(
                    "{}",
                    DaqError::Connection {
                        port: candidate.port.clone(),
                        message: "port could not be opened".to_string(),
                    }
                );
                continue;
            }

            match self.identify(&candidate.port) {
                Ok(()) => {
                    self.connected = true;
                    self.running = false;
                    tracing::info!("Connected to device ({}) on {}", label, candidate.port);
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!("Rejecting {}: {}", candidate.port, e);
                    self.link.disconnect();
                }
            }
        }

        tracing::warn!("Could not find device ({})", label);
        Ok(false)
    }

    fn set_sampling_period(&mut self, period_ms: u32) -> Result<()> {
        self.ensure_link("configure")?;
        self.protocol()
            .execute(Command::SetSamplingPeriod(period_ms))
            .with_context(|| format!("Setting sampling period of device ({})", self.info.label()))
    }

    fn start(&mut self) -> Result<()> {
        self.ensure_link("start")?;
        self.protocol()
            .execute(Command::Start)
            .with_context(|| format!("Starting device ({})", self.info.label()))?;
        self.running = true;
        tracing::debug!("Device ({}) streaming", self.info.label());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ensure_link("stop")?;
        let wire = Command::Stop.to_wire();
        self.protocol().send(&wire);

        let deadline = Instant::now() + self.timing.stop_timeout();
        while self.link.bytes_available() == 0 {
            if Instant::now() >= deadline {
                return Err(self.unresponsive(format!(
                    "no reply to STOP within {} ms",
                    self.timing.stop_timeout_ms
                )));
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        // Telemetry sent before the STOP took effect must not be read as a reply
        let deadline = Instant::now() + self.timing.drain_timeout();
        while self.link.bytes_available() > 0 {
            if Instant::now() >= deadline {
                return Err(self.unresponsive(format!(
                    "receive buffer did not drain within {} ms",
                    self.timing.drain_timeout_ms
                )));
            }
            self.link.purge();
            self.link.flush();
            std::thread::sleep(self.timing.drain_interval());
        }

        self.protocol()
            .execute(Command::Stop)
            .with_context(|| format!("Stopping device ({})", self.info.label()))?;

        self.prev_packet_id = None;
        self.buffer.clear();
        self.running = false;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let stopped = if self.running { self.stop() } else { Ok(()) };

        if self.link.is_connected() {
            self.link.disconnect();
            tracing::debug!("Device ({}) disconnected", self.info.label());
        }
        self.connected = false;
        self.running = false;
        self.prev_packet_id = None;
        self.buffer.clear();

        stopped
    }

    fn read_data(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        if !self.running {
            return outcome;
        }

        let available = self.link.bytes_available();
        if available > 0 {
            let bytes = self.link.read(available);
            self.buffer.extend(&bytes);
        }

        while let Some(packet) = self.buffer.next_packet() {
            if packet.payload.len() != self.info.nodes.len() {
                self.buffer.clear();
                outcome.error = Some(DaqError::PayloadLengthMismatch {
                    device: self.info.label(),
                    nodes: self.info.nodes.len(),
                    samples: packet.payload.len(),
                });
                break;
            }

            let id = packet.id();
            if let Some(prev) = self.prev_packet_id {
                let expected = prev.wrapping_add(1);
                if id != expected {
                    tracing::warn!(
                        "{}",
                        DaqError::PacketGap {
                            device: self.info.label(),
                            expected,
                            received: id,
                        }
                    );
                    outcome.gaps.push(PacketGap {
                        expected,
                        received: id,
                    });
                }
            }
            self.prev_packet_id = Some(id);

            for (node, sample) in self.info.nodes.iter_mut().zip(&packet.payload) {
                node.push(*sample);
            }
            outcome.ingested += 1;
        }

        outcome
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("info", &self.info)
            .field("port", &self.link.port_name())
            .field("connected", &self.connected)
            .field("running", &self.running)
            .field("prev_packet_id", &self.prev_packet_id)
            .finish()
    }
}

/// A device holding replayed data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    info: DeviceInfo,
}

impl VirtualDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

/// A physical or virtual device
#[derive(Debug)]
pub enum Device {
    Physical(PhysicalDevice),
    Virtual(VirtualDevice),
}

impl Device {
    /// Identity and node data
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Device::Physical(d) => &d.info,
            Device::Virtual(d) => &d.info,
        }
    }

    /// Mutable identity and node data
    pub fn info_mut(&mut self) -> &mut DeviceInfo {
        match self {
            Device::Physical(d) => &mut d.info,
            Device::Virtual(d) => &mut d.info,
        }
    }

    /// Live or replayed
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Physical(_) => DeviceKind::Physical,
            Device::Virtual(_) => DeviceKind::Virtual,
        }
    }

    /// Owned copy of the device's data
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.info().snapshot(self.kind())
    }

    /// The acquisition capability, if this is a live device
    pub fn as_physical_mut(&mut self) -> Option<&mut PhysicalDevice> {
        match self {
            Device::Physical(d) => Some(d),
            Device::Virtual(_) => None,
        }
    }

    /// Drop all samples, keeping identity
    pub fn clear(&mut self) {
        self.info_mut().clear_samples();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::framer::DataPacket;
    use crate::backend::serial_channel::MockSerialLink;
    use crate::backend::simulator::SimulatedBus;
    use crate::types::{Node, UNCONFIGURED_ID};

    fn fast_serial() -> SerialSettings {
        SerialSettings {
            command_timeout_ms: 50,
            ..SerialSettings::default()
        }
    }

    fn fast_timing() -> DeviceSettings {
        DeviceSettings {
            stop_timeout_ms: 100,
            drain_timeout_ms: 200,
            drain_interval_ms: 1,
        }
    }

    fn device_on(bus: &SimulatedBus, id: i32, nodes: &[&str]) -> PhysicalDevice {
        PhysicalDevice::new(
            DeviceInfo::with_node_names(id, "dev", nodes),
            Box::new(bus.link()),
            fast_serial(),
            fast_timing(),
        )
    }

    fn running_device(bus: &SimulatedBus, nodes: &[&str]) -> PhysicalDevice {
        bus.add_instrument("/dev/ttyACM0", 5, nodes.len());
        bus.set_auto_telemetry("/dev/ttyACM0", false);
        let mut device = device_on(bus, 5, nodes);
        assert!(device.try_connect().unwrap());
        device.start().unwrap();
        device
    }

    #[test]
    fn test_not_configured_skips_port_scan() {
        let mut link = MockSerialLink::new();
        link.expect_list_all_ports().times(0);
        link.expect_list_free_ports().times(0);

        let mut device = PhysicalDevice::new(
            DeviceInfo::new(UNCONFIGURED_ID, "bare", vec![Node::new("a")]),
            Box::new(link),
            fast_serial(),
            fast_timing(),
        );
        let err = device.try_connect().unwrap_err();
        assert!(matches!(err, DaqError::NotConfigured { .. }));

        let mut link = MockSerialLink::new();
        link.expect_list_all_ports().times(0);
        let mut device = PhysicalDevice::new(
            DeviceInfo::new(3, "no nodes", Vec::new()),
            Box::new(link),
            fast_serial(),
            fast_timing(),
        );
        assert!(device.try_connect().is_err());
    }

    #[test]
    fn test_no_candidate_ports() {
        let mut link = MockSerialLink::new();
        link.expect_list_free_ports().return_const(Vec::<String>::new());
        link.expect_list_all_ports().return_const(vec![PortDescriptor {
            port: "COM3".to_string(),
            description: "STMicroelectronics Virtual COM Port".to_string(),
            hardware_id: String::new(),
        }]);
        link.expect_connect().times(0);

        let mut device = PhysicalDevice::new(
            DeviceInfo::with_node_names(1, "dev", &["a"]),
            Box::new(link),
            fast_serial(),
            fast_timing(),
        );
        assert!(!device.try_connect().unwrap());
        assert!(!device.is_connected());
    }

    #[test]
    fn test_connect_picks_matching_id() {
        let bus = SimulatedBus::new();
        bus.add_instrument("/dev/ttyACM0", 1, 2);
        bus.add_instrument("/dev/ttyACM1", 2, 2);

        let mut device = device_on(&bus, 2, &["a", "b"]);
        assert!(device.try_connect().unwrap());
        assert!(device.is_connected());
        assert!(!device.is_running());
        assert_eq!(device.port_name().as_deref(), Some("/dev/ttyACM1"));
        assert!(!bus.is_open("/dev/ttyACM0"));
    }

    #[test]
    fn test_connect_ignores_foreign_and_busy_ports() {
        let bus = SimulatedBus::new();
        bus.add_port("/dev/ttyUSB0", "FTDI FT232R USB UART", 7, 1);
        bus.add_instrument("/dev/ttyACM0", 7, 1);

        let mut other = device_on(&bus, 7, &["a"]);
        assert!(other.try_connect().unwrap());

        // The only matching port is now held by `other`
        let mut device = device_on(&bus, 7, &["a"]);
        assert!(!device.try_connect().unwrap());
        assert!(bus.received_commands("/dev/ttyUSB0").is_empty());
    }

    #[test]
    fn test_set_sampling_period_and_start() {
        let bus = SimulatedBus::new();
        bus.add_instrument("/dev/ttyACM0", 4, 1);
        let mut device = device_on(&bus, 4, &["a"]);
        assert!(device.try_connect().unwrap());

        device.set_sampling_period(250).unwrap();
        assert_eq!(bus.sampling_period("/dev/ttyACM0"), Some(250));

        device.start().unwrap();
        assert!(device.is_running());
        assert!(bus.is_streaming("/dev/ttyACM0"));
    }

    #[test]
    fn test_bad_echo_fails_command() {
        let bus = SimulatedBus::new();
        bus.add_instrument("/dev/ttyACM0", 4, 1);
        let mut device = device_on(&bus, 4, &["a"]);
        assert!(device.try_connect().unwrap());

        bus.set_echo_override("/dev/ttyACM0", "PRDS", "PRDS,105.2");
        let err = device.set_sampling_period(100).unwrap_err();
        assert!(err.is_handshake_failure());
    }

    #[test]
    fn test_commands_require_connection() {
        let bus = SimulatedBus::new();
        let mut device = device_on(&bus, 1, &["a"]);
        assert!(matches!(device.start(), Err(DaqError::InvalidState(_))));
        assert!(matches!(device.stop(), Err(DaqError::InvalidState(_))));
        assert!(device.disconnect().is_ok());
    }

    #[test]
    fn test_stop_drains_in_flight_telemetry() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        for id in 0..5 {
            bus.push_packet("/dev/ttyACM0", &DataPacket::new(id, vec![id]));
        }
        device.stop().unwrap();

        assert!(!device.is_running());
        assert!(device.prev_packet_id().is_none());
        assert!(!bus.is_streaming("/dev/ttyACM0"));
        assert_eq!(device.info().total_samples(), 0);
    }

    #[test]
    fn test_stop_unresponsive_device() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        bus.set_unresponsive("/dev/ttyACM0", true);
        let err = device.stop().unwrap_err();
        assert!(matches!(err, DaqError::DeviceUnresponsive { .. }));
    }

    #[test]
    fn test_read_data_requires_running() {
        let bus = SimulatedBus::new();
        bus.add_instrument("/dev/ttyACM0", 5, 1);
        let mut device = device_on(&bus, 5, &["a"]);
        assert!(device.try_connect().unwrap());

        bus.push_packet("/dev/ttyACM0", &DataPacket::new(0, vec![1]));
        let outcome = device.read_data();
        assert_eq!(outcome.ingested, 0);
        assert!(outcome.is_complete());
    }

    #[test]
    fn test_read_data_demultiplexes_samples() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a", "b", "c"]);

        bus.push_packet("/dev/ttyACM0", &DataPacket::new(10, vec![1, 2, 3]));
        bus.push_packet("/dev/ttyACM0", &DataPacket::new(11, vec![4, 5, 6]));

        let outcome = device.read_data();
        assert!(outcome.is_complete());
        assert_eq!(outcome.ingested, 2);
        assert!(outcome.gaps.is_empty());

        let nodes = &device.info().nodes;
        assert_eq!(nodes[0].samples(), &[1, 4]);
        assert_eq!(nodes[1].samples(), &[2, 5]);
        assert_eq!(nodes[2].samples(), &[3, 6]);
        assert_eq!(device.prev_packet_id(), Some(11));
    }

    #[test]
    fn test_payload_length_mismatch_appends_nothing() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a", "b", "c"]);

        bus.push_packet("/dev/ttyACM0", &DataPacket::new(1, vec![1, 2]));
        bus.push_packet("/dev/ttyACM0", &DataPacket::new(2, vec![1, 2, 3]));

        let outcome = device.read_data();
        assert_eq!(outcome.ingested, 0);
        assert!(matches!(
            outcome.error,
            Some(DaqError::PayloadLengthMismatch {
                nodes: 3,
                samples: 2,
                ..
            })
        ));
        assert_eq!(device.info().total_samples(), 0);

        // The rest of that cycle's bytes were dropped
        assert_eq!(device.read_data().ingested, 0);
    }

    #[test]
    fn test_mismatch_keeps_packets_read_before_it() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a", "b"]);

        let mut chunk = DataPacket::new(0, vec![1, 2]).encode();
        chunk.extend(DataPacket::new(3, vec![3, 4]).encode());
        chunk.extend(DataPacket::new(4, vec![9]).encode());
        bus.inject_bytes("/dev/ttyACM0", &chunk);

        let outcome = device.read_data();
        assert_eq!(outcome.ingested, 2);
        assert_eq!(
            outcome.gaps,
            vec![PacketGap {
                expected: 1,
                received: 3
            }]
        );
        assert!(matches!(
            outcome.error,
            Some(DaqError::PayloadLengthMismatch { samples: 1, .. })
        ));
        assert_eq!(device.info().nodes[0].samples(), &[1, 3]);
        assert_eq!(device.info().nodes[1].samples(), &[2, 4]);
    }

    #[test]
    fn test_packet_gap_is_reported_and_sample_kept() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        bus.push_packet("/dev/ttyACM0", &DataPacket::new(5, vec![50]));
        bus.push_packet("/dev/ttyACM0", &DataPacket::new(8, vec![80]));

        let outcome = device.read_data();
        assert_eq!(outcome.ingested, 2);
        assert_eq!(
            outcome.gaps,
            vec![PacketGap {
                expected: 6,
                received: 8
            }]
        );
        assert_eq!(device.info().nodes[0].samples(), &[50, 80]);
    }

    #[test]
    fn test_read_data_across_split_packets() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        let bytes = DataPacket::new(0, vec![42]).encode();
        bus.inject_bytes("/dev/ttyACM0", b"noise");
        bus.inject_bytes("/dev/ttyACM0", &bytes[..7]);
        assert_eq!(device.read_data().ingested, 0);

        bus.inject_bytes("/dev/ttyACM0", &bytes[7..]);
        assert_eq!(device.read_data().ingested, 1);
        assert_eq!(device.info().nodes[0].last(), Some(42));
    }

    #[test]
    fn test_disconnect_stops_and_closes() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        device.disconnect().unwrap();
        assert!(!device.is_connected());
        assert!(!device.is_running());
        assert!(!bus.is_open("/dev/ttyACM0"));
        assert!(!bus.is_streaming("/dev/ttyACM0"));

        device.disconnect().unwrap();
    }

    #[test]
    fn test_disconnect_closes_even_when_stop_fails() {
        let bus = SimulatedBus::new();
        let mut device = running_device(&bus, &["a"]);

        bus.set_unresponsive("/dev/ttyACM0", true);
        assert!(device.disconnect().is_err());
        assert!(!device.is_connected());
        assert!(!bus.is_open("/dev/ttyACM0"));
    }

    #[test]
    fn test_device_enum() {
        let mut device = Device::Virtual(VirtualDevice::new(DeviceInfo::new(
            2,
            "replay",
            vec![Node::with_samples("a", vec![1, 2, 3])],
        )));
        assert_eq!(device.kind(), DeviceKind::Virtual);
        assert!(device.as_physical_mut().is_none());
        assert_eq!(device.snapshot().total_samples(), 3);

        device.clear();
        assert_eq!(device.info().total_samples(), 0);
        assert_eq!(device.info().nodes[0].name(), "a");
    }
}
