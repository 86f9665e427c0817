//! In-process instrument simulator
//!
//! [`SimulatedBus`] emulates a set of serial ports with instruments attached.
//! Each instrument speaks the control protocol (`ID_G`, `PRDS`, `STRT`, `STOP`)
//! and, while streaming, emits telemetry records at its sampling period.
//! [`SimulatedLink`] implements [`SerialLink`] on top of the bus, so devices
//! and the controller run unchanged against it.
//!
//! Test hooks allow injecting raw bytes or packets, overriding echoes and
//! making an instrument ignore commands.
//!
//! ```ignore
//! let bus = SimulatedBus::new();
//! bus.add_instrument("/dev/ttyACM0", 3, 2);
//! let link = bus.link();
//! assert!(link.connect("/dev/ttyACM0"));
//! ```

use crate::backend::framer::DataPacket;
use crate::backend::serial_channel::{PortDescriptor, SerialLink, DEFAULT_TIMEOUT};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Description advertised by simulated instrument ports
pub const SIMULATED_DESCRIPTION: &str = "STMicroelectronics Virtual COM Port (simulated)";

/// Telemetry period used before `PRDS` is received
const DEFAULT_PERIOD_MS: u32 = 100;

/// Upper bound of records emitted in one catch-up step
const MAX_CATCH_UP_PACKETS: u32 = 1000;

/// Poll interval of a blocking `read_line`
const LINE_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Instrument {
    description: String,
    id: i32,
    node_count: usize,
    period_ms: Option<u32>,
    streaming: bool,
    auto_telemetry: bool,
    unresponsive: bool,
    echo_overrides: HashMap<String, String>,
    next_packet_id: u32,
    last_emit: Instant,
    open: bool,
    rx: VecDeque<u8>,
    pending_command: Vec<u8>,
    received: Vec<String>,
}

impl Instrument {
    fn new(description: &str, id: i32, node_count: usize) -> Self {
        Self {
            description: description.to_string(),
            id,
            node_count,
            period_ms: None,
            streaming: false,
            auto_telemetry: true,
            unresponsive: false,
            echo_overrides: HashMap::new(),
            next_packet_id: 0,
            last_emit: Instant::now(),
            open: false,
            rx: VecDeque::new(),
            pending_command: Vec::new(),
            received: Vec::new(),
        }
    }

    fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_ms.unwrap_or(DEFAULT_PERIOD_MS).max(1)))
    }

    /// Emit the records that are due since the last emission
    fn pump(&mut self) {
        if !self.streaming || !self.auto_telemetry {
            return;
        }
        let period = self.period();
        let mut emitted = 0;
        while self.last_emit.elapsed() >= period && emitted < MAX_CATCH_UP_PACKETS {
            self.last_emit += period;
            let packet = self.next_packet();
            self.rx.extend(packet.encode());
            emitted += 1;
        }
        if emitted == MAX_CATCH_UP_PACKETS {
            self.last_emit = Instant::now();
        }
    }

    fn next_packet(&mut self) -> DataPacket {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        let payload = (0..self.node_count as u32)
            .map(|slot| (id.wrapping_mul(slot + 1)) % 4096)
            .collect();
        DataPacket::new(id, payload)
    }

    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending_command)
                    .trim()
                    .to_string();
                self.pending_command.clear();
                if !line.is_empty() {
                    self.handle_command(&line);
                }
            } else {
                self.pending_command.push(byte);
            }
        }
    }

    fn handle_command(&mut self, line: &str) {
        self.received.push(line.to_string());
        if self.unresponsive {
            return;
        }

        // Records due before the command arrive ahead of its reply
        self.pump();

        let mut fields = line.split(',');
        let name = fields.next().unwrap_or_default().to_string();
        let reply = match name.as_str() {
            "ID_G" => Some(format!("ID_G,{}", self.id)),
            "PRDS" => {
                if let Some(period) = fields.next().and_then(|f| f.trim().parse().ok()) {
                    self.period_ms = Some(period);
                }
                Some(line.to_string())
            }
            "STRT" => {
                self.streaming = true;
                self.last_emit = Instant::now();
                Some(line.to_string())
            }
            "STOP" => {
                self.streaming = false;
                Some(line.to_string())
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let reply = self.echo_overrides.get(&name).cloned().unwrap_or(reply);
            self.rx.extend(reply.as_bytes());
            self.rx.extend(b"\r\n");
        }
    }
}

#[derive(Default)]
struct BusState {
    ports: BTreeMap<String, Instrument>,
}

/// A set of simulated serial ports
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_instrument<R>(&self, port: &str, f: impl FnOnce(&mut Instrument) -> R) -> Option<R> {
        self.lock().ports.get_mut(port).map(f)
    }

    /// Attach an instrument with `node_count` channels to `port`
    pub fn add_instrument(&self, port: &str, id: i32, node_count: usize) {
        self.add_port(port, SIMULATED_DESCRIPTION, id, node_count);
    }

    /// Attach an instrument advertising a custom port description
    pub fn add_port(&self, port: &str, description: &str, id: i32, node_count: usize) {
        self.lock()
            .ports
            .insert(port.to_string(), Instrument::new(description, id, node_count));
    }

    /// Create a link attached to this bus
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink::new(self.clone())
    }

    /// Enable or disable periodic telemetry generation
    pub fn set_auto_telemetry(&self, port: &str, enabled: bool) {
        self.with_instrument(port, |i| i.auto_telemetry = enabled);
    }

    /// Make the instrument ignore every command
    pub fn set_unresponsive(&self, port: &str, unresponsive: bool) {
        self.with_instrument(port, |i| i.unresponsive = unresponsive);
    }

    /// Reply with `reply` instead of the normal answer to `command`
    pub fn set_echo_override(&self, port: &str, command: &str, reply: &str) {
        self.with_instrument(port, |i| {
            i.echo_overrides
                .insert(command.to_string(), reply.to_string())
        });
    }

    /// Queue an encoded packet for the host
    pub fn push_packet(&self, port: &str, packet: &DataPacket) {
        self.inject_bytes(port, &packet.encode());
    }

    /// Queue raw bytes for the host
    pub fn inject_bytes(&self, port: &str, bytes: &[u8]) {
        self.with_instrument(port, |i| i.rx.extend(bytes));
    }

    /// Commands received so far, without line terminators
    pub fn received_commands(&self, port: &str) -> Vec<String> {
        self.with_instrument(port, |i| i.received.clone())
            .unwrap_or_default()
    }

    /// Period set by the last `PRDS`
    pub fn sampling_period(&self, port: &str) -> Option<u32> {
        self.with_instrument(port, |i| i.period_ms).flatten()
    }

    /// Whether the instrument is streaming
    pub fn is_streaming(&self, port: &str) -> bool {
        self.with_instrument(port, |i| i.streaming)
            .unwrap_or(false)
    }

    /// Whether a link holds the port open
    pub fn is_open(&self, port: &str) -> bool {
        self.with_instrument(port, |i| i.open).unwrap_or(false)
    }

    fn open(&self, port: &str) -> bool {
        self.with_instrument(port, |i| {
            if i.open {
                false
            } else {
                i.open = true;
                i.rx.clear();
                i.pending_command.clear();
                true
            }
        })
        .unwrap_or(false)
    }

    fn close(&self, port: &str) {
        self.with_instrument(port, |i| i.open = false);
    }

    fn descriptors(&self) -> Vec<PortDescriptor> {
        self.lock()
            .ports
            .iter()
            .map(|(port, i)| PortDescriptor {
                port: port.clone(),
                description: i.description.clone(),
                hardware_id: format!("SIM ID={}", i.id),
            })
            .collect()
    }

    fn free_ports(&self) -> Vec<String> {
        self.lock()
            .ports
            .iter()
            .filter(|(_, i)| !i.open)
            .map(|(port, _)| port.clone())
            .collect()
    }
}

impl std::fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ports: Vec<String> = self.lock().ports.keys().cloned().collect();
        f.debug_struct("SimulatedBus").field("ports", &ports).finish()
    }
}

struct LinkState {
    port: Option<String>,
    timeout: Duration,
}

/// [`SerialLink`] over a [`SimulatedBus`]
pub struct SimulatedLink {
    bus: SimulatedBus,
    state: Mutex<LinkState>,
}

impl SimulatedLink {
    fn new(bus: SimulatedBus) -> Self {
        Self {
            bus,
            state: Mutex::new(LinkState {
                port: None,
                timeout: DEFAULT_TIMEOUT,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_port(&self) -> Option<String> {
        self.lock().port.clone()
    }

    fn with_port<R>(&self, f: impl FnOnce(&mut Instrument) -> R) -> Option<R> {
        let port = self.open_port()?;
        self.bus.with_instrument(&port, |i| {
            i.pump();
            f(i)
        })
    }

    /// Take a complete line from the receive queue if one is buffered
    fn take_line(&self) -> Option<String> {
        self.with_port(|i| {
            let end = i.rx.iter().position(|&b| b == b'\n')?;
            let bytes: Vec<u8> = i.rx.drain(..=end).collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        })
        .flatten()
    }
}

impl SerialLink for SimulatedLink {
    fn connect(&self, port: &str) -> bool {
        let mut state = self.lock();
        if state.port.is_some() || !self.bus.open(port) {
            return false;
        }
        tracing::debug!("Opened simulated port {}", port);
        state.port = Some(port.to_string());
        true
    }

    fn disconnect(&self) {
        if let Some(port) = self.lock().port.take() {
            self.bus.close(&port);
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().port.is_some()
    }

    fn port_name(&self) -> Option<String> {
        self.open_port()
    }

    fn write(&self, data: &[u8]) -> usize {
        self.with_port(|i| {
            i.receive(data);
            data.len()
        })
        .unwrap_or(0)
    }

    fn read(&self, count: usize) -> Vec<u8> {
        self.with_port(|i| {
            let n = count.min(i.rx.len());
            i.rx.drain(..n).collect()
        })
        .unwrap_or_default()
    }

    fn read_line(&self) -> String {
        if !self.is_connected() {
            return String::new();
        }
        let deadline = Instant::now() + self.lock().timeout;
        loop {
            if let Some(line) = self.take_line() {
                return line;
            }
            if Instant::now() >= deadline {
                // Partial line on timeout, like a real port
                return self
                    .with_port(|i| {
                        let bytes: Vec<u8> = i.rx.drain(..).collect();
                        String::from_utf8_lossy(&bytes).into_owned()
                    })
                    .unwrap_or_default();
            }
            std::thread::sleep(LINE_POLL_INTERVAL);
        }
    }

    fn bytes_available(&self) -> usize {
        self.with_port(|i| i.rx.len()).unwrap_or(0)
    }

    fn flush(&self) {}

    fn purge(&self) {
        self.with_port(|i| i.rx.clear());
    }

    fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    fn list_all_ports(&self) -> Vec<PortDescriptor> {
        self.bus.descriptors()
    }

    fn list_free_ports(&self) -> Vec<String> {
        self.bus.free_ports()
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
