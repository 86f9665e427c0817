//! Acquisition controller
//!
//! [`AcquisitionController`] owns the device collection and drives it: it
//! parses the configuration, connects every instrument, broadcasts start and
//! stop, runs the background poll loop and saves or loads sessions.
//!
//! Controller methods are meant to be called from one control thread. The
//! poll thread shares the device list through a mutex: it appends samples
//! under the lock and publishes owned copies, so collaborators never read a
//! node buffer while it is being written. Per-tick [`DeviceUpdate`]s carry
//! only the samples appended during that tick; [`AcquisitionController::snapshot`]
//! copies the full history on demand.
//!
//! # Notifications
//!
//! [`AcquisitionController::new`] returns an [`EventReceiver`] alongside the
//! controller. Events are queued with `try_send`; when the queue is full the
//! event is dropped and counted in [`AcquisitionStats::dropped_events`].

use crate::backend::device::{Acquire, Device, PhysicalDevice, VirtualDevice};
use crate::backend::poller::Poller;
use crate::backend::serial_channel::{SerialChannel, SerialLink};
use crate::config::{self, AcquisitionConfig, AppSettings};
use crate::error::{DaqError, Result};
use crate::session::{self, Session};
use crate::types::{AcquisitionStats, ConnectionStatus, DeviceSnapshot, DeviceUpdate};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Builds the serial link for each new physical device
pub type LinkFactory = Arc<dyn Fn() -> Box<dyn SerialLink> + Send + Sync>;

/// Notification sent to collaborators
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// Devices were created by a connect or a load
    DevicesLoaded(Vec<DeviceSnapshot>),
    /// A poll tick ingested at least one packet
    NewData(Vec<DeviceUpdate>),
    /// Sequence discontinuity on a device
    PacketGap {
        device_id: i32,
        expected: u32,
        received: u32,
    },
    /// A device's read cycle failed
    ReadError { device_id: i32, error: String },
    /// Aggregate connection status changed
    ConnectionStatus(ConnectionStatus),
}

/// Receiving end of the controller's notifications
pub struct EventReceiver {
    receiver: Receiver<AcquisitionEvent>,
}

impl EventReceiver {
    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<AcquisitionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event
    ///
    /// Returns `None` on timeout or when the controller is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AcquisitionEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Receive all pending events
    pub fn drain(&self) -> Vec<AcquisitionEvent> {
        self.receiver.try_iter().collect()
    }
}

/// State shared with the poll thread
struct Shared {
    devices: Mutex<Vec<Device>>,
    running: AtomicBool,
    stats: Mutex<AcquisitionStats>,
    events: Sender<AcquisitionEvent>,
}

impl Shared {
    fn devices(&self) -> MutexGuard<'_, Vec<Device>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, AcquisitionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: AcquisitionEvent) {
        if self.events.try_send(event).is_err() {
            self.stats().dropped_events += 1;
        }
    }

    fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.devices().iter().map(Device::snapshot).collect()
    }

    /// One iteration of the poll loop
    fn poll(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let mut ingested = 0;
        let mut gaps = Vec::new();
        let mut errors = Vec::new();
        let mut updates = Vec::new();
        {
            let mut devices = self.devices();
            for physical in devices.iter_mut().filter_map(Device::as_physical_mut) {
                let device_id = physical.info().id;
                let marks = physical.info().node_lengths();
                let outcome = physical.read_data();

                // Packets read before a fatal error are still reported
                ingested += outcome.ingested;
                gaps.extend(outcome.gaps.into_iter().map(|g| (device_id, g)));
                if let Some(e) = outcome.error {
                    tracing::error!("Read failed: {}", e);
                    errors.push((device_id, e.to_string()));
                }
                updates.push(physical.info().update_since(&marks));
            }
        }

        {
            let mut stats = self.stats();
            stats.poll_ticks += 1;
            stats.packets_ingested += ingested as u64;
            stats.packet_gaps += gaps.len() as u64;
            stats.read_errors += errors.len() as u64;
        }

        for (device_id, gap) in gaps {
            self.notify(AcquisitionEvent::PacketGap {
                device_id,
                expected: gap.expected,
                received: gap.received,
            });
        }
        for (device_id, error) in errors {
            self.notify(AcquisitionEvent::ReadError { device_id, error });
        }
        if ingested > 0 {
            self.notify(AcquisitionEvent::NewData(updates));
        }
    }
}

/// Orchestrates devices, the poll loop and session persistence
pub struct AcquisitionController {
    settings: AppSettings,
    shared: Arc<Shared>,
    link_factory: LinkFactory,
    poller: Option<Poller>,
    connected: bool,
    sampling_period_ms: u32,
}

impl AcquisitionController {
    /// Create a controller using real serial ports
    pub fn new(settings: AppSettings) -> (Self, EventReceiver) {
        let baud_rate = settings.serial.baud_rate;
        let factory: LinkFactory =
            Arc::new(move || Box::new(SerialChannel::new(baud_rate)) as Box<dyn SerialLink>);
        Self::with_link_factory(settings, factory)
    }

    /// Create a controller whose devices use links built by `factory`
    pub fn with_link_factory(settings: AppSettings, factory: LinkFactory) -> (Self, EventReceiver) {
        let (tx, rx) = bounded(settings.acquisition.event_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            devices: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stats: Mutex::new(AcquisitionStats::default()),
            events: tx,
        });

        let controller = Self {
            settings,
            shared,
            link_factory: factory,
            poller: None,
            connected: false,
            sampling_period_ms: 0,
        };
        (controller, EventReceiver { receiver: rx })
    }

    /// Application settings in use
    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Whether every configured device is connected
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the devices are streaming
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Configured sampling period in milliseconds (0 when unset)
    pub fn sampling_period(&self) -> u32 {
        self.sampling_period_ms
    }

    /// Owned copies of every device
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.shared.snapshot()
    }

    /// Counters since the last connect
    pub fn stats(&self) -> AcquisitionStats {
        self.shared.stats().clone()
    }

    /// Aggregate status derived from the connect and run flags
    pub fn status(&self) -> ConnectionStatus {
        match (self.connected, self.is_running()) {
            (true, true) => ConnectionStatus::Running,
            (true, false) => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.notify(AcquisitionEvent::ConnectionStatus(status));
    }

    /// Read the configuration file and connect to every device in it
    pub fn connect_to_devices(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let path = self.settings.acquisition.config_path.clone();
        let config = config::load_config(&path)?;
        self.connect_with_config(config)
    }

    /// Connect to the devices of an already parsed configuration
    ///
    /// Either every device connects and is configured, or every device that
    /// was opened is disconnected again and the controller is left without
    /// devices.
    pub fn connect_with_config(&mut self, config: AcquisitionConfig) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        self.reset();

        if config.devices.is_empty() {
            tracing::warn!("Configuration lists no devices");
        }

        let mut devices: Vec<PhysicalDevice> = config
            .devices
            .iter()
            .map(|descriptor| {
                PhysicalDevice::from_descriptor(
                    descriptor,
                    (self.link_factory)(),
                    self.settings.serial.clone(),
                    self.settings.device.clone(),
                )
            })
            .collect();

        let mut unreachable = Vec::new();
        for device in devices.iter_mut() {
            match device.try_connect() {
                Ok(true) => {}
                Ok(false) => unreachable.push(device.info().label()),
                Err(e) => {
                    tracing::warn!("{}", e);
                    unreachable.push(device.info().label());
                }
            }
        }

        let configured = if !unreachable.is_empty() {
            Err(DaqError::DevicesUnreachable { unreachable })
        } else {
            apply_sampling_period(&mut devices, config.sampling_period_ms)
        };

        if let Err(e) = configured {
            tracing::error!("{}", e);
            for device in devices.iter_mut() {
                if let Err(err) = device.disconnect() {
                    tracing::warn!("Rollback of device ({}) failed: {}", device.info().label(), err);
                }
            }
            self.set_status(ConnectionStatus::Error);
            return Err(e);
        }

        *self.shared.devices() = devices.into_iter().map(Device::Physical).collect();
        *self.shared.stats() = AcquisitionStats::default();
        self.shared.running.store(false, Ordering::SeqCst);
        self.sampling_period_ms = config.sampling_period_ms;
        self.connected = true;

        self.shared
            .notify(AcquisitionEvent::DevicesLoaded(self.shared.snapshot()));

        let interval = self.poll_interval();
        let shared = Arc::clone(&self.shared);
        match Poller::spawn("daqlink-poll", interval, move || shared.poll()) {
            Ok(poller) => self.poller = Some(poller),
            Err(e) => {
                let err = DaqError::Io(e).with_context("Failed to start poll thread");
                tracing::error!("{}", err);
                if let Err(disconnect_err) = self.disconnect_from_devices() {
                    tracing::warn!("{}", disconnect_err);
                }
                return Err(err);
            }
        }

        tracing::info!("Connected to {} device(s)", config.devices.len());
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        let ms = if self.sampling_period_ms > 0 {
            self.sampling_period_ms
        } else {
            self.settings.acquisition.fallback_poll_ms.max(1)
        };
        Duration::from_millis(u64::from(ms))
    }

    /// Start streaming on every device
    ///
    /// No-op when not connected or already running. If a device fails to
    /// start, the devices started so far are stopped again.
    pub fn start_devices(&mut self) -> Result<()> {
        if !self.connected || self.is_running() {
            return Ok(());
        }

        {
            let mut devices = self.shared.devices();
            let mut started = 0;
            let mut failure = None;
            for device in devices.iter_mut().filter_map(Device::as_physical_mut) {
                if let Err(e) = device.start() {
                    failure = Some(e);
                    break;
                }
                started += 1;
            }

            if let Some(e) = failure {
                tracing::error!("{}", e);
                for device in devices
                    .iter_mut()
                    .filter_map(Device::as_physical_mut)
                    .take(started)
                {
                    if let Err(err) = device.stop() {
                        tracing::warn!("{}", err);
                    }
                }
                return Err(e);
            }

            self.shared.running.store(true, Ordering::SeqCst);
        }

        tracing::info!("Acquisition started");
        self.set_status(ConnectionStatus::Running);
        Ok(())
    }

    /// Stop streaming on every device
    ///
    /// No-op when not connected or not running. Every device is asked to
    /// stop even if an earlier one fails; the first failure is returned.
    pub fn stop_devices(&mut self) -> Result<()> {
        if !self.connected || !self.is_running() {
            return Ok(());
        }

        self.shared.running.store(false, Ordering::SeqCst);
        let mut first_error = None;
        {
            let mut devices = self.shared.devices();
            for device in devices.iter_mut().filter_map(Device::as_physical_mut) {
                if let Err(e) = device.stop() {
                    tracing::error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!("Acquisition stopped");
        self.set_status(ConnectionStatus::Connected);
        first_error.map_or(Ok(()), Err)
    }

    /// Connect when disconnected and disconnect otherwise
    ///
    /// Returns the resulting connection state.
    pub fn toggle_connect(&mut self) -> Result<bool> {
        if self.connected {
            self.disconnect_from_devices()?;
        } else {
            self.connect_to_devices()?;
        }
        Ok(self.connected)
    }

    /// Start when idle and stop when running
    ///
    /// Returns the resulting run state.
    pub fn toggle_start(&mut self) -> Result<bool> {
        if self.is_running() {
            self.stop_devices()?;
        } else {
            self.start_devices()?;
        }
        Ok(self.is_running())
    }

    /// Stop, close every device and join the poll thread
    ///
    /// Devices and their samples are kept so the session can still be saved.
    pub fn disconnect_from_devices(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }

        let mut first_error = self.stop_devices().err();
        {
            let mut devices = self.shared.devices();
            for device in devices.iter_mut().filter_map(Device::as_physical_mut) {
                if let Err(e) = device.disconnect() {
                    tracing::error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.connected = false;
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }

        tracing::info!("Disconnected from devices");
        self.set_status(ConnectionStatus::Disconnected);
        first_error.map_or(Ok(()), Err)
    }

    /// Save the physical devices as a new session file
    ///
    /// Returns `Ok(None)` when there is nothing to save.
    pub fn save(&self) -> Result<Option<PathBuf>> {
        let devices: Vec<_> = self
            .shared
            .devices()
            .iter()
            .filter(|d| matches!(d, Device::Physical(_)))
            .map(|d| d.info().clone())
            .collect();

        if devices.is_empty() {
            tracing::info!("Nothing to save");
            return Ok(None);
        }

        let session = Session::new(self.sampling_period_ms, devices);
        session::save_session(&session, &self.settings.session).map(Some)
    }

    /// Replace all devices with the virtual devices of a saved session
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.connected {
            return Err(DaqError::InvalidState(
                "cannot load a session while connected".to_string(),
            ));
        }

        let session = session::load_session(path)?;
        tracing::info!("Loading data {:?}", path);

        self.reset();
        *self.shared.devices() = session
            .devices
            .into_iter()
            .map(|info| Device::Virtual(VirtualDevice::new(info)))
            .collect();
        self.sampling_period_ms = session.sampling_period_ms;

        self.shared
            .notify(AcquisitionEvent::DevicesLoaded(self.shared.snapshot()));
        Ok(())
    }

    /// Drop every sample, keeping devices and nodes
    pub fn clear(&mut self) {
        for device in self.shared.devices().iter_mut() {
            device.clear();
        }
    }

    /// Destroy every device
    ///
    /// A connected controller is disconnected first.
    pub fn reset(&mut self) {
        if self.connected {
            if let Err(e) = self.disconnect_from_devices() {
                tracing::warn!("{}", e);
            }
        }
        self.shared.devices().clear();
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect_from_devices() {
            tracing::warn!("Disconnect on shutdown failed: {}", e);
        }
    }
}

fn apply_sampling_period(devices: &mut [PhysicalDevice], period_ms: u32) -> Result<()> {
    if period_ms == 0 {
        tracing::warn!("No sampling period configured, instruments keep their own");
        return Ok(());
    }
    for device in devices.iter_mut() {
        device.set_sampling_period(period_ms)?;
    }
    Ok(())
}
