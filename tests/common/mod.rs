//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use daqlink::backend::{SerialLink, SimulatedBus};
use daqlink::config::{DeviceSettings, SerialSettings};
use daqlink::{AcquisitionController, AcquisitionEvent, AppSettings, EventReceiver};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for waiting on controller events
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Settings with short command and drain timeouts, saving into `dir`
pub fn fast_settings(dir: &Path) -> AppSettings {
    let mut settings = AppSettings {
        serial: SerialSettings {
            command_timeout_ms: 50,
            ..SerialSettings::default()
        },
        device: DeviceSettings {
            stop_timeout_ms: 100,
            drain_timeout_ms: 200,
            drain_interval_ms: 1,
        },
        ..AppSettings::default()
    };
    settings.session.save_dir = dir.to_path_buf();
    settings.acquisition.config_path = dir.join("config.txt");
    settings
}

/// Controller whose devices talk to `bus`
pub fn controller_on(bus: &SimulatedBus, settings: AppSettings) -> (AcquisitionController, EventReceiver) {
    let bus = bus.clone();
    AcquisitionController::with_link_factory(
        settings,
        Arc::new(move || Box::new(bus.link()) as Box<dyn SerialLink>),
    )
}

/// Builder for device configuration text
#[derive(Default)]
pub struct ConfigText {
    lines: Vec<String>,
}

impl ConfigText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn period(mut self, period: &str) -> Self {
        self.lines.push(format!("sampling_period {}", period));
        self
    }

    pub fn device(mut self, name: &str, id: i32, nodes: &[&str]) -> Self {
        self.lines.push(format!("device {}", name));
        self.lines.push(format!("id {}", id));
        self.lines.push(format!("nodes {}", nodes.join(" ")));
        self
    }

    pub fn line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    /// Write the configuration to `path`
    pub fn write_to(&self, path: &Path) {
        std::fs::write(path, self.build()).unwrap();
    }
}

/// Wait for the first event accepted by `pick`
pub fn wait_for<T>(
    events: &EventReceiver,
    mut pick: impl FnMut(AcquisitionEvent) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + test_timeout();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if let Some(found) = events.recv_timeout(remaining).and_then(&mut pick) {
            return Some(found);
        }
    }
    None
}

/// Block until the controller has ingested at least `count` packets
pub fn wait_for_packets(controller: &AcquisitionController, count: u64) {
    let deadline = Instant::now() + test_timeout();
    while controller.stats().packets_ingested < count {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} packets, got {}",
            count,
            controller.stats().packets_ingested
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}
