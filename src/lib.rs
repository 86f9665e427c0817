//! # daqlink: multi-instrument serial data acquisition
//!
//! Acquires periodic multi-channel samples from instruments on serial ports.
//! Each instrument speaks a line-based text control protocol and streams
//! binary telemetry records on the same link; daqlink finds the instruments,
//! configures and starts them, demultiplexes their records into named
//! channels and saves captured sessions as text.
//!
//! ## Architecture
//!
//! - **Backend**: serial links, telemetry framing, the control protocol, the
//!   device state machine and the [`AcquisitionController`] with its
//!   background poll thread
//! - **Config**: the device configuration grammar and the TOML application
//!   settings
//! - **Session**: the text format for saved captures
//! - **Communication**: a bounded crossbeam channel carries controller
//!   notifications to the caller
//!
//! ## Example
//!
//! ```ignore
//! use daqlink::{AcquisitionController, AcquisitionEvent, AppSettings};
//!
//! let settings = AppSettings::load_or_default(None);
//! let (mut controller, events) = AcquisitionController::new(settings);
//!
//! controller.connect_to_devices()?;
//! controller.start_devices()?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! controller.disconnect_from_devices()?;
//!
//! if let Some(path) = controller.save()? {
//!     println!("saved {}", path.display());
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use backend::{AcquisitionController, AcquisitionEvent, EventReceiver};
pub use config::{AcquisitionConfig, AppSettings, DeviceDescriptor};
pub use error::{DaqError, Result};
pub use session::Session;
pub use types::{
    AcquisitionStats, ConnectionStatus, DeviceInfo, DeviceSnapshot, DeviceUpdate, Node, NodeUpdate,
};
