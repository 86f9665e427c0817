//! Acquisition backend
//!
//! Everything between the serial port and the device list lives here.
//!
//! # Components
//!
//! Leaf to root:
//!
//! - [`SerialLink`] / [`SerialChannel`] - Byte-level port access and enumeration
//! - [`framer`] - Finds binary telemetry records in the receive stream
//! - [`ControlProtocol`] - Command send, echo confirmation and queries
//! - [`Device`] / [`PhysicalDevice`] - Per-instrument state machine and node buffers
//! - [`Poller`] - Background thread running the read loop
//! - [`AcquisitionController`] - Connects, starts, stops, saves and loads
//! - [`SimulatedBus`] - Emulated instruments for tests and hardware-free runs
//!
//! # Example
//!
//! ```ignore
//! use daqlink::backend::{AcquisitionController, AcquisitionEvent};
//! use daqlink::config::AppSettings;
//!
//! let (mut controller, events) = AcquisitionController::new(AppSettings::default());
//! controller.connect_to_devices()?;
//! controller.start_devices()?;
//!
//! for event in events.drain() {
//!     if let AcquisitionEvent::NewData(updates) = event {
//!         // Append the new samples to the plot
//!     }
//! }
//! ```

pub mod controller;
pub mod device;
pub mod framer;
pub mod poller;
pub mod protocol;
pub mod serial_channel;
pub mod simulator;

pub use controller::{AcquisitionController, AcquisitionEvent, EventReceiver, LinkFactory};
pub use device::{Acquire, Device, PacketGap, PhysicalDevice, ReadOutcome, VirtualDevice};
pub use framer::{DataPacket, PacketBuffer, PacketHeader};
pub use poller::Poller;
pub use protocol::{Command, ControlProtocol};
pub use serial_channel::{PortDescriptor, SerialChannel, SerialLink};
pub use simulator::{SimulatedBus, SimulatedLink};
