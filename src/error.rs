//! Error handling for daqlink
//!
//! This module defines the error taxonomy shared by the serial channel, the
//! control protocol, devices and the acquisition controller, together with a
//! Result alias used throughout the crate.
//!
//! Some variants describe conditions that are recovered from locally (a bad
//! configuration line, a port that cannot be opened, a wrong device on a port,
//! a sequence gap). They still have a variant so that they can be logged and
//! reported uniformly.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for daqlink operations
#[derive(Error, Debug)]
pub enum DaqError {
    /// A configuration line could not be applied
    #[error("Configuration error on line {line}: {message}")]
    Config { line: usize, message: String },

    /// Application settings could not be loaded or saved
    #[error("Settings error: {0}")]
    Settings(String),

    /// A serial port could not be opened
    #[error("Connection error on {port}: {message}")]
    Connection { port: String, message: String },

    /// The instrument on a port reported a different identifier
    #[error("Identity mismatch on {port}: expected id {expected}, received '{received}'")]
    IdentityMismatch {
        port: String,
        expected: i32,
        received: String,
    },

    /// Device is missing its identifier or node list
    #[error("Device '{name}' is not configured (id {id}, {nodes} nodes)")]
    NotConfigured { name: String, id: i32, nodes: usize },

    /// Echoed command name differs from the one sent
    #[error("Transmission of '{command}' failed: command name mismatch, expected '{expected}' received '{received}'")]
    ProtocolMismatch {
        command: String,
        expected: String,
        received: String,
    },

    /// Echo carries a different number of arguments
    #[error("Transmission of '{command}' failed: argument count mismatch, expected {expected} received {received}")]
    ArgumentCountMismatch {
        command: String,
        expected: usize,
        received: usize,
    },

    /// Echoed argument differs beyond the accepted tolerance
    #[error("Transmission of '{command}' failed: argument {index} mismatch, expected '{expected}' received '{received}'")]
    ArgumentValueMismatch {
        command: String,
        index: usize,
        expected: String,
        received: String,
    },

    /// Device did not answer the stop handshake in time
    #[error("Device {device} is unresponsive: {message}")]
    DeviceUnresponsive { device: String, message: String },

    /// Telemetry payload does not match the configured node count
    #[error("Payload length mismatch on device {device}: {nodes} nodes configured, packet carries {samples} samples")]
    PayloadLengthMismatch {
        device: String,
        nodes: usize,
        samples: usize,
    },

    /// Discontinuity in packet sequence ids
    #[error("Packet gap on device {device}: expected id {expected}, received {received}")]
    PacketGap {
        device: String,
        expected: u32,
        received: u32,
    },

    /// Not every configured device could be found
    #[error("Could not connect to all devices, unreachable: {}", unreachable.join(", "))]
    DevicesUnreachable { unreachable: Vec<String> },

    /// Errors raised by the serial port driver
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted session could not be parsed
    #[error("Session format error on line {line}: {message}")]
    SessionFormat { line: usize, message: String },

    /// A saved file does not have the expected length when read back
    #[error("Write verification failed for {path:?}: wrote {actual} bytes, expected {expected}")]
    WriteVerification {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Operation not allowed in the current controller state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<DaqError>,
    },
}

impl DaqError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        DaqError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error is one of the confirm handshake failures
    pub fn is_handshake_failure(&self) -> bool {
        match self {
            DaqError::ProtocolMismatch { .. }
            | DaqError::ArgumentCountMismatch { .. }
            | DaqError::ArgumentValueMismatch { .. } => true,
            DaqError::WithContext { source, .. } => source.is_handshake_failure(),
            _ => false,
        }
    }

    /// Innermost error, skipping context wrappers
    pub fn root(&self) -> &DaqError {
        match self {
            DaqError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for daqlink operations
pub type Result<T> = std::result::Result<T, DaqError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| DaqError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DaqError::Io(e).with_context(f()))
    }
}
