//! Core data types for daqlink
//!
//! This module contains the data structures shared between the acquisition
//! backend, the session codec and external collaborators.
//!
//! # Main Types
//!
//! - [`Node`] - A named channel and its accumulated 32-bit samples
//! - [`DeviceKind`] - Whether a device is live (physical) or replayed (virtual)
//! - [`DeviceInfo`] - Identifier, name and nodes shared by every device variant
//! - [`DeviceSnapshot`] - An owned copy of one device, handed to collaborators
//! - [`DeviceUpdate`] - Samples appended to one device during a poll tick
//! - [`ConnectionStatus`] - Aggregate connection state of the controller
//! - [`AcquisitionStats`] - Counters collected by the poll loop

/// Identifier used by devices that have not been configured yet
pub const UNCONFIGURED_ID: i32 = -1;

/// A named, ordered sequence of samples belonging to one device channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    name: String,
    samples: Vec<u32>,
}

impl Node {
    /// Create an empty node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: Vec::new(),
        }
    }

    /// Create a node with existing samples
    pub fn with_samples(name: impl Into<String>, samples: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Samples in arrival order
    pub fn samples(&self) -> &[u32] {
        &self.samples
    }

    /// Append one sample
    pub fn push(&mut self, sample: u32) {
        self.samples.push(sample);
    }

    /// Append many samples
    pub fn extend_from_slice(&mut self, samples: &[u32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if no samples were collected
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples, keeping the name
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Most recent sample
    pub fn last(&self) -> Option<u32> {
        self.samples.last().copied()
    }
}

/// Whether a device feeds live data or holds replayed data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Serial-connected instrument
    Physical,
    /// Data loaded from a saved session
    Virtual,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Physical => write!(f, "Physical"),
            DeviceKind::Virtual => write!(f, "Virtual"),
        }
    }
}

/// Identity and node buffers common to every device variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Instrument identifier, [`UNCONFIGURED_ID`] when unknown
    pub id: i32,
    /// Display name
    pub name: String,
    /// Nodes in payload slot order
    pub nodes: Vec<Node>,
}

impl DeviceInfo {
    /// Create a device description
    pub fn new(id: i32, name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes,
        }
    }

    /// Create a device with empty nodes of the given names
    pub fn with_node_names<S: AsRef<str>>(id: i32, name: impl Into<String>, names: &[S]) -> Self {
        let nodes = names.iter().map(|n| Node::new(n.as_ref())).collect();
        Self::new(id, name, nodes)
    }

    /// Short label used in log messages (`ID:3 name:left`)
    pub fn label(&self) -> String {
        format!("ID:{} name:{}", self.id, self.name)
    }

    /// Whether the device has an identifier and at least one node
    pub fn is_configured(&self) -> bool {
        self.id >= 0 && !self.nodes.is_empty()
    }

    /// Drop all samples, keeping ids and node names
    pub fn clear_samples(&mut self) {
        self.nodes.iter_mut().for_each(Node::clear);
    }

    /// Total number of samples across all nodes
    pub fn total_samples(&self) -> usize {
        self.nodes.iter().map(Node::len).sum()
    }

    /// Current sample count of every node
    pub fn node_lengths(&self) -> Vec<usize> {
        self.nodes.iter().map(Node::len).collect()
    }

    /// Samples appended since the node lengths in `marks` were taken
    ///
    /// A node shorter than its mark (cleared in between) reports all of its
    /// samples from offset 0.
    pub fn update_since(&self, marks: &[usize]) -> DeviceUpdate {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mark = marks.get(i).copied().unwrap_or(0);
                let offset = if mark <= node.len() { mark } else { 0 };
                NodeUpdate {
                    name: node.name().to_string(),
                    offset,
                    samples: node.samples()[offset..].to_vec(),
                }
            })
            .collect();
        DeviceUpdate {
            id: self.id,
            name: self.name.clone(),
            nodes,
        }
    }

    /// Owned copy tagged with the device kind
    pub fn snapshot(&self, kind: DeviceKind) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind,
            nodes: self.nodes.clone(),
        }
    }
}

/// Owned copy of a device's identity and node data
///
/// Snapshots are taken under the controller's device lock, so collaborators
/// never observe a node buffer while the poll thread is appending to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Device identifier
    pub id: i32,
    /// Display name
    pub name: String,
    /// Live or replayed
    pub kind: DeviceKind,
    /// Nodes in channel order
    pub nodes: Vec<Node>,
}

impl DeviceSnapshot {
    /// Total number of samples across all nodes
    pub fn total_samples(&self) -> usize {
        self.nodes.iter().map(Node::len).sum()
    }

    /// Find a node by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }
}

/// Samples appended to one node during a poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdate {
    /// Node name
    pub name: String,
    /// Index of the first new sample within the node's full history
    pub offset: usize,
    /// The new samples
    pub samples: Vec<u32>,
}

/// Samples appended to one device during a poll tick
///
/// Carries only the tail of each node, so publishing an update costs the
/// same however long the capture has run. The full history is available
/// from the controller's snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUpdate {
    /// Device identifier
    pub id: i32,
    /// Display name
    pub name: String,
    /// Per-node tails in channel order
    pub nodes: Vec<NodeUpdate>,
}

impl DeviceUpdate {
    /// Number of new samples across all nodes
    pub fn new_samples(&self) -> usize {
        self.nodes.iter().map(|n| n.samples.len()).sum()
    }

    /// Find a node update by name
    pub fn node(&self, name: &str) -> Option<&NodeUpdate> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Aggregate connection status of the acquisition controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No devices connected
    #[default]
    Disconnected,
    /// Scanning ports and negotiating identity
    Connecting,
    /// All devices connected, not streaming
    Connected,
    /// All devices connected and streaming
    Running,
    /// The last connect attempt failed
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting..."),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Running => write!(f, "Running"),
            ConnectionStatus::Error => write!(f, "Error"),
        }
    }
}

/// Statistics about the data acquisition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Poll iterations performed while running
    pub poll_ticks: u64,
    /// Packets appended to node buffers
    pub packets_ingested: u64,
    /// Sequence discontinuities observed
    pub packet_gaps: u64,
    /// Read cycles aborted by a fatal device error
    pub read_errors: u64,
    /// Notifications dropped because the queue was full
    pub dropped_events: u64,
}
