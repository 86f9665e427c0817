//! Device configuration
//!
//! The configuration file describes which instruments to connect to and how
//! often they sample. It is line oriented; `#` starts a comment and tokens are
//! separated by spaces, commas or tabs. The first token of a line is the
//! command (case-insensitive):
//!
//! ```text
//! # one second between samples
//! sampling_period 1
//!
//! device left_bench
//! id 3
//! nodes temp_a, temp_b, pressure
//!
//! device right_bench
//! id 4
//! nodes flow
//! ```
//!
//! `sampling_period` takes seconds unless the value carries an `ms` suffix.
//! Lines that cannot be applied are logged and skipped.
//!
//! Application-level tunables live in [`settings`].

pub mod settings;

pub use settings::{
    AcquisitionSettings, AppSettings, DeviceSettings, SerialSettings, SessionSettings,
};

use crate::error::{DaqError, Result, ResultExt};
use crate::types::UNCONFIGURED_ID;
use std::path::Path;

/// Token separators of the configuration grammar
pub const CONFIG_DELIMITERS: &[char] = &[' ', ',', '\t'];

/// One `device` block of the configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Display name, empty when the `device` line has no argument
    pub name: String,
    /// Instrument identifier, [`UNCONFIGURED_ID`] until an `id` line is seen
    pub id: i32,
    /// Channel names in payload order
    pub nodes: Vec<String>,
}

impl DeviceDescriptor {
    /// Start a descriptor with no id and no nodes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: UNCONFIGURED_ID,
            nodes: Vec::new(),
        }
    }

    /// Whether the descriptor carries both an id and at least one node
    pub fn is_configured(&self) -> bool {
        self.id >= 0 && !self.nodes.is_empty()
    }
}

/// Parsed configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Global sampling period in milliseconds, 0 when not set
    pub sampling_period_ms: u32,
    /// Devices in file order
    pub devices: Vec<DeviceDescriptor>,
}

/// Read and parse a configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<AcquisitionConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {:?}", path))?;
    Ok(parse_config(&text))
}

/// Parse configuration text
///
/// Never fails as a whole: every line that cannot be applied is reported with
/// `warn!` and skipped.
pub fn parse_config(text: &str) -> AcquisitionConfig {
    let mut config = AcquisitionConfig::default();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split('#').next().unwrap_or_default();
        let tokens: Vec<&str> = content
            .split(CONFIG_DELIMITERS)
            .filter(|t| !t.is_empty())
            .collect();
        let Some((command, args)) = tokens.split_first() else {
            continue;
        };

        if let Err(e) = apply_line(&mut config, line, &command.to_lowercase(), args) {
            tracing::warn!("{}", e);
        }
    }

    tracing::debug!(
        "Parsed configuration: period {} ms, {} device(s)",
        config.sampling_period_ms,
        config.devices.len()
    );
    config
}

fn apply_line(
    config: &mut AcquisitionConfig,
    line: usize,
    command: &str,
    args: &[&str],
) -> Result<()> {
    let error = |message: String| DaqError::Config { line, message };

    match command {
        "sampling_period" | "sample_period" => {
            let period = parse_period(args).ok_or_else(|| {
                error(format!("invalid sampling period '{}'", args.join(" ")))
            })?;
            config.sampling_period_ms = period;
        }
        "device" => {
            let name = args.first().copied().unwrap_or_default();
            config.devices.push(DeviceDescriptor::new(name));
        }
        "id" => {
            let value = args
                .first()
                .ok_or_else(|| error("missing device id".to_string()))?;
            let id = value
                .parse::<i32>()
                .map_err(|_| error(format!("invalid device id '{}'", value)))?;
            let device = config
                .devices
                .last_mut()
                .ok_or_else(|| error("'id' before any 'device' line".to_string()))?;
            device.id = id;
        }
        "nodes" => {
            if args.is_empty() {
                return Err(error("'nodes' without node names".to_string()));
            }
            let device = config
                .devices
                .last_mut()
                .ok_or_else(|| error("'nodes' before any 'device' line".to_string()))?;
            device.nodes.extend(args.iter().map(|s| s.to_string()));
        }
        other => return Err(error(format!("unknown command '{}'", other))),
    }

    Ok(())
}

/// Parse `5`, `250ms` or `250 ms` into milliseconds
fn parse_period(args: &[&str]) -> Option<u32> {
    let first = args.first()?.to_lowercase();
    let (digits, millis) = match first.strip_suffix("ms") {
        Some(digits) => (digits.to_string(), true),
        None => {
            let unit_ms = args.get(1).is_some_and(|u| u.eq_ignore_ascii_case("ms"));
            (first, unit_ms)
        }
    };
    let value: u32 = digits.parse().ok()?;
    if millis {
        Some(value)
    } else {
        value.checked_mul(1000)
    }
}
