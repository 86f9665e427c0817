//! Session text format
//!
//! ```text
//! sampling_period,250ms
//! device,3,left
//! node,temp_a,10,11,12
//! node,temp_b,20,21,22
//! device,4,right
//! node,flow
//! ```
//!
//! A device block ends at the first line that is not a `node` line. Names
//! cannot contain commas or line breaks; [`encode`] rejects them.

use super::Session;
use crate::error::{DaqError, Result};
use crate::types::{DeviceInfo, Node};
use std::fmt::Write;

const PERIOD_TAG: &str = "sampling_period";
const DEVICE_TAG: &str = "device";
const NODE_TAG: &str = "node";

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.contains([',', '\n', '\r']) {
        return Err(DaqError::Serialization(format!(
            "{} name {:?} contains a separator",
            kind, name
        )));
    }
    Ok(())
}

/// Serialize a session
pub fn encode(session: &Session) -> Result<String> {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = writeln!(out, "{},{}ms", PERIOD_TAG, session.sampling_period_ms);

    for device in &session.devices {
        check_name("device", &device.name)?;
        let _ = writeln!(out, "{},{},{}", DEVICE_TAG, device.id, device.name);

        for node in &device.nodes {
            check_name("node", node.name())?;
            out.push_str(NODE_TAG);
            out.push(',');
            out.push_str(node.name());
            for sample in node.samples() {
                let _ = write!(out, ",{}", sample);
            }
            out.push('\n');
        }
    }

    Ok(out)
}

/// Parse a session
pub fn decode(text: &str) -> Result<Session> {
    let mut session = Session::default();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.trim_end_matches('\r');
        if content.trim().is_empty() {
            continue;
        }
        let format_error = |message: String| DaqError::SessionFormat { line, message };

        let (tag, rest) = content.split_once(',').unwrap_or((content, ""));
        match tag {
            PERIOD_TAG => {
                if !session.devices.is_empty() {
                    return Err(format_error("sampling period after device data".into()));
                }
                let digits = rest.trim().trim_end_matches("ms");
                session.sampling_period_ms = digits
                    .parse()
                    .map_err(|_| format_error(format!("invalid sampling period '{}'", rest)))?;
            }
            DEVICE_TAG => {
                let (id, name) = rest
                    .split_once(',')
                    .ok_or_else(|| format_error("device line needs an id and a name".into()))?;
                let id = id
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| format_error(format!("invalid device id '{}'", id)))?;
                session.devices.push(DeviceInfo::new(id, name, Vec::new()));
            }
            NODE_TAG => {
                if content.len() == NODE_TAG.len() {
                    return Err(format_error("node line without a name".into()));
                }
                let mut fields = rest.split(',');
                let name = fields.next().unwrap_or_default();
                let samples = fields
                    .map(|s| {
                        s.trim()
                            .parse::<u32>()
                            .map_err(|_| format_error(format!("invalid sample '{}'", s)))
                    })
                    .collect::<Result<Vec<u32>>>()?;
                let device = session
                    .devices
                    .last_mut()
                    .ok_or_else(|| format_error("node line outside a device block".into()))?;
                device.nodes.push(Node::with_samples(name, samples));
            }
            other => return Err(format_error(format!("unexpected entry '{}'", other))),
        }
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_session() -> Session {
        Session {
            sampling_period_ms: 250,
            devices: vec![
                DeviceInfo::new(
                    3,
                    "left",
                    vec![
                        Node::with_samples("temp_a", vec![10, 11, 12]),
                        Node::with_samples("temp_b", vec![20, 21, 22]),
                    ],
                ),
                DeviceInfo::new(4, "right", vec![Node::new("flow")]),
            ],
        }
    }

    #[test]
    fn test_encode_format() {
        let text = encode(&sample_session()).unwrap();
        assert_eq!(
            text,
            "sampling_period,250ms\n\
             device,3,left\n\
             node,temp_a,10,11,12\n\
             node,temp_b,20,21,22\n\
             device,4,right\n\
             node,flow\n"
        );
    }

    #[test]
    fn test_decode_sample() {
        let text = encode(&sample_session()).unwrap();
        assert_eq!(decode(&text).unwrap(), sample_session());
    }

    #[test]
    fn test_decode_crlf_and_blank_lines() {
        let session = decode("sampling_period,5ms\r\n\r\ndevice,1,a\r\nnode,x,1,2\r\n").unwrap();
        assert_eq!(session.sampling_period_ms, 5);
        assert_eq!(session.devices[0].nodes[0].samples(), &[1, 2]);
    }

    #[test]
    fn test_empty_names() {
        let session = Session {
            sampling_period_ms: 0,
            devices: vec![DeviceInfo::new(0, "", vec![Node::with_samples("", vec![7])])],
        };
        let text = encode(&session).unwrap();
        assert_eq!(decode(&text).unwrap(), session);
    }

    #[test]
    fn test_encode_rejects_separator_in_name() {
        let session = Session {
            sampling_period_ms: 0,
            devices: vec![DeviceInfo::new(1, "a,b", Vec::new())],
        };
        assert!(matches!(encode(&session), Err(DaqError::Serialization(_))));
    }

    #[test]
    fn test_decode_errors() {
        let cases = [
            ("node,x,1\n", 1),
            ("device,1,a\nnode,x,abc\n", 2),
            ("device,one,a\n", 1),
            ("device,1\n", 1),
            ("sampling_period,250ms\ndevice,1,a\nweird,1\n", 3),
            ("sampling_period,fast\n", 1),
            ("device,1,a\nnode\n", 2),
        ];
        for (text, expected_line) in cases {
            match decode(text) {
                Err(DaqError::SessionFormat { line, .. }) => {
                    assert_eq!(line, expected_line, "input {:?}", text)
                }
                other => panic!("input {:?} gave {:?}", text, other),
            }
        }
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_ .-]{0,12}"
    }

    fn device_strategy() -> impl Strategy<Value = DeviceInfo> {
        (
            -1i32..1000,
            name_strategy(),
            prop::collection::vec(
                (name_strategy(), prop::collection::vec(any::<u32>(), 0..20)),
                0..5,
            ),
        )
            .prop_map(|(id, name, nodes)| {
                let nodes = nodes
                    .into_iter()
                    .map(|(n, samples)| Node::with_samples(n, samples))
                    .collect();
                DeviceInfo::new(id, name, nodes)
            })
    }

    proptest! {
        #[test]
        fn test_round_trip(
            period in any::<u32>(),
            devices in prop::collection::vec(device_strategy(), 0..4),
        ) {
            let session = Session { sampling_period_ms: period, devices };
            let text = encode(&session).unwrap();
            prop_assert_eq!(decode(&text).unwrap(), session);
        }
    }
}
