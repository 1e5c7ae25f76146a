//! HL7 v2.5.1 ER7 parsing and building primitives.
//!
//! Only the segment-level surface the bridge needs: CR-delimited segments,
//! `|` fields with positions preserved, MSH/MSA accessors and the builders
//! for the LAB-27/28/29 message heads.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::protocol::error::{ProtocolError, Result};

pub const HL7_VERSION: &str = "2.5.1";

/// MSH-3/4 identity of the analyzer side.
pub const ANALYZER_APPLICATION: &str = "Sysmex";
pub const ANALYZER_FACILITY: &str = "Analyzer";

/// MSH-5/6 identity of the LIS side.
pub const LIS_APPLICATION: &str = "LabBook";
pub const LIS_FACILITY: &str = "LIS";

pub const HL7_FIELD_SEPARATOR: char = '|';
pub const HL7_COMPONENT_SEPARATOR: char = '^';
pub const HL7_SUBCOMPONENT_SEPARATOR: char = '&';
pub const HL7_SEGMENT_SEPARATOR: char = '\r';

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7Segment {
    pub segment_type: String,
    pub fields: Vec<String>,
}

impl Hl7Segment {
    /// Field by position; `fields[0]` is the segment name itself, so for a
    /// non-MSH segment `field(2)` is the segment's second data field.
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }

    /// First `^`-component of a field.
    pub fn component(&self, field: usize, component: usize) -> &str {
        self.field(field)
            .split(HL7_COMPONENT_SEPARATOR)
            .nth(component)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7Message {
    pub message_type: String,
    pub message_control_id: String,
    pub segments: Vec<Hl7Segment>,
    pub raw_message: String,
}

impl Hl7Message {
    pub fn first_segment(&self, segment_type: &str) -> Option<&Hl7Segment> {
        self.segments
            .iter()
            .find(|s| s.segment_type == segment_type)
    }

    /// MSA-1 acknowledgment code, if the message carries an MSA segment.
    pub fn ack_code(&self) -> Option<&str> {
        self.first_segment("MSA").map(|msa| msa.field(1))
    }
}

/// Parse an ER7 message (CR-delimited segments, `|` fields).
pub fn parse_message(text: &str) -> Result<Hl7Message> {
    let text = text.trim_start_matches(['\u{0b}', '\n']).trim_end();
    if text.is_empty() {
        return Err(ProtocolError::InvalidHl7("empty message".to_string()));
    }

    let mut segments = Vec::new();
    for line in text.split(['\r', '\n']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        segments.push(parse_segment(line)?);
    }

    let (message_type, message_control_id) = {
        let msh = segments
            .first()
            .filter(|s| s.segment_type == "MSH")
            .ok_or_else(|| {
                ProtocolError::InvalidHl7("first segment must be MSH".to_string())
            })?;
        (msh.field(8).to_string(), msh.field(9).to_string())
    };

    Ok(Hl7Message {
        message_type,
        message_control_id,
        segments,
        raw_message: text.to_string(),
    })
}

pub fn parse_segment(line: &str) -> Result<Hl7Segment> {
    if line.len() < 3 {
        return Err(ProtocolError::InvalidHl7(format!(
            "segment too short: {:?}",
            line
        )));
    }

    let fields: Vec<String> = line
        .split(HL7_FIELD_SEPARATOR)
        .map(|s| s.to_string())
        .collect();

    Ok(Hl7Segment {
        segment_type: line[0..3].to_string(),
        fields,
    })
}

/// Fresh MSH-10 control id: MSG followed by epoch milliseconds.
pub fn next_control_id() -> String {
    format!("MSG{}", Utc::now().timestamp_millis())
}

/// Current MSH-7 timestamp (`YYYYMMDDhhmmss`).
pub fn message_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Build an MSH segment with explicit endpoints and a fresh control id.
/// Returns the segment and the control id it embeds.
pub fn build_msh(
    sending_app: &str,
    sending_facility: &str,
    receiving_app: &str,
    receiving_facility: &str,
    message_type: &str,
) -> (String, String) {
    let control_id = next_control_id();
    let msh = format!(
        "MSH|^~\\&|{}|{}|{}|{}|{}||{}|{}|P|{}",
        sending_app,
        sending_facility,
        receiving_app,
        receiving_facility,
        message_timestamp(),
        message_type,
        control_id,
        HL7_VERSION
    );
    (msh, control_id)
}

/// Build an ACK^R22 answering `original`, swapping the sending and
/// receiving applications and echoing MSH-10 into MSA-2.
pub fn build_ack_r22(original: &Hl7Message, ack_code: &str) -> String {
    let msh_in = original.first_segment("MSH");
    let (sending_app, sending_fac, receiving_app, receiving_fac) = match msh_in {
        Some(msh) => (
            or_default(msh.field(4), ANALYZER_APPLICATION),
            or_default(msh.field(5), ANALYZER_FACILITY),
            or_default(msh.field(2), LIS_APPLICATION),
            or_default(msh.field(3), LIS_FACILITY),
        ),
        None => (
            ANALYZER_APPLICATION,
            ANALYZER_FACILITY,
            LIS_APPLICATION,
            LIS_FACILITY,
        ),
    };

    let (msh, _) = build_msh(
        sending_app,
        sending_fac,
        receiving_app,
        receiving_fac,
        "ACK^R22",
    );
    format!(
        "{}\rMSA|{}|{}",
        msh, ack_code, original.message_control_id
    )
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}
