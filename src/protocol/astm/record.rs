use crate::protocol::astm::constants::{
    COMMENT_RECORD, FIELD_DELIMITER, HEADER_RECORD, ORDER_RECORD, PATIENT_RECORD,
    REQUEST_RECORD, RESULT_RECORD, TERMINATOR_RECORD,
};
use crate::protocol::error::{ProtocolError, Result};

/// Record types of the ASTM E1394-97 grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Header,
    Patient,
    Order,
    Result,
    Comment,
    Request,
    Terminator,
}

impl RecordType {
    pub fn from_identifier(id: char) -> Option<Self> {
        match id {
            'H' => Some(RecordType::Header),
            'P' => Some(RecordType::Patient),
            'O' => Some(RecordType::Order),
            'R' => Some(RecordType::Result),
            'C' => Some(RecordType::Comment),
            'Q' => Some(RecordType::Request),
            'L' => Some(RecordType::Terminator),
            _ => None,
        }
    }

    pub fn to_identifier(&self) -> &'static str {
        match self {
            RecordType::Header => HEADER_RECORD,
            RecordType::Patient => PATIENT_RECORD,
            RecordType::Order => ORDER_RECORD,
            RecordType::Result => RESULT_RECORD,
            RecordType::Comment => COMMENT_RECORD,
            RecordType::Request => REQUEST_RECORD,
            RecordType::Terminator => TERMINATOR_RECORD,
        }
    }
}

/// One parsed ASTM record.
///
/// `fields[0]` is the record-type letter itself; trailing empty fields are
/// preserved, since Sysmex O-record parsing depends on exact indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub record_type: RecordType,
    pub fields: Vec<String>,
}

impl Record {
    /// Parse one record line. A single leading digit 0-7 (the Sysmex frame
    /// number some XP firmwares prepend) is stripped when it is followed by
    /// a record-type letter and a field delimiter.
    pub fn parse(line: &str) -> Result<Self> {
        let line = strip_frame_prefix(line);
        if line.is_empty() {
            return Err(ProtocolError::InvalidRecordFormat(
                "empty record".to_string(),
            ));
        }

        let type_char = line.chars().next().unwrap_or('\0');
        let record_type = RecordType::from_identifier(type_char).ok_or_else(|| {
            ProtocolError::InvalidRecordFormat(format!("unknown record type: {}", type_char))
        })?;

        let fields: Vec<String> = line
            .split(FIELD_DELIMITER as char)
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            record_type,
            fields,
        })
    }

    /// Field by index; out-of-range and missing map to "".
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn encode(&self) -> String {
        self.fields.join("|")
    }
}

/// Strip a single leading record-number digit (`1H|..` -> `H|..`).
pub fn strip_frame_prefix(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_digit()
        && bytes[0] <= b'7'
        && RecordType::from_identifier(bytes[1] as char).is_some()
        && bytes[2] == FIELD_DELIMITER
    {
        &line[1..]
    } else {
        line
    }
}

/// Split an assembled link-layer message into records.
///
/// The message is CR-delimited; stray LF from CR LF pairs is dropped and
/// unparseable lines are skipped with a log entry rather than failing the
/// whole transmission.
pub fn split_message(message: &str) -> Vec<Record> {
    message
        .replace("\r\n", "\r")
        .split('\r')
        .map(|line| line.trim_end_matches('\n'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match Record::parse(line) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping unparseable ASTM record {:?}: {}", line, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_trailing_empty_fields() {
        let record = Record::parse("O|1||^^          20359^A|^^^^WBC|||||||N||").unwrap();
        assert_eq!(record.record_type, RecordType::Order);
        assert_eq!(record.fields.len(), 14);
        assert_eq!(record.field(3), "^^          20359^A");
        assert_eq!(record.field(11), "N");
        assert_eq!(record.field(13), "");
    }

    #[test]
    fn test_frame_number_prefix_stripped() {
        let record = Record::parse("2P|1").unwrap();
        assert_eq!(record.record_type, RecordType::Patient);
        assert_eq!(record.field(0), "P");

        // No prefix is equally fine
        let record = Record::parse("P|1").unwrap();
        assert_eq!(record.record_type, RecordType::Patient);
    }

    #[test]
    fn test_prefix_only_stripped_when_it_shadows_a_record() {
        // 8 and 9 are not frame numbers
        assert!(Record::parse("8H|x").is_err());
        // digit not followed by delimiter stays untouched
        assert!(Record::parse("1HX").is_err());
    }

    #[test]
    fn test_field_out_of_range_is_empty() {
        let record = Record::parse("L|1|N").unwrap();
        assert_eq!(record.field(2), "N");
        assert_eq!(record.field(10), "");
    }

    #[test]
    fn test_split_message() {
        let msg = "H|\\^&|||Sysmex\rP|1\rO|1||^^20359^A\rL|1|N";
        let records = split_message(msg);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].record_type, RecordType::Header);
        assert_eq!(records[3].record_type, RecordType::Terminator);
    }

    #[test]
    fn test_split_message_normalizes_crlf_and_prefixes() {
        let msg = "1H|\\^&\r\n2P|1\r\n3R|1|^^^^WBC^26|6.42|10*3/uL||N\r\n4L|1|N\r\n";
        let records = split_message(msg);
        assert_eq!(records.len(), 4);
        assert_eq!(records[2].record_type, RecordType::Result);
        assert_eq!(records[2].field(3), "6.42");
    }

    #[test]
    fn test_encode_round_trip() {
        let line = "R|1|^^^^WBC^26|6.42|10*3/uL||N";
        let record = Record::parse(line).unwrap();
        assert_eq!(record.encode(), line);
    }
}
