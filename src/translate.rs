//! ASTM <-> HL7 translation for the three IHE LAB transactions.
//!
//! LAB-29: analyzer results (H/P/O/R/C/L records) -> OUL^R22, and the LIS
//! ACK back to the analyzer's `L|1|Y` / `L|1|N` terminator.
//! LAB-27: analyzer worklist query (Q record) -> QBP^Q11, and RSP^K11 back
//! to the four-record H/P/O/L worklist block.
//! LAB-28: OML^O33 order -> the same worklist block for download.

use crate::mapping::{process_result_value, MappingTable};
use crate::protocol::astm::{Record, RecordType};
use crate::protocol::hl7::{
    self, Hl7Message, ANALYZER_APPLICATION, ANALYZER_FACILITY, LIS_APPLICATION,
    LIS_FACILITY,
};

/// Width the XP family expects for the sample id in an O record.
const SAMPLE_ID_WIDTH: usize = 15;

/// Test battery downloaded with every worklist entry.
const WORKLIST_BATTERY: &str = "^^^^WBC\\^^^^RBC\\^^^^HGB\\^^^^HCT\\^^^^PLT";

/// Specimen id carried by an O record.
///
/// Sysmex puts the id in O-3 as `^^<padded id>^<type>`; older firmwares
/// leave it bare in O-2. Whitespace padding is stripped either way.
pub fn order_specimen_id(order: &Record) -> String {
    let field3 = order.field(3);
    if let Some(rest) = field3.strip_prefix("^^") {
        let component = rest.split('^').next().unwrap_or("");
        return component.trim().to_string();
    }
    order.field(2).trim().to_string()
}

/// Specimen id of the first Q record, from the first non-empty component
/// of Q-2.
pub fn query_specimen_id(query: &Record) -> String {
    query
        .field(2)
        .split('^')
        .map(str::trim)
        .find(|c| !c.is_empty())
        .unwrap_or("")
        .to_string()
}

/// LAB-29: build an OUL^R22 from parsed analyzer records.
pub fn results_to_oul_r22(records: &[Record], mapping: &MappingTable) -> String {
    let (msh, _) = hl7::build_msh(
        ANALYZER_APPLICATION,
        ANALYZER_FACILITY,
        LIS_APPLICATION,
        LIS_FACILITY,
        "OUL^R22",
    );

    let mut segments = vec![msh];
    let mut obx_index = 0u32;

    for record in records {
        match record.record_type {
            RecordType::Patient => {
                segments.push(format!("PID|||{}||", record.field(2)));
            }
            RecordType::Order => {
                let sid = order_specimen_id(record);
                segments.push(format!("SPM|1|{}", sid));
                segments.push(format!("ORC|RE|{}", sid));
                segments.push(format!("OBR|1|{}||{}", sid, record.field(4)));
            }
            RecordType::Result => {
                obx_index += 1;
                segments.push(result_to_obx(record, obx_index, mapping));
            }
            RecordType::Comment => {
                let text = record
                    .fields
                    .get(2..)
                    .unwrap_or(&[])
                    .join(" ")
                    .trim_end()
                    .to_string();
                segments.push(format!("NTE|1|L|{}", text));
            }
            // H, L and anything unexpected carry no OUL content
            _ => {}
        }
    }

    segments.join("\r")
}

fn result_to_obx(record: &Record, index: u32, mapping: &MappingTable) -> String {
    let vendor_code = record.field(2);
    let row = mapping.lookup(vendor_code);

    let observation_id = row
        .map(|r| r.lis_result_code.as_str())
        .filter(|code| !code.is_empty())
        .unwrap_or(vendor_code);

    // A trailing unit in the raw value is always the analyzer's own;
    // the mapping override only changes what OBX-6 reports.
    let native_unit = record.field(4);
    let unit = row
        .map(|r| r.lis_unit.as_str())
        .filter(|u| !u.is_empty())
        .unwrap_or(native_unit);

    let value = process_result_value(record.field(3), native_unit, row);

    format!(
        "OBX|{}|NM|{}|{}|{}|{}||{}|||F|||{}||{}",
        index,
        observation_id,
        record.field(1),
        value,
        unit,
        record.field(6),
        record.field(12),
        record.field(10)
    )
}

/// LAB-29 reply: collapse the LIS ACK to the analyzer-facing terminator.
/// Anything that is not an HL7 message with MSA-1 == AA is a rejection.
pub fn upstream_ack_to_terminator(reply: &str) -> String {
    if !reply.trim_start().starts_with("MSH|") {
        return "L|1|N".to_string();
    }
    match hl7::parse_message(reply) {
        Ok(message) if message.ack_code() == Some("AA") => "L|1|Y".to_string(),
        _ => "L|1|N".to_string(),
    }
}

/// LAB-27: build a QBP^Q11 worklist query from the analyzer's Q record.
pub fn query_to_qbp_q11(query: &Record) -> String {
    let (msh, _) = hl7::build_msh(
        ANALYZER_APPLICATION,
        ANALYZER_FACILITY,
        LIS_APPLICATION,
        LIS_FACILITY,
        "QBP^Q11",
    );
    let sid = query_specimen_id(query);
    format!("{}\rQPD|LAB-27^IHE|SYSMEX|{}\rRCP|I", msh, sid)
}

/// LAB-27 reply: specimen id of the first SPM segment of an RSP^K11,
/// scanned textually so partial or oddly-ordered responses still match.
pub fn rsp_k11_specimen_id(reply: &str) -> Option<String> {
    reply
        .split(['\r', '\n'])
        .map(str::trim)
        .find(|line| line.starts_with("SPM|"))
        .and_then(|line| line.split('|').nth(2))
        .map(|sid| sid.trim().to_string())
        .filter(|sid| !sid.is_empty())
}

/// LAB-28: placer-assigned specimen id of the first SPM in an OML^O33
/// (first `^` component, entity id subcomponent).
pub fn oml_o33_specimen_id(order: &Hl7Message) -> Option<String> {
    let spm = order.first_segment("SPM")?;
    let placer = spm
        .field(2)
        .split('^')
        .next()
        .unwrap_or("")
        .split('&')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if placer.is_empty() {
        None
    } else {
        Some(placer)
    }
}

/// The four-record H/P/O/L block downloaded to the analyzer for one
/// specimen (LAB-27 replies and LAB-28 orders share it). The sample id is
/// right-aligned in a 15-character field.
pub fn worklist_records(specimen_id: &str) -> Vec<String> {
    let padded = format!("{:>width$}", specimen_id, width = SAMPLE_ID_WIDTH);
    vec![
        "H|\\^&|||||||||||E1394-97".to_string(),
        "P|1".to_string(),
        format!(
            "O|1||^^{}^A|{}|||||||N||||||||||||||F",
            padded, WORKLIST_BATTERY
        ),
        "L|1|N".to_string(),
    ]
}
