//! LIVD-style mapping table: vendor analyte codes to LIS codes, unit
//! overrides and numeric conversions.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};

/// Numeric conversion applied to a mapped result value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertOp {
    #[default]
    None,
    Multiply,
    Divide,
    Add,
    Subtract,
    Log10,
}

impl ConvertOp {
    /// Closed-form conversion. `None` means "leave the raw value alone":
    /// divide by zero and log10 of a non-positive number.
    pub fn apply(&self, value: f64, factor: f64) -> Option<f64> {
        match self {
            ConvertOp::None => Some(value),
            ConvertOp::Multiply => Some(value * factor),
            ConvertOp::Divide => {
                if factor == 0.0 {
                    None
                } else {
                    Some(value / factor)
                }
            }
            ConvertOp::Add => Some(value + factor),
            ConvertOp::Subtract => Some(value - factor),
            ConvertOp::Log10 => {
                if value > 0.0 {
                    Some(value.log10())
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingRow {
    /// Optional test context; blank or absent makes the row global.
    #[serde(default)]
    pub test: Option<String>,
    pub vendor_result_code: String,
    pub lis_result_code: String,
    #[serde(default)]
    pub lis_unit: String,
    #[serde(default)]
    pub convert: ConvertOp,
    #[serde(default, deserialize_with = "deserialize_factor")]
    pub factor: f64,
}

impl MappingRow {
    fn is_global(&self) -> bool {
        self.test.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}

/// The `factor` column arrives as an integer, a float, or a numeric string
/// with `.` or `,` as decimal separator. Unparseable values collapse to 0,
/// which zeroes `multiply` results and disables `divide`.
fn deserialize_factor<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFactor {
        Float(f64),
        Int(i64),
        Text(String),
    }

    Ok(match RawFactor::deserialize(deserializer)? {
        RawFactor::Float(f) => f,
        RawFactor::Int(i) => i as f64,
        RawFactor::Text(s) => parse_decimal(&s).unwrap_or(0.0),
    })
}

#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    ivd_mapping: Vec<MappingRow>,
}

/// Loaded mapping table; immutable after startup.
#[derive(Debug, Default)]
pub struct MappingTable {
    rows: Vec<MappingRow>,
}

impl MappingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<MappingRow>) -> Self {
        Self { rows }
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let file: MappingFile = toml::from_str(text).context("invalid mapping table")?;
        Ok(Self::from_rows(file.ivd_mapping))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read mapping table {}", path.display()))?;
        let table = Self::from_toml_str(&text)?;
        log::info!(
            "Loaded {} mapping row(s) from {}",
            table.rows.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First global row whose normalized vendor code matches, compared
    /// case-insensitively. Sysmex tables only carry global rows; rows with
    /// a test context never match here.
    pub fn lookup(&self, vendor_code: &str) -> Option<&MappingRow> {
        let normalized = normalize_vendor_code(vendor_code);
        self.rows.iter().find(|row| {
            row.is_global()
                && normalize_vendor_code(&row.vendor_result_code)
                    .eq_ignore_ascii_case(&normalized)
        })
    }
}

/// Strip one or more trailing `^<digits>` suffixes: the XP family appends
/// dilution/mode counters (`^^^^WBC^7^1`) that must not defeat the lookup.
pub fn normalize_vendor_code(code: &str) -> String {
    let mut code = code.trim();
    loop {
        match code.rfind('^') {
            Some(pos)
                if pos + 1 < code.len()
                    && code[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
            {
                code = &code[..pos];
            }
            _ => return code.to_string(),
        }
    }
}

/// Analyzer "no result" markers; mapped to an empty OBX-5.
pub fn is_no_value(raw: &str) -> bool {
    matches!(raw.trim(), "" | "--" | "---" | "----")
}

/// Parse a number accepting both `.` and `,` as decimal separator.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim().replace(',', ".").parse::<f64>().ok()
}

/// Produce the OBX-5 value for a raw analyzer result: strip the
/// analyzer-reported `unit` when it trails the value, collapse no-value
/// markers, then apply the row's numeric conversion. Anything non-numeric
/// passes through unchanged. A mapping row's `lis_unit` override never
/// participates in the stripping; it only renames the reported unit.
pub fn process_result_value(raw: &str, unit: &str, row: Option<&MappingRow>) -> String {
    let mut value = raw.trim();
    if !unit.is_empty() && value.len() > unit.len() && value.ends_with(unit) {
        value = value[..value.len() - unit.len()].trim_end();
    }

    if is_no_value(value) {
        return String::new();
    }

    if let Some(row) = row {
        if row.convert != ConvertOp::None {
            if let Some(number) = parse_decimal(value) {
                if let Some(converted) = row.convert.apply(number, row.factor) {
                    return format_number(converted);
                }
            }
        }
    }

    value.to_string()
}

fn format_number(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(convert: ConvertOp, factor: f64) -> MappingRow {
        MappingRow {
            test: None,
            vendor_result_code: "^^^^WBC".to_string(),
            lis_result_code: "6690-2".to_string(),
            lis_unit: "10*3/uL".to_string(),
            convert,
            factor,
        }
    }

    #[test]
    fn test_normalize_strips_trailing_numeric_suffixes() {
        assert_eq!(normalize_vendor_code("^^^^WBC^7^1"), "^^^^WBC");
        assert_eq!(normalize_vendor_code("^^^^WBC^26"), "^^^^WBC");
        assert_eq!(normalize_vendor_code("^^^^WBC"), "^^^^WBC");
        assert_eq!(normalize_vendor_code("  ^^^^RBC^1 "), "^^^^RBC");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for code in ["^^^^WBC^7^1", "^^^^PLT", "HGB^12", "RAW"] {
            let once = normalize_vendor_code(code);
            assert_eq!(normalize_vendor_code(&once), once);
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive_and_suffix_blind() {
        let table = MappingTable::from_rows(vec![row(ConvertOp::None, 0.0)]);
        assert!(table.lookup("^^^^wbc^26").is_some());
        assert!(table.lookup("^^^^WBC").is_some());
        assert!(table.lookup("^^^^RBC").is_none());
    }

    #[test]
    fn test_lookup_skips_test_scoped_rows() {
        let mut scoped = row(ConvertOp::None, 0.0);
        scoped.test = Some("CBC".to_string());
        let table = MappingTable::from_rows(vec![scoped]);
        assert!(table.lookup("^^^^WBC").is_none());

        let mut blank = row(ConvertOp::None, 0.0);
        blank.test = Some("  ".to_string());
        let table = MappingTable::from_rows(vec![blank]);
        assert!(table.lookup("^^^^WBC").is_some());
    }

    #[test]
    fn test_conversions() {
        let cases = [
            (ConvertOp::Multiply, 10.0, "6.5", "65"),
            (ConvertOp::Divide, 2.0, "6.5", "3.25"),
            (ConvertOp::Add, 1.5, "6.5", "8"),
            (ConvertOp::Subtract, 0.5, "6.5", "6"),
        ];
        for (op, factor, input, expected) in cases {
            let r = row(op, factor);
            assert_eq!(process_result_value(input, "", Some(&r)), expected);
        }
    }

    #[test]
    fn test_log10_conversion() {
        let r = row(ConvertOp::Log10, 0.0);
        assert_eq!(process_result_value("100", "", Some(&r)), "2");
        // non-positive input is left raw
        assert_eq!(process_result_value("0", "", Some(&r)), "0");
        assert_eq!(process_result_value("-5", "", Some(&r)), "-5");
    }

    #[test]
    fn test_divide_by_zero_leaves_raw() {
        let r = row(ConvertOp::Divide, 0.0);
        assert_eq!(process_result_value("6.5", "", Some(&r)), "6.5");
    }

    #[test]
    fn test_comma_decimal_accepted() {
        let r = row(ConvertOp::Multiply, 2.0);
        assert_eq!(process_result_value("3,5", "", Some(&r)), "7");
        assert_eq!(parse_decimal("1,25"), Some(1.25));
    }

    #[test]
    fn test_non_numeric_passthrough() {
        let r = row(ConvertOp::Multiply, 2.0);
        assert_eq!(process_result_value("POSITIVE", "", Some(&r)), "POSITIVE");
    }

    #[test]
    fn test_no_value_tokens_become_empty() {
        for token in ["----", "---", "--", "", "  "] {
            assert_eq!(process_result_value(token, "", None), "");
        }
    }

    #[test]
    fn test_unit_suffix_stripped_from_value() {
        assert_eq!(process_result_value("6.42 10*3/uL", "10*3/uL", None), "6.42");
        // unit alone is not a value
        assert_eq!(process_result_value("6.42", "10*3/uL", None), "6.42");
    }

    #[test]
    fn test_factor_representations() {
        let table = MappingTable::from_toml_str(
            r#"
            [[ivd_mapping]]
            vendor_result_code = "^^^^WBC"
            lis_result_code = "6690-2"
            lis_unit = "10*9/L"
            convert = "multiply"
            factor = 1000

            [[ivd_mapping]]
            vendor_result_code = "^^^^RBC"
            lis_result_code = "789-8"
            lis_unit = ""
            convert = "divide"
            factor = "1,5"

            [[ivd_mapping]]
            vendor_result_code = "^^^^HGB"
            lis_result_code = "718-7"
            lis_unit = ""
            convert = "none"
            factor = "bogus"
            "#,
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup("^^^^WBC").unwrap().factor, 1000.0);
        assert_eq!(table.lookup("^^^^RBC").unwrap().factor, 1.5);
        assert_eq!(table.lookup("^^^^HGB").unwrap().factor, 0.0);
    }

    #[test]
    fn test_mapping_file_without_rows() {
        let table = MappingTable::from_toml_str("").unwrap();
        assert!(table.is_empty());
    }
}
