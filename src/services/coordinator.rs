//! Transaction coordinator: the three IHE LAB flows end to end, plus the
//! dispatcher that routes an inbound analyzer message to LAB-27 or LAB-29.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AnalyzerConfig;
use crate::mapping::MappingTable;
use crate::protocol::astm::{split_message, strip_frame_prefix, RecordType};
use crate::protocol::hl7;
use crate::services::archive::{Direction, MessageArchiver};
use crate::services::upstream::LisUpstream;
use crate::translate;

/// Specimen id the XP family uses for its reagent background run; the
/// result is archived but never forwarded to the LIS.
const BACKGROUND_CHECK_ID: &str = "BACKGROUNDCHECK";

/// Route of an inbound analyzer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Lab27,
    Lab29,
}

/// Downlink to the analyzer used by LAB-28: delivers a block of ASTM
/// records over the currently connected link.
#[async_trait]
pub trait OrderLink: Send + Sync {
    async fn send_order(&self, records: Vec<String>) -> Result<(), String>;
}

pub struct TransactionCoordinator {
    config: AnalyzerConfig,
    mapping: MappingTable,
    upstream: Arc<dyn LisUpstream>,
    archiver: Arc<dyn MessageArchiver>,
}

impl TransactionCoordinator {
    pub fn new(
        config: AnalyzerConfig,
        mapping: MappingTable,
        upstream: Arc<dyn LisUpstream>,
        archiver: Arc<dyn MessageArchiver>,
    ) -> Self {
        Self {
            config,
            mapping,
            upstream,
            archiver,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Decide LAB-27 vs LAB-29 from the records present: any Q record
    /// routes to the worklist query, otherwise an H record marks a result
    /// upload. Anything else is noise.
    pub fn detect_transaction(message: &str) -> Option<Transaction> {
        let mut has_header = false;
        for line in message.split(['\r', '\n']) {
            let line = strip_frame_prefix(line.trim());
            if line.starts_with("Q|") {
                return Some(Transaction::Lab27);
            }
            if line.starts_with("H|") {
                has_header = true;
            }
        }
        has_header.then_some(Transaction::Lab29)
    }

    /// Route one assembled analyzer message and produce the ASTM records to
    /// send back, if any.
    pub async fn dispatch_astm(&self, message: &str) -> Option<Vec<String>> {
        match Self::detect_transaction(message) {
            Some(Transaction::Lab27) => self.lab27(message).await,
            Some(Transaction::Lab29) => Some(vec![self.lab29(message).await]),
            None => {
                log::warn!("Ignoring analyzer message with no Q or H record");
                None
            }
        }
    }

    /// LAB-29 result upload: ASTM results -> OUL^R22 -> LIS, LIS ACK ->
    /// `L|1|Y` / `L|1|N` terminator for the analyzer. Every failure path
    /// collapses to the negative terminator.
    pub async fn lab29(&self, message: &str) -> String {
        log::info!("LAB-29 result upload from {}", self.config.id_analyzer);
        self.archive("astm", message, "LAB-29/Analyzer", Direction::Inbound)
            .await;

        let records = split_message(message);
        let specimen_id = records
            .iter()
            .find(|r| r.record_type == RecordType::Order)
            .map(translate::order_specimen_id)
            .unwrap_or_default();

        if specimen_id.trim().eq_ignore_ascii_case(BACKGROUND_CHECK_ID) {
            log::info!("Background check result archived, not forwarded");
            return "L|1|Y".to_string();
        }

        let oul = translate::results_to_oul_r22(&records, &self.mapping);
        self.archive("hl7", &oul, "LAB-29/LIS", Direction::Outbound)
            .await;

        match self
            .upstream
            .send(&self.config.url_upstream_lab29, &oul)
            .await
        {
            Ok(reply) => {
                let terminator = translate::upstream_ack_to_terminator(&reply);
                log::info!(
                    "LAB-29 for specimen {:?} acknowledged with {}",
                    specimen_id,
                    terminator
                );
                terminator
            }
            Err(e) => {
                log::error!("LAB-29 upstream delivery failed: {}", e);
                "L|1|N".to_string()
            }
        }
    }

    /// LAB-27 worklist query: Q record -> QBP^Q11 -> LIS, RSP^K11 -> the
    /// four-record worklist block. No reply is produced when the LIS has
    /// nothing for the specimen or answers garbage.
    pub async fn lab27(&self, message: &str) -> Option<Vec<String>> {
        log::info!("LAB-27 worklist query from {}", self.config.id_analyzer);
        self.archive("astm", message, "LAB-27/Analyzer", Direction::Inbound)
            .await;

        let records = split_message(message);
        let query = records
            .iter()
            .find(|r| r.record_type == RecordType::Request)?;

        let qbp = translate::query_to_qbp_q11(query);
        self.archive("hl7", &qbp, "LAB-27/LIS", Direction::Outbound)
            .await;

        let reply = match self
            .upstream
            .send(&self.config.url_upstream_lab27, &qbp)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("LAB-27 upstream query failed: {}", e);
                return None;
            }
        };

        if !reply.trim_start().starts_with("MSH|") {
            log::warn!("LAB-27 upstream reply is not HL7, dropping");
            return None;
        }

        let specimen_id = translate::rsp_k11_specimen_id(&reply)?;
        log::info!("LAB-27 worklist entry for specimen {:?}", specimen_id);
        Some(translate::worklist_records(&specimen_id))
    }

    /// LAB-28 order download: OML^O33 -> worklist block -> analyzer over
    /// `link`, answered with an ACK^R22 (AA on delivery, AE otherwise).
    pub async fn lab28(&self, oml_text: &str, link: &dyn OrderLink) -> String {
        log::info!("LAB-28 order download for {}", self.config.id_analyzer);
        self.archive("hl7", oml_text, "LAB-28/LIS", Direction::Inbound)
            .await;

        let oml = match hl7::parse_message(oml_text) {
            Ok(message) => message,
            Err(e) => {
                log::error!("LAB-28 order is not parseable HL7: {}", e);
                return fallback_ack(oml_text, "AE");
            }
        };

        let specimen_id = match translate::oml_o33_specimen_id(&oml) {
            Some(sid) => sid,
            None => {
                log::error!("LAB-28 order carries no specimen id");
                return hl7::build_ack_r22(&oml, "AE");
            }
        };

        let records = translate::worklist_records(&specimen_id);
        self.archive(
            "astm",
            &records.join("\r"),
            "LAB-28/Analyzer",
            Direction::Outbound,
        )
        .await;

        let code = match link.send_order(records).await {
            Ok(()) => {
                log::info!("LAB-28 order for specimen {:?} delivered", specimen_id);
                "AA"
            }
            Err(e) => {
                log::error!("LAB-28 order delivery failed: {}", e);
                "AE"
            }
        };
        hl7::build_ack_r22(&oml, code)
    }

    async fn archive(&self, kind: &str, payload: &str, label: &str, direction: Direction) {
        if let Err(e) = self
            .archiver
            .archive(&self.config.id_analyzer, kind, payload, label, direction)
            .await
        {
            log::warn!("Archiving {} message failed: {}", label, e);
        }
    }
}

/// AE acknowledgment for an order that would not even parse; MSA-2 is
/// scraped textually from the MSH line when one exists.
fn fallback_ack(original: &str, code: &str) -> String {
    let control_id = original
        .split(['\r', '\n'])
        .find(|line| line.trim_start().starts_with("MSH|"))
        .and_then(|line| line.split('|').nth(9))
        .unwrap_or("UNKNOWN");

    let (msh, _) = hl7::build_msh(
        hl7::ANALYZER_APPLICATION,
        hl7::ANALYZER_FACILITY,
        hl7::LIS_APPLICATION,
        hl7::LIS_FACILITY,
        "ACK^R22",
    );
    format!("{}\rMSA|{}|{}", msh, code, control_id)
}
