use serde::{Deserialize, Serialize};

use super::error::EnhancementError;
use crate::pipeline::detection::{BoundingBox, FigureCandidate, FigureMetadata, TableCandidate};

/// Enum with a stable snake_case string form shared by serde, `as_str` and `FromStr`.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EnhancementError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(EnhancementError::InvalidInput(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

str_enum!(
    /// Semantic label of a candidate's clinical content.
    ClinicalDataType {
        PatientDemographics => "patient_demographics",
        Outcomes => "outcomes",
        AdverseEvents => "adverse_events",
        SurgicalProcedures => "surgical_procedures",
        Neuroimaging => "neuroimaging",
        StudyDesign => "study_design",
        Unknown => "unknown",
    }
);

str_enum!(CandidateKind {
    Table => "table",
    Figure => "figure",
});

str_enum!(
    /// Per-result outcome; only `Validated` results feed the confidence mean.
    ValidationStatus {
        Validated => "validated",
        Warning => "warning",
        Failed => "failed",
    }
);

str_enum!(
    /// Where the classifier found its evidence.
    ClassificationSource {
        Header => "header",
        Content => "content",
        None => "none",
    }
);

// ═══════════════════════════════════════════════════════════
// Candidates
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
    Table(TableCandidate),
    Figure(FigureCandidate),
}

impl Candidate {
    pub fn id(&self) -> &str {
        match self {
            Candidate::Table(t) => &t.id,
            Candidate::Figure(f) => &f.id,
        }
    }

    pub fn page_num(&self) -> u32 {
        match self {
            Candidate::Table(t) => t.page_num,
            Candidate::Figure(f) => f.page_num,
        }
    }

    pub fn kind(&self) -> CandidateKind {
        match self {
            Candidate::Table(_) => CandidateKind::Table,
            Candidate::Figure(_) => CandidateKind::Figure,
        }
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        match self {
            Candidate::Table(t) => &t.bounding_box,
            Candidate::Figure(f) => &f.bounding_box,
        }
    }

    /// Structural checks that abort a pipeline call when violated.
    pub fn validate(&self) -> Result<(), EnhancementError> {
        let invalid = |reason: &str| {
            EnhancementError::InvalidInput(format!("{} '{}': {reason}", self.kind(), self.id()))
        };

        if self.id().trim().is_empty() {
            return Err(EnhancementError::InvalidInput(format!(
                "{} on page {} has an empty id",
                self.kind(),
                self.page_num()
            )));
        }
        if self.page_num() == 0 {
            return Err(invalid("page numbers are 1-based"));
        }
        if !self.bounding_box().is_well_formed() {
            return Err(invalid("bounding box is non-finite or negative"));
        }
        if let Candidate::Table(t) = self {
            if t.headers.is_empty() {
                return Err(invalid("table has no header row"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTrace {
    /// Name of the rule that fired, or "default".
    pub rule: String,
    pub matched_keyword: Option<String>,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedCandidate {
    pub candidate: Candidate,
    pub clinical_data_type: ClinicalDataType,
    pub classification_confidence: f64,
    pub trace: ClassificationTrace,
}

// ═══════════════════════════════════════════════════════════
// Agent contract
// ═══════════════════════════════════════════════════════════

/// Payload shipped to an agent, typed by candidate kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateContent {
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Figure {
        data_url: String,
        width: u32,
        height: u32,
        caption: Option<String>,
        metadata: FigureMetadata,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub candidate_id: String,
    pub page_number: u32,
    pub data_type: ClinicalDataType,
    pub content: CandidateContent,
}

impl AgentRequest {
    pub fn from_classified(classified: &ClassifiedCandidate) -> Self {
        let content = match &classified.candidate {
            Candidate::Table(t) => CandidateContent::Table {
                headers: t.headers.clone(),
                rows: t.rows.clone(),
            },
            Candidate::Figure(f) => CandidateContent::Figure {
                data_url: f.data_url.clone(),
                width: f.width,
                height: f.height,
                caption: f.caption.clone(),
                metadata: f.metadata.clone(),
            },
        };
        Self {
            candidate_id: classified.candidate.id().to_string(),
            page_number: classified.candidate.page_num(),
            data_type: classified.clinical_data_type,
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_data: serde_json::Value,
    #[serde(default)]
    pub processing_time_ms: u64,
    pub validation_status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

impl AgentResult {
    /// Failed result recorded in place of a call that never produced one.
    pub fn failed(
        agent_name: impl Into<String>,
        error: &EnhancementError,
        processing_time_ms: u64,
        page_number: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            confidence: 0.0,
            extracted_data: serde_json::json!({ "error": error.to_string() }),
            processing_time_ms,
            validation_status: ValidationStatus::Failed,
            source_quote: None,
            page_number: Some(page_number),
        }
    }

    pub fn is_validated(&self) -> bool {
        self.validation_status == ValidationStatus::Validated
    }
}

/// Clamp a confidence into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline output
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusData {
    pub primary_agent: String,
    pub merged_fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub agent_results: Vec<AgentResult>,
    pub overall_confidence: f64,
    pub clinical_data_type: ClinicalDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_data: Option<ConsensusData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedTable {
    #[serde(flatten)]
    pub table: TableCandidate,
    pub enhancement: Enhancement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedFigure {
    #[serde(flatten)]
    pub figure: FigureCandidate,
    pub enhancement: Enhancement,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_processing_time_ms: u64,
    pub agents_invoked: usize,
    pub tables_processed: usize,
    pub figures_processed: usize,
    pub average_confidence: f64,
    /// Pairings never dispatched because the run was cancelled.
    pub calls_skipped: usize,
    pub calls_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub enhanced_figures: Vec<EnhancedFigure>,
    pub enhanced_tables: Vec<EnhancedTable>,
    pub pipeline_stats: PipelineStats,
}
