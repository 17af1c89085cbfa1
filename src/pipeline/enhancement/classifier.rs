use super::traits::CandidateClassifier;
use super::types::{
    Candidate, ClassificationSource, ClassificationTrace, ClassifiedCandidate, ClinicalDataType,
};

pub const HEADER_MATCH_CONFIDENCE: f64 = 0.85;
pub const CONTENT_MATCH_CONFIDENCE: f64 = 0.6;
pub const UNKNOWN_CONFIDENCE: f64 = 0.1;

/// One row of the priority-ordered rule table.
struct Rule {
    name: &'static str,
    data_type: ClinicalDataType,
    header_keywords: &'static [&'static str],
    content_keywords: &'static [&'static str],
}

/// Earlier rules win. Keywords match whole lowercase tokens (multi-word
/// keywords match consecutive tokens).
const RULES: &[Rule] = &[
    Rule {
        name: "adverse_events",
        data_type: ClinicalDataType::AdverseEvents,
        header_keywords: &["adverse", "adverse events", "complication", "complications", "safety", "ae", "sae"],
        content_keywords: &[
            "adverse event",
            "complication",
            "complications",
            "infection",
            "hemorrhage",
            "haemorrhage",
            "seizure",
            "pneumonia",
            "reoperation",
        ],
    },
    Rule {
        name: "outcomes",
        data_type: ClinicalDataType::Outcomes,
        header_keywords: &["outcome", "outcomes", "mortality", "mrs", "gos", "survival", "endpoint", "death"],
        content_keywords: &[
            "mortality",
            "mrs",
            "gos",
            "survival",
            "death",
            "died",
            "rankin",
            "functional outcome",
            "kaplan meier",
        ],
    },
    Rule {
        name: "surgical_procedures",
        data_type: ClinicalDataType::SurgicalProcedures,
        header_keywords: &["procedure", "procedures", "technique", "operation", "approach", "operative"],
        content_keywords: &[
            "craniectomy",
            "hemicraniectomy",
            "decompressive",
            "duraplasty",
            "craniotomy",
            "evacuation",
            "ventriculostomy",
        ],
    },
    Rule {
        name: "neuroimaging",
        data_type: ClinicalDataType::Neuroimaging,
        header_keywords: &["imaging", "ct", "mri", "midline shift", "infarct volume", "lesion volume"],
        content_keywords: &["ct", "mri", "dwi", "midline shift", "infarct volume", "hyperdense", "mca territory"],
    },
    Rule {
        name: "patient_demographics",
        data_type: ClinicalDataType::PatientDemographics,
        header_keywords: &["age", "sex", "gender", "n", "characteristic", "characteristics", "baseline", "demographics"],
        content_keywords: &[
            "age",
            "sex",
            "male",
            "female",
            "gender",
            "bmi",
            "hypertension",
            "diabetes",
            "nihss",
            "gcs",
        ],
    },
    Rule {
        name: "study_design",
        data_type: ClinicalDataType::StudyDesign,
        header_keywords: &["study", "design", "trial", "author", "authors", "year", "country"],
        content_keywords: &[
            "randomized",
            "randomised",
            "rct",
            "cohort",
            "retrospective",
            "prospective",
            "allocation",
            "blinded",
        ],
    },
];

/// Keyword-rule classifier. Rules are tried in table order and the first
/// rule with any evidence wins; within a rule, header evidence is checked
/// before content and sets the confidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedClassifier;

impl CandidateClassifier for RuleBasedClassifier {
    fn classify(&self, candidate: Candidate) -> ClassifiedCandidate {
        classify_candidate(candidate)
    }
}

pub fn classify_candidate(candidate: Candidate) -> ClassifiedCandidate {
    let (header_cells, content_cells) = evidence(&candidate);
    let header_tokens: Vec<Vec<String>> = header_cells.iter().map(|c| tokenize(c)).collect();
    let content_tokens: Vec<Vec<String>> = content_cells.iter().map(|c| tokenize(c)).collect();

    let hit = RULES.iter().find_map(|rule| {
        find_keyword(&header_tokens, rule.header_keywords)
            .map(|kw| (rule, kw, ClassificationSource::Header, HEADER_MATCH_CONFIDENCE))
            .or_else(|| {
                find_keyword(&content_tokens, rule.content_keywords)
                    .map(|kw| (rule, kw, ClassificationSource::Content, CONTENT_MATCH_CONFIDENCE))
            })
    });

    let (data_type, confidence, trace) = match hit {
        Some((rule, keyword, source, confidence)) => (
            rule.data_type,
            confidence,
            ClassificationTrace {
                rule: rule.name.to_string(),
                matched_keyword: Some(keyword.to_string()),
                source,
            },
        ),
        None => (
            ClinicalDataType::Unknown,
            UNKNOWN_CONFIDENCE,
            ClassificationTrace {
                rule: "default".to_string(),
                matched_keyword: None,
                source: ClassificationSource::None,
            },
        ),
    };

    tracing::debug!(
        candidate_id = candidate.id(),
        data_type = %data_type,
        rule = %trace.rule,
        "Candidate classified"
    );

    ClassifiedCandidate {
        candidate,
        clinical_data_type: data_type,
        classification_confidence: confidence,
        trace,
    }
}

/// Header cells and content cells of a candidate.
fn evidence(candidate: &Candidate) -> (Vec<&str>, Vec<&str>) {
    match candidate {
        Candidate::Table(t) => (
            t.headers.iter().map(String::as_str).collect(),
            t.rows.iter().flatten().map(String::as_str).collect(),
        ),
        Candidate::Figure(f) => {
            let mut content: Vec<&str> = Vec::new();
            if let Some(caption) = &f.caption {
                content.push(caption);
            }
            content.push(&f.metadata.image_name);
            (Vec::new(), content)
        }
    }
}

fn find_keyword(cells: &[Vec<String>], keywords: &'static [&'static str]) -> Option<&'static str> {
    keywords
        .iter()
        .find(|kw| cells.iter().any(|tokens| contains_phrase(tokens, kw)))
        .copied()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(words.len())
        .any(|w| w.iter().zip(&words).all(|(t, k)| t == k))
}
