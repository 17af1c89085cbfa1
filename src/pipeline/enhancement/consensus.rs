//! Merge one candidate's agent results into a single enhancement.
//!
//! - `overall_confidence`: mean over validated results, 0 when none.
//! - `consensus_data`: only with ≥2 validated results. The most confident
//!   validated result is primary (earliest wins ties) and seeds the merged
//!   fields; the others, most confident first, fill only keys still absent.

use serde_json::{Map, Value};

use super::types::{clamp_confidence, AgentResult, ClinicalDataType, ConsensusData, Enhancement};

pub fn aggregate(results: Vec<AgentResult>, data_type: ClinicalDataType) -> Enhancement {
    let validated: Vec<&AgentResult> = results.iter().filter(|r| r.is_validated()).collect();

    if validated.is_empty() {
        tracing::debug!(
            results = results.len(),
            data_type = %data_type,
            "No validated agent results, zero confidence"
        );
        return Enhancement {
            agent_results: results,
            overall_confidence: 0.0,
            clinical_data_type: data_type,
            consensus_data: None,
        };
    }

    let sum: f64 = validated.iter().map(|r| clamp_confidence(r.confidence)).sum();
    let overall_confidence = clamp_confidence(sum / validated.len() as f64);

    let consensus_data = if validated.len() >= 2 {
        Some(merge(&validated))
    } else {
        None
    };

    Enhancement {
        agent_results: results,
        overall_confidence,
        clinical_data_type: data_type,
        consensus_data,
    }
}

fn merge(validated: &[&AgentResult]) -> ConsensusData {
    // Stable sort: equal confidences keep input order, so the earliest wins ties
    let mut ranked: Vec<&AgentResult> = validated.to_vec();
    ranked.sort_by(|a, b| {
        clamp_confidence(b.confidence).total_cmp(&clamp_confidence(a.confidence))
    });

    let primary = ranked[0];
    let mut merged_fields = match &primary.extracted_data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };

    for other in &ranked[1..] {
        // Non-object payloads have no named fields to contribute
        if let Value::Object(map) = &other.extracted_data {
            for (key, value) in map {
                merged_fields
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }

    ConsensusData {
        primary_agent: primary.agent_name.clone(),
        merged_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::enhancement::types::ValidationStatus;
    use serde_json::json;

    fn result(agent: &str, confidence: f64, status: ValidationStatus, data: Value) -> AgentResult {
        AgentResult {
            agent_name: agent.into(),
            confidence,
            extracted_data: data,
            processing_time_ms: 10,
            validation_status: status,
            source_quote: None,
            page_number: Some(1),
        }
    }

    fn validated(agent: &str, confidence: f64, data: Value) -> AgentResult {
        result(agent, confidence, ValidationStatus::Validated, data)
    }

    #[test]
    fn two_validated_results_average_and_pick_primary() {
        let e = aggregate(
            vec![
                validated("b", 0.7, json!({"n": 50})),
                validated("a", 0.9, json!({"n": 48, "mean_age": 62.1})),
            ],
            ClinicalDataType::PatientDemographics,
        );
        assert!((e.overall_confidence - 0.8).abs() < 1e-9);
        let consensus = e.consensus_data.unwrap();
        assert_eq!(consensus.primary_agent, "a");
        assert_eq!(consensus.merged_fields["n"], json!(48));
        assert_eq!(e.agent_results.len(), 2);
    }

    #[test]
    fn all_failed_gives_zero_and_no_consensus() {
        let e = aggregate(
            vec![
                result("a", 0.0, ValidationStatus::Failed, json!({"error": "timeout"})),
                result("b", 0.0, ValidationStatus::Failed, json!({"error": "500"})),
            ],
            ClinicalDataType::Outcomes,
        );
        assert_eq!(e.overall_confidence, 0.0);
        assert!(e.consensus_data.is_none());
        assert!(e
            .agent_results
            .iter()
            .all(|r| r.validation_status == ValidationStatus::Failed));
    }

    #[test]
    fn empty_results_give_zero() {
        let e = aggregate(vec![], ClinicalDataType::Unknown);
        assert!(e.agent_results.is_empty());
        assert_eq!(e.overall_confidence, 0.0);
        assert!(e.consensus_data.is_none());
    }

    #[test]
    fn warnings_and_failures_excluded_from_mean_but_kept() {
        let e = aggregate(
            vec![
                validated("a", 0.6, json!({})),
                result("b", 0.99, ValidationStatus::Warning, json!({})),
                result("c", 0.0, ValidationStatus::Failed, json!({})),
            ],
            ClinicalDataType::Outcomes,
        );
        assert!((e.overall_confidence - 0.6).abs() < 1e-9);
        assert_eq!(e.agent_results.len(), 3);
        // Only one validated result: no consensus
        assert!(e.consensus_data.is_none());
    }

    #[test]
    fn tie_goes_to_earliest_result() {
        let e = aggregate(
            vec![
                validated("first", 0.8, json!({"x": 1})),
                validated("second", 0.8, json!({"x": 2})),
            ],
            ClinicalDataType::Outcomes,
        );
        let consensus = e.consensus_data.unwrap();
        assert_eq!(consensus.primary_agent, "first");
        assert_eq!(consensus.merged_fields["x"], json!(1));
    }

    #[test]
    fn secondaries_fill_absent_fields_by_confidence() {
        let e = aggregate(
            vec![
                validated("low", 0.5, json!({"mortality": "30%", "ci": "low-ci"})),
                validated("primary", 0.95, json!({"mortality": "22%"})),
                validated("mid", 0.7, json!({"ci": "mid-ci", "p": 0.01})),
            ],
            ClinicalDataType::Outcomes,
        );
        let fields = e.consensus_data.unwrap().merged_fields;
        assert_eq!(fields["mortality"], json!("22%"));
        assert_eq!(fields["ci"], json!("mid-ci"));
        assert_eq!(fields["p"], json!(0.01));
    }

    #[test]
    fn non_object_primary_stored_under_value() {
        let e = aggregate(
            vec![
                validated("a", 0.9, json!("42 patients")),
                validated("b", 0.8, json!({"n": 42})),
            ],
            ClinicalDataType::PatientDemographics,
        );
        let fields = e.consensus_data.unwrap().merged_fields;
        assert_eq!(fields["value"], json!("42 patients"));
        assert_eq!(fields["n"], json!(42));
    }

    #[test]
    fn out_of_range_confidences_clamped() {
        let e = aggregate(
            vec![validated("a", 1.8, json!({})), validated("b", f64::NAN, json!({}))],
            ClinicalDataType::Outcomes,
        );
        assert!((e.overall_confidence - 0.5).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&e.overall_confidence));
        assert_eq!(e.consensus_data.unwrap().primary_agent, "a");
    }
}
