use std::collections::HashMap;

use super::types::{CandidateKind, ClinicalDataType};

/// Agent used for tables whose data type has no registered agents.
pub const TABLE_FALLBACK_AGENT: &str = "table_extractor";
/// Agent used for figures whose data type has no registered agents.
pub const FIGURE_FALLBACK_AGENT: &str = "figure_analyst";

/// Maps each clinical data type to the agents that analyse it.
/// More than one agent per type gives cross-validation.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    routes: HashMap<ClinicalDataType, Vec<String>>,
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            ClinicalDataType::PatientDemographics,
            ["demographics_analyst", "table_extractor"],
        );
        registry.register(
            ClinicalDataType::Outcomes,
            ["outcomes_analyst", "statistics_validator"],
        );
        registry.register(
            ClinicalDataType::AdverseEvents,
            ["safety_analyst", "statistics_validator"],
        );
        registry.register(ClinicalDataType::SurgicalProcedures, ["procedure_analyst"]);
        registry.register(ClinicalDataType::Neuroimaging, ["imaging_analyst"]);
        registry.register(ClinicalDataType::StudyDesign, ["methodology_analyst"]);
        registry
    }

    /// Replace the agent set for a data type. Duplicate names are dropped.
    pub fn register<I, S>(&mut self, data_type: ClinicalDataType, agents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<String> = Vec::new();
        for agent in agents {
            let agent = agent.into();
            if !agent.trim().is_empty() && !set.contains(&agent) {
                set.push(agent);
            }
        }
        self.routes.insert(data_type, set);
    }

    /// Agents for a candidate, in registration order. Never empty.
    pub fn route(&self, data_type: ClinicalDataType, kind: CandidateKind) -> Vec<String> {
        match self.routes.get(&data_type) {
            Some(agents) if !agents.is_empty() => agents.clone(),
            _ => vec![Self::fallback(kind).to_string()],
        }
    }

    pub fn fallback(kind: CandidateKind) -> &'static str {
        match kind {
            CandidateKind::Table => TABLE_FALLBACK_AGENT,
            CandidateKind::Figure => FIGURE_FALLBACK_AGENT,
        }
    }

    /// Every agent name the registry can route to, including fallbacks.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.values().flatten().cloned().collect();
        names.push(TABLE_FALLBACK_AGENT.to_string());
        names.push(FIGURE_FALLBACK_AGENT.to_string());
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_route_one_to_many() {
        let registry = AgentRegistry::with_defaults();
        let agents = registry.route(ClinicalDataType::Outcomes, CandidateKind::Table);
        assert_eq!(agents, vec!["outcomes_analyst", "statistics_validator"]);
    }

    #[test]
    fn unknown_falls_back_per_kind() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(
            registry.route(ClinicalDataType::Unknown, CandidateKind::Table),
            vec![TABLE_FALLBACK_AGENT]
        );
        assert_eq!(
            registry.route(ClinicalDataType::Unknown, CandidateKind::Figure),
            vec![FIGURE_FALLBACK_AGENT]
        );
    }

    #[test]
    fn register_replaces_and_dedups() {
        let mut registry = AgentRegistry::with_defaults();
        registry.register(ClinicalDataType::Outcomes, ["a", "b", "a", " "]);
        assert_eq!(
            registry.route(ClinicalDataType::Outcomes, CandidateKind::Figure),
            vec!["a", "b"]
        );
    }

    #[test]
    fn empty_set_uses_fallback() {
        let mut registry = AgentRegistry::empty();
        registry.register(ClinicalDataType::Neuroimaging, Vec::<String>::new());
        assert_eq!(
            registry.route(ClinicalDataType::Neuroimaging, CandidateKind::Figure),
            vec![FIGURE_FALLBACK_AGENT]
        );
    }

    #[test]
    fn agent_names_sorted_and_unique() {
        let names = AgentRegistry::with_defaults().agent_names();
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        assert!(names.contains(&"statistics_validator".to_string()));
        assert!(names.contains(&FIGURE_FALLBACK_AGENT.to_string()));
    }
}
