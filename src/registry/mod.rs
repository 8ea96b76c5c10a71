//! Registry-agnostic trial registration, plus the dispatcher that routes
//! a trial id string to the adapter that understands it.

pub mod ctgov;
pub mod drks;
pub mod euctr;

use serde::{Deserialize, Serialize};

use crate::error::PublinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryType {
    Ctgov,
    Euctr,
    Drks,
}

impl RegistryType {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryType::Ctgov => "ctgov",
            RegistryType::Euctr => "euctr",
            RegistryType::Drks => "drks",
        }
    }
}

/// A `NCT\d{8}` id routes to ctgov, `\d{4}-\d{6}-\d{2}` to euctr, and
/// `DRKS\d{8}` to drks. Anything else is unrecognized.
pub fn detect_registry_type(trial_id: &str) -> Option<RegistryType> {
    let id = trial_id.trim();
    if is_nct_id(id) {
        return Some(RegistryType::Ctgov);
    }
    if is_eudract_id(id) {
        return Some(RegistryType::Euctr);
    }
    if is_drks_id(id) {
        return Some(RegistryType::Drks);
    }
    None
}

fn is_nct_id(id: &str) -> bool {
    let upper = id.to_ascii_uppercase();
    upper.len() == 11
        && upper.starts_with("NCT")
        && upper[3..].bytes().all(|b| b.is_ascii_digit())
}

fn is_eudract_id(id: &str) -> bool {
    // 2020-001234-56
    let bytes = id.as_bytes();
    if bytes.len() != 14 {
        return false;
    }
    let digits = |r: std::ops::Range<usize>| id[r].bytes().all(|b| b.is_ascii_digit());
    digits(0..4) && bytes[4] == b'-' && digits(5..11) && bytes[11] == b'-' && digits(12..14)
}

fn is_drks_id(id: &str) -> bool {
    let upper = id.to_ascii_uppercase();
    upper.len() == 12
        && upper.starts_with("DRKS")
        && upper[4..].bytes().all(|b| b.is_ascii_digit())
}

/// Normalize a user-supplied trial id to the canonical shape used as a
/// cache and map key (uppercase prefix, trimmed).
pub fn normalize_trial_id(trial_id: &str) -> String {
    let trimmed = trial_id.trim();
    match detect_registry_type(trimmed) {
        Some(RegistryType::Ctgov) => trimmed.to_ascii_uppercase(),
        Some(RegistryType::Drks) => trimmed.to_ascii_uppercase(),
        _ => trimmed.to_string(),
    }
}

/// The canonical, registry-agnostic trial record every adapter produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    pub trial_id: String,
    pub registry_type: Option<RegistryType>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub acronym: Option<String>,
    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,
    pub overall_status: Option<String>,
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    pub investigator_full_name: Option<String>,
    #[serde(default)]
    pub principal_investigators: Vec<String>,
    pub study_type: Option<String>,
    pub phase: Option<String>,
    pub sex: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub interventions: Vec<String>,
    pub has_results: Option<bool>,
    #[serde(default)]
    pub references: Vec<RegistrationReference>,
    #[serde(default)]
    pub linked_pubmed_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationReference {
    pub pmid: Option<String>,
    pub citation: Option<String>,
}

impl Registration {
    pub fn validate(&self) -> Result<(), PublinkError> {
        if self.brief_title.is_none() && self.official_title.is_none() {
            return Err(PublinkError::InvalidArgument(format!(
                "registration {} has neither a brief nor official title",
                self.trial_id
            )));
        }
        if let (Some(start), Some(completion)) = (&self.start_date, &self.completion_date)
            && start.as_str() > completion.as_str()
        {
            return Err(PublinkError::InvalidArgument(format!(
                "registration {} has start date {start} after completion date {completion}",
                self.trial_id
            )));
        }
        Ok(())
    }

    /// PMIDs this registration already knows about, preferring any
    /// results-page scrape over CTGov-provided references.
    pub fn known_pmids(&self) -> Vec<String> {
        if !self.linked_pubmed_ids.is_empty() {
            return self.linked_pubmed_ids.clone();
        }
        self.references
            .iter()
            .filter_map(|r| r.pmid.clone())
            .collect()
    }
}

/// Fetch a registration from whichever registry `trial_id` belongs to.
pub async fn fetch(trial_id: &str, local_registrations: Option<&std::path::Path>) -> Result<Registration, PublinkError> {
    let normalized = normalize_trial_id(trial_id);
    match detect_registry_type(&normalized) {
        Some(RegistryType::Ctgov) => ctgov::fetch(&normalized, local_registrations).await,
        Some(RegistryType::Euctr) => euctr::fetch(&normalized).await,
        Some(RegistryType::Drks) => drks::fetch(&normalized).await,
        None => Err(PublinkError::UnknownRegistry(trial_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ctgov_ids() {
        assert_eq!(detect_registry_type("NCT04267848"), Some(RegistryType::Ctgov));
        assert_eq!(detect_registry_type("nct04267848"), Some(RegistryType::Ctgov));
    }

    #[test]
    fn detects_euctr_ids() {
        assert_eq!(detect_registry_type("2020-001234-56"), Some(RegistryType::Euctr));
    }

    #[test]
    fn detects_drks_ids() {
        assert_eq!(detect_registry_type("DRKS00021220"), Some(RegistryType::Drks));
    }

    #[test]
    fn unknown_ids_are_none() {
        assert_eq!(detect_registry_type("not-a-trial-id"), None);
        assert_eq!(detect_registry_type(""), None);
    }

    #[test]
    fn registration_requires_a_title() {
        let reg = Registration {
            trial_id: "NCT04267848".into(),
            ..Default::default()
        };
        assert!(reg.validate().is_err());
    }

    #[test]
    fn registration_rejects_start_after_completion() {
        let reg = Registration {
            trial_id: "NCT04267848".into(),
            brief_title: Some("Example".into()),
            start_date: Some("2021-06-01".into()),
            completion_date: Some("2020-01-01".into()),
            ..Default::default()
        };
        assert!(reg.validate().is_err());
    }

    #[test]
    fn known_pmids_prefers_linked_over_references() {
        let reg = Registration {
            trial_id: "NCT04267848".into(),
            linked_pubmed_ids: vec!["111".into()],
            references: vec![RegistrationReference {
                pmid: Some("222".into()),
                citation: None,
            }],
            ..Default::default()
        };
        assert_eq!(reg.known_pmids(), vec!["111".to_string()]);
    }
}
