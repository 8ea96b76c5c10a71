//! ClinicalTrials.gov adapter: normalize a `CtGovStudy` into a
//! registry-agnostic `Registration`. The wire client lives in
//! `crate::sources::clinicaltrials`; this module only maps shapes.

use std::path::Path;

use crate::error::PublinkError;
use crate::registry::{Registration, RegistrationReference, RegistryType};
use crate::sources::clinicaltrials::{ClinicalTrialsClient, CtGovStudy};

/// If `local_registrations` is given, try `{dir}/{trial_id}.json` first
/// and fall back to the network on any read/parse failure.
pub async fn fetch(
    trial_id: &str,
    local_registrations: Option<&Path>,
) -> Result<Registration, PublinkError> {
    if let Some(dir) = local_registrations
        && let Some(study) = read_local(dir, trial_id).await
    {
        return Ok(normalize(trial_id, study));
    }

    let client = ClinicalTrialsClient::new()?;
    let study = client.get(trial_id, &["all".to_string()]).await?;
    Ok(normalize(trial_id, study))
}

async fn read_local(dir: &Path, trial_id: &str) -> Option<CtGovStudy> {
    let path = dir.join(format!("{trial_id}.json"));
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn normalize(trial_id: &str, study: CtGovStudy) -> Registration {
    let Some(protocol) = study.protocol_section else {
        return Registration {
            trial_id: trial_id.to_string(),
            registry_type: Some(RegistryType::Ctgov),
            ..Default::default()
        };
    };

    let identification = protocol.identification_module;
    let status = protocol.status_module;
    let sponsor = protocol.sponsor_collaborators_module;
    let description = protocol.description_module;
    let conditions = protocol.conditions_module;
    let design = protocol.design_module;
    let arms = protocol.arms_interventions_module;
    let references_module = protocol.references_module;

    let interventions = arms
        .as_ref()
        .map(|m| {
            m.interventions
                .iter()
                .filter_map(|i| i.name.clone())
                .collect()
        })
        .unwrap_or_default();

    let references: Vec<RegistrationReference> = references_module
        .map(|m| {
            m.references
                .into_iter()
                .map(|r| RegistrationReference {
                    pmid: r.pmid,
                    citation: r.citation,
                })
                .collect()
        })
        .unwrap_or_default();

    Registration {
        trial_id: trial_id.to_string(),
        registry_type: Some(RegistryType::Ctgov),
        brief_title: identification.as_ref().and_then(|m| m.brief_title.clone()),
        official_title: None,
        acronym: None,
        brief_summary: description.and_then(|m| m.brief_summary),
        detailed_description: None,
        overall_status: status.as_ref().and_then(|m| m.overall_status.clone()),
        start_date: status
            .as_ref()
            .and_then(|m| m.start_date_struct.as_ref())
            .and_then(|d| d.date.clone()),
        completion_date: status
            .as_ref()
            .and_then(|m| m.completion_date_struct.as_ref())
            .and_then(|d| d.date.clone()),
        investigator_full_name: None,
        principal_investigators: sponsor
            .and_then(|m| m.lead_sponsor)
            .and_then(|s| s.name)
            .into_iter()
            .collect(),
        study_type: design.as_ref().and_then(|m| m.study_type.clone()),
        phase: design
            .and_then(|m| m.phases)
            .and_then(|p| p.into_iter().next()),
        sex: None,
        conditions: conditions.map(|m| m.conditions).unwrap_or_default(),
        interventions,
        has_results: None,
        references,
        linked_pubmed_ids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::clinicaltrials::{
        CtGovDateStruct, CtGovDescriptionModule, CtGovIdentificationModule, CtGovProtocolSection,
        CtGovStatusModule,
    };

    #[test]
    fn normalize_maps_core_fields() {
        let study = CtGovStudy {
            protocol_section: Some(CtGovProtocolSection {
                identification_module: Some(CtGovIdentificationModule {
                    nct_id: Some("NCT04267848".into()),
                    brief_title: Some("A Study of Remdesivir".into()),
                }),
                status_module: Some(CtGovStatusModule {
                    overall_status: Some("COMPLETED".into()),
                    start_date_struct: Some(CtGovDateStruct {
                        date: Some("2020-02-05".into()),
                    }),
                    completion_date_struct: Some(CtGovDateStruct {
                        date: Some("2020-04-19".into()),
                    }),
                }),
                sponsor_collaborators_module: None,
                description_module: Some(CtGovDescriptionModule {
                    brief_summary: Some("Evaluates remdesivir.".into()),
                }),
                conditions_module: None,
                design_module: None,
                arms_interventions_module: None,
                eligibility_module: None,
                contacts_locations_module: None,
                outcomes_module: None,
                references_module: None,
            }),
        };

        let reg = normalize("NCT04267848", study);
        assert_eq!(reg.brief_title.as_deref(), Some("A Study of Remdesivir"));
        assert_eq!(reg.start_date.as_deref(), Some("2020-02-05"));
        assert_eq!(reg.registry_type, Some(RegistryType::Ctgov));
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn normalize_handles_missing_protocol_section() {
        let study = CtGovStudy {
            protocol_section: None,
        };
        let reg = normalize("NCT00000000", study);
        assert!(reg.brief_title.is_none());
    }
}
