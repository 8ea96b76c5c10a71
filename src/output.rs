//! Run outputs: the tabular summary, per-trial JSON sidecars, and the
//! cost-summary sidecar. The CSV row for a trial is only ever appended
//! after its JSON sidecar has been written, so a crash never leaves a
//! row without backing detail — on recovery the JSON wins.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::PublinkError;
use crate::model::{Classification, Publication, UnitError};
use crate::registry::Registration;

/// One trial's outcome, the unit both the CSV row and the JSON sidecar
/// are derived from.
#[derive(Debug, Clone, Serialize)]
pub struct TrialSummary {
    pub nct_id: String,
    pub trial_id: String,
    pub tool_results: bool,
    pub has_error: bool,
    pub tool_prompted_pmids: Vec<String>,
    pub tool_result_pmids: Vec<String>,
    pub tool_ident_steps: Vec<String>,
    pub earliest_result_publication: Option<String>,
    pub earliest_result_publication_date: Option<String>,
    pub failed_publication_discoveries: Vec<String>,
    pub failed_result_discoveries: Vec<String>,
    pub reasons: Vec<String>,
}

/// Build the summary record for one trial from its enriched/filtered
/// publications and per-pmid classifications.
pub fn summarize(
    registration: &Registration,
    publications: &[Publication],
    discovery_errors: &[UnitError],
    classifications: &BTreeMap<String, Classification>,
) -> TrialSummary {
    let tool_prompted_pmids: Vec<String> = publications.iter().map(|p| p.pmid.clone()).collect();

    let mut tool_result_pmids = Vec::new();
    let mut ident_steps = std::collections::BTreeSet::new();
    let mut earliest: Option<(&str, &str)> = None;
    let mut reasons = Vec::new();
    let mut failed_result_discoveries = Vec::new();
    let mut missing_classification = false;

    for publication in publications {
        match classifications.get(&publication.pmid) {
            Some(classification) if classification.success => {
                if classification.has_results {
                    tool_result_pmids.push(publication.pmid.clone());
                    ident_steps.extend(publication.sources.iter().cloned());
                    if let Some(date) = &publication.publication_date {
                        let better = match earliest {
                            Some((_, current)) => date.as_str() < current,
                            None => true,
                        };
                        if better {
                            earliest = Some((publication.pmid.as_str(), date.as_str()));
                        }
                    }
                    reasons.push(format!("PMID{}: {}", publication.pmid, classification.reason));
                }
            }
            Some(classification) => {
                failed_result_discoveries.push(publication.pmid.clone());
                if let Some(error) = &classification.error {
                    reasons.push(format!("PMID{}: {error}", publication.pmid));
                }
            }
            None => {
                missing_classification = true;
                failed_result_discoveries.push(publication.pmid.clone());
            }
        }
    }

    let failed_publication_discoveries: Vec<String> =
        discovery_errors.iter().map(|e| format!("{}: {}", e.fn_name, e.message)).collect();

    let has_error = !failed_publication_discoveries.is_empty() || missing_classification;

    TrialSummary {
        nct_id: registration.trial_id.clone(),
        trial_id: registration.trial_id.clone(),
        tool_results: !tool_result_pmids.is_empty(),
        has_error,
        tool_prompted_pmids,
        tool_result_pmids,
        tool_ident_steps: ident_steps.into_iter().collect(),
        earliest_result_publication: earliest.map(|(pmid, _)| pmid.to_string()),
        earliest_result_publication_date: earliest.map(|(_, date)| date.to_string()),
        failed_publication_discoveries,
        failed_result_discoveries,
        reasons,
    }
}

const CSV_HEADER: &[&str] = &[
    "nct_id",
    "trial_id",
    "tool_results",
    "has_error",
    "tool_prompted_pmids",
    "tool_result_pmids",
    "tool_ident_steps",
    "earliest_result_publication",
    "earliest_result_publication_date",
    "failed_publication_discoveries",
    "failed_result_discoveries",
    "reasons",
];

fn joined(values: &[String], separator: &str) -> String {
    values.join(separator)
}

/// Append one row to the summary CSV, writing the header first if the
/// file does not exist yet.
pub fn append_csv_row(path: &Path, summary: &TrialSummary) -> Result<(), PublinkError> {
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    if write_header {
        writer.write_record(CSV_HEADER)?;
    }

    writer.write_record([
        summary.nct_id.as_str(),
        summary.trial_id.as_str(),
        if summary.tool_results { "true" } else { "false" },
        if summary.has_error { "true" } else { "false" },
        &joined(&summary.tool_prompted_pmids, ","),
        &joined(&summary.tool_result_pmids, ","),
        &joined(&summary.tool_ident_steps, ","),
        summary.earliest_result_publication.as_deref().unwrap_or(""),
        summary.earliest_result_publication_date.as_deref().unwrap_or(""),
        &joined(&summary.failed_publication_discoveries, ","),
        &joined(&summary.failed_result_discoveries, ","),
        &joined(&summary.reasons, "; "),
    ])?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct TrialSidecar<'a> {
    registration: &'a Registration,
    publications: &'a [Publication],
    filtered: &'a [Publication],
    classifications: &'a BTreeMap<String, Classification>,
    summary: &'a TrialSummary,
    timestamp: u64,
}

/// Write the full per-trial JSON sidecar: registration, final and
/// filtered publications, per-pmid classifications, the summary, and a
/// timestamp. Written before the CSV row, so it is always the more
/// complete artifact on a crash.
pub async fn write_trial_sidecar(
    output_dir: &Path,
    registration: &Registration,
    publications: &[Publication],
    filtered: &[Publication],
    classifications: &BTreeMap<String, Classification>,
    summary: &TrialSummary,
) -> Result<(), PublinkError> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let sidecar = TrialSidecar { registration, publications, filtered, classifications, summary, timestamp };
    let bytes = serde_json::to_vec_pretty(&sidecar)
        .map_err(|source| PublinkError::CacheDecode { path: "trial-sidecar".to_string(), source })?;
    let path = output_dir.join("trials").join(format!("{}.json", sanitize(&registration.trial_id)));
    crate::cache::save_atomic(&path, &bytes).await
}

#[derive(Debug, Serialize)]
struct ModelCost {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    estimated_cost_usd: f64,
}

/// Write the cost-summary sidecar: token usage grouped by model, priced
/// against the static config-level price table. Auxiliary to the run,
/// never blocking.
pub async fn write_cost_summary(
    output_dir: &Path,
    config: &crate::config::Config,
    usage_by_model: &BTreeMap<String, (u64, u64)>,
) -> Result<(), PublinkError> {
    let mut costs = Vec::new();
    for (model, (input_tokens, output_tokens)) in usage_by_model {
        let pricing = config.pricing.get(model).copied().unwrap_or_default();
        let estimated_cost_usd = (*input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (*output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
        costs.push(ModelCost { model: model.clone(), input_tokens: *input_tokens, output_tokens: *output_tokens, estimated_cost_usd });
    }
    let bytes = serde_json::to_vec_pretty(&costs)
        .map_err(|source| PublinkError::CacheDecode { path: "cost-summary".to_string(), source })?;
    crate::cache::save_atomic(&output_dir.join("cost-summary.json"), &bytes).await
}

fn sanitize(trial_id: &str) -> String {
    trial_id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;

    fn registration() -> Registration {
        Registration { trial_id: "NCT04267848".into(), brief_title: Some("t".into()), ..Default::default() }
    }

    fn publication(pmid: &str, source: &str) -> Publication {
        Publication::new(pmid, source)
    }

    #[test]
    fn summarize_marks_tool_results_true_on_any_positive_classification() {
        let registration = registration();
        let publications = vec![publication("111", "pubmed_naive"), publication("222", "google_scholar")];
        let mut classifications = BTreeMap::new();
        classifications.insert(
            "111".to_string(),
            Classification { has_results: true, reason: "matches".into(), success: true, ..Default::default() },
        );
        classifications.insert(
            "222".to_string(),
            Classification { has_results: false, reason: "unrelated".into(), success: true, ..Default::default() },
        );
        let summary = summarize(&registration, &publications, &[], &classifications);
        assert!(summary.tool_results);
        assert_eq!(summary.tool_result_pmids, vec!["111".to_string()]);
        assert!(!summary.has_error);
    }

    #[test]
    fn summarize_flags_has_error_on_missing_classification() {
        let registration = registration();
        let publications = vec![publication("111", "pubmed_naive")];
        let classifications = BTreeMap::new();
        let summary = summarize(&registration, &publications, &[], &classifications);
        assert!(summary.has_error);
        assert!(!summary.tool_results);
    }

    #[test]
    fn summarize_picks_lexicographically_earliest_positive_publication_date() {
        let registration = registration();
        let mut early = publication("111", "pubmed_naive");
        early.publication_date = Some("2020-05".into());
        let mut later = publication("222", "pubmed_naive");
        later.publication_date = Some("2021".into());
        let publications = vec![later, early];
        let mut classifications = BTreeMap::new();
        for pmid in ["111", "222"] {
            classifications.insert(
                pmid.to_string(),
                Classification { has_results: true, reason: "ok".into(), success: true, ..Default::default() },
            );
        }
        let summary = summarize(&registration, &publications, &[], &classifications);
        assert_eq!(summary.earliest_result_publication.as_deref(), Some("111"));
        assert_eq!(summary.earliest_result_publication_date.as_deref(), Some("2020-05"));
    }
}
