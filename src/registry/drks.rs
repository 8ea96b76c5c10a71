//! German Clinical Trials Register (DRKS) adapter. DRKS renders trial
//! pages as HTML with `<dt>`/`<dd>` label/value pairs; this adapter
//! matches labels the way `euctr`'s numbered-field matcher does, and
//! collects DOI/PubMed/NCT links the same way `euctr` scrapes
//! `linked_pubmed_ids`, storing them here as `references[]` per spec.

use regex::Regex;
use scraper::{Html, Selector};

use crate::error::PublinkError;
use crate::registry::{Registration, RegistrationReference, RegistryType};
use crate::sources::drks::DrksClient;

pub async fn fetch(trial_id: &str) -> Result<Registration, PublinkError> {
    let client = DrksClient::new()?;
    let html = client.fetch_html(trial_id).await?;
    Ok(normalize(trial_id, &html))
}

/// Find the `<dd>` text immediately following a `<dt>` whose text matches
/// `label` (case-insensitive substring match, DRKS labels are long
/// prose-style phrases rather than the short codes EUCTR uses).
fn field(document: &Html, label: &str) -> Option<String> {
    let dt_selector = Selector::parse("dt").ok()?;
    let lowered_label = label.to_ascii_lowercase();
    for dt in document.select(&dt_selector) {
        let dt_text: String = dt.text().collect::<Vec<_>>().join(" ").trim().to_string();
        if !dt_text.to_ascii_lowercase().contains(&lowered_label) {
            continue;
        }
        let mut siblings = dt.next_siblings();
        while let Some(node) = siblings.next() {
            if let Some(el) = scraper::ElementRef::wrap(node)
                && el.value().name() == "dd"
            {
                let text = el.text().collect::<Vec<_>>().join(" ").trim().to_string();
                return (!text.is_empty()).then_some(text);
            }
        }
    }
    None
}

fn reference_links(html: &str) -> Vec<RegistrationReference> {
    static PMID_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    static DOI_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pmid_re =
        PMID_RE.get_or_init(|| Regex::new(r"(?:pubmed|ncbi\.nlm\.nih\.gov)\D*(\d{5,9})").expect("valid regex"));
    let doi_re = DOI_RE.get_or_init(|| Regex::new(r"\b10\.\d{4,9}/\S+\b").expect("valid regex"));

    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");

    let mut refs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if let Some(caps) = pmid_re.captures(href) {
            let pmid = caps[1].to_string();
            if seen.insert(pmid.clone()) {
                refs.push(RegistrationReference {
                    pmid: Some(pmid),
                    citation: None,
                });
            }
        } else if let Some(m) = doi_re.find(href) {
            let doi = m.as_str().trim_end_matches(['.', ',']).to_string();
            if seen.insert(doi.clone()) {
                refs.push(RegistrationReference {
                    pmid: None,
                    citation: Some(doi),
                });
            }
        }
    }
    refs
}

fn normalize(trial_id: &str, html: &str) -> Registration {
    let document = Html::parse_document(html);

    let conditions = field(&document, "indication")
        .map(|v| vec![v])
        .unwrap_or_default();
    let interventions = field(&document, "intervention")
        .map(|v| vec![v])
        .unwrap_or_default();

    Registration {
        trial_id: trial_id.to_string(),
        registry_type: Some(RegistryType::Drks),
        brief_title: field(&document, "public title"),
        official_title: field(&document, "scientific title"),
        acronym: field(&document, "acronym"),
        brief_summary: field(&document, "brief summary"),
        detailed_description: field(&document, "primary outcome"),
        overall_status: field(&document, "recruitment status"),
        start_date: field(&document, "recruitment start"),
        completion_date: field(&document, "closing date"),
        investigator_full_name: field(&document, "contact for scientific"),
        principal_investigators: field(&document, "contact for scientific")
            .into_iter()
            .collect(),
        study_type: field(&document, "study type"),
        phase: field(&document, "study phase"),
        sex: field(&document, "gender"),
        conditions,
        interventions,
        has_results: None,
        references: reference_links(html),
        linked_pubmed_ids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_html() -> &'static str {
        r#"<html><body><dl>
            <dt>Public title</dt><dd>A Study of a Thing</dd>
            <dt>Recruitment status</dt><dd>Complete</dd>
            <dt>Gender</dt><dd>Both</dd>
        </dl>
        <a href="https://pubmed.ncbi.nlm.nih.gov/123456/">pubmed link</a>
        <a href="https://doi.org/10.1000/xyz123">doi link</a>
        </body></html>"#
    }

    #[test]
    fn field_matches_label_case_insensitively() {
        let document = Html::parse_document(sample_html());
        assert_eq!(field(&document, "public title").as_deref(), Some("A Study of a Thing"));
        assert_eq!(field(&document, "gender").as_deref(), Some("Both"));
    }

    #[test]
    fn field_returns_none_for_missing_label() {
        let document = Html::parse_document(sample_html());
        assert_eq!(field(&document, "acronym"), None);
    }

    #[test]
    fn reference_links_extracts_pmid_and_doi() {
        let refs = reference_links(sample_html());
        assert!(refs.iter().any(|r| r.pmid.as_deref() == Some("123456")));
        assert!(refs.iter().any(|r| r.citation.as_deref() == Some("10.1000/xyz123")));
    }

    #[test]
    fn normalize_builds_registration() {
        let reg = normalize("DRKS00021220", sample_html());
        assert_eq!(reg.registry_type, Some(RegistryType::Drks));
        assert_eq!(reg.brief_title.as_deref(), Some("A Study of a Thing"));
        assert_eq!(reg.overall_status.as_deref(), Some("Complete"));
        assert!(reg.validate().is_ok());
    }
}
