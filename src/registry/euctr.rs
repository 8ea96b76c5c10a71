//! EU Clinical Trials Register adapter. Unlike ctgov this registry has no
//! JSON API: the protocol is a plain-text field dump and the results (if
//! any) live on a separate HTML page. Both are fetched in parallel.

use regex::Regex;
use scraper::{Html, Selector};

use crate::error::PublinkError;
use crate::registry::{Registration, RegistryType};
use crate::sources::euctr::EuctrClient;

pub async fn fetch(trial_id: &str) -> Result<Registration, PublinkError> {
    let client = EuctrClient::new()?;

    let (protocol, results) = tokio::join!(
        client.fetch_protocol_text(trial_id),
        client.fetch_results_html(trial_id),
    );
    let protocol_text = protocol?;
    let results_text = results.unwrap_or_default();

    Ok(normalize(trial_id, &protocol_text, &results_text))
}

/// EUCTR's protocol dump lists fields as `A.3 Title ... : value` lines;
/// pull a field's value by its numbered label.
fn field(text: &str, label: &str) -> Option<String> {
    let pattern = format!(r"(?m)^{}\b.*?:\s*(.+)$", regex::escape(label));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("not applicable"))
}

fn pmid_links(html: &str) -> Vec<String> {
    static PMID_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PMID_RE.get_or_init(|| {
        Regex::new(r"ncbi\.nlm\.nih\.gov/pubmed/(\d+)").expect("valid regex")
    });

    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");
    let mut pmids: Vec<String> = document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| re.captures(href).map(|c| c[1].to_string()))
        .collect();
    pmids.sort();
    pmids.dedup();
    pmids
}

fn has_results_indicator(html: &str) -> bool {
    let document = Html::parse_document(html);
    let selector = Selector::parse("body").expect("valid selector");
    let text: String = document
        .select(&selector)
        .flat_map(|el| el.text())
        .collect::<Vec<_>>()
        .join(" ");
    let lowered = text.to_ascii_lowercase();
    lowered.contains("global end of trial date") || lowered.contains("summary attached")
}

fn normalize(trial_id: &str, protocol_text: &str, results_html: &str) -> Registration {
    let conditions = field(protocol_text, "E.1.1")
        .map(|v| vec![v])
        .unwrap_or_default();
    let interventions = field(protocol_text, "D.3.1")
        .map(|v| vec![v])
        .unwrap_or_default();

    Registration {
        trial_id: trial_id.to_string(),
        registry_type: Some(RegistryType::Euctr),
        brief_title: field(protocol_text, "A.3"),
        official_title: field(protocol_text, "A.3.1"),
        acronym: field(protocol_text, "A.3.2"),
        brief_summary: field(protocol_text, "E.2.1"),
        detailed_description: None,
        overall_status: field(protocol_text, "P. End of Trial Status"),
        start_date: field(protocol_text, "N. Date of Competent Authority Decision"),
        completion_date: None,
        investigator_full_name: field(protocol_text, "B.1.1"),
        principal_investigators: field(protocol_text, "B.1.1").into_iter().collect(),
        study_type: field(protocol_text, "E.7"),
        phase: field(protocol_text, "E.8.1"),
        sex: None,
        conditions,
        interventions,
        has_results: Some(has_results_indicator(results_html)),
        references: Vec::new(),
        linked_pubmed_ids: pmid_links(results_html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extracts_labelled_value() {
        let text = "A.3 Title of the trial: A study of a thing\nB.1.1 Name: Jane Doe\n";
        assert_eq!(
            field(text, "A.3").as_deref(),
            Some("A study of a thing")
        );
    }

    #[test]
    fn field_returns_none_for_not_applicable() {
        let text = "A.3.2 Name or abbreviated title: Not applicable\n";
        assert_eq!(field(text, "A.3.2"), None);
    }

    #[test]
    fn pmid_links_extracts_and_dedups() {
        let html = r#"<html><body>
            <a href="http://www.ncbi.nlm.nih.gov/pubmed/123">ref</a>
            <a href="https://ncbi.nlm.nih.gov/pubmed/123">dup</a>
            <a href="https://ncbi.nlm.nih.gov/pubmed/456">ref2</a>
        </body></html>"#;
        assert_eq!(pmid_links(html), vec!["123".to_string(), "456".to_string()]);
    }

    #[test]
    fn has_results_indicator_detects_end_of_trial_date() {
        let html = "<html><body>Global end of trial date: 2019-01-01</body></html>";
        assert!(has_results_indicator(html));
    }

    #[test]
    fn has_results_indicator_false_without_markers() {
        let html = "<html><body>No results posted yet.</body></html>";
        assert!(!has_results_indicator(html));
    }
}
