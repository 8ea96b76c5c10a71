//! Date filters gating discovery before classification, plus the
//! `PartialDate` newtype every date comparison in this crate goes
//! through. Dates are one of three ISO-prefix shapes (`YYYY`,
//! `YYYY-MM`, `YYYY-MM-DD`) and are ordered as plain strings, never
//! parsed into a calendar type for the comparison itself — that is what
//! makes `"2020" < "2020-01" < "2020-01-01"` hold.

use crate::model::Publication;

/// A validated partial ISO date. Construction rejects anything that is
/// not one of the three accepted shapes; ordering is then exactly `str`
/// ordering on the inner value, which is what gives the intuitive
/// `"2020" < "2020-01" < "2020-01-01"` result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartialDate(String);

impl PartialDate {
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let bytes = trimmed.as_bytes();
        let valid = match bytes.len() {
            4 => bytes.iter().all(u8::is_ascii_digit),
            7 => {
                bytes[..4].iter().all(u8::is_ascii_digit)
                    && bytes[4] == b'-'
                    && bytes[5..7].iter().all(u8::is_ascii_digit)
            }
            10 => {
                bytes[..4].iter().all(u8::is_ascii_digit)
                    && bytes[4] == b'-'
                    && bytes[5..7].iter().all(u8::is_ascii_digit)
                    && bytes[7] == b'-'
                    && bytes[8..10].iter().all(u8::is_ascii_digit)
            }
            _ => false,
        };
        valid.then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub struct FilterOutcome {
    pub eligible: Vec<Publication>,
    pub filtered: Vec<Publication>,
}

/// Keep publications with `publicationDate < cutoff` or a missing date;
/// invalid date strings are dropped (treated as ineligible). Unknowns
/// survive, junk does not.
pub fn max_date_filter(pubs: Vec<Publication>, cutoff: &str) -> FilterOutcome {
    let Some(cutoff) = PartialDate::parse(cutoff) else {
        // A misconfigured cutoff keeps nothing filterable; treat every
        // publication as eligible rather than silently dropping all of
        // them on an operator typo.
        return FilterOutcome { eligible: pubs, filtered: Vec::new() };
    };

    let mut eligible = Vec::new();
    let mut filtered = Vec::new();
    for publication in pubs {
        match &publication.publication_date {
            None => eligible.push(publication),
            Some(date) => match PartialDate::parse(date) {
                Some(parsed) if parsed < cutoff => eligible.push(publication),
                Some(_) => filtered.push(publication),
                None => filtered.push(publication),
            },
        }
    }
    FilterOutcome { eligible, filtered }
}

/// Drop publications that clearly predate `start_date`; missing dates
/// (on the publication or on the registration) are always kept.
pub fn min_date_filter(pubs: Vec<Publication>, start_date: Option<&str>) -> FilterOutcome {
    let Some(start) = start_date.and_then(PartialDate::parse) else {
        return FilterOutcome { eligible: pubs, filtered: Vec::new() };
    };

    let mut eligible = Vec::new();
    let mut filtered = Vec::new();
    for publication in pubs {
        match &publication.publication_date {
            None => eligible.push(publication),
            Some(date) => match PartialDate::parse(date) {
                Some(parsed) if parsed < start => filtered.push(publication),
                _ => eligible.push(publication),
            },
        }
    }
    FilterOutcome { eligible, filtered }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_date_orders_by_string_prefix() {
        let year = PartialDate::parse("2020").unwrap();
        let month = PartialDate::parse("2020-01").unwrap();
        let day = PartialDate::parse("2020-01-01").unwrap();
        assert!(year < month);
        assert!(month < day);
    }

    #[test]
    fn partial_date_rejects_malformed_input() {
        assert!(PartialDate::parse("not-a-date").is_none());
        assert!(PartialDate::parse("2020-13").is_some()); // shape-valid, calendar-invalid is out of scope
        assert!(PartialDate::parse("").is_none());
    }

    fn publication(pmid: &str, date: Option<&str>) -> Publication {
        Publication {
            pmid: pmid.to_string(),
            publication_date: date.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn min_date_filter_drops_publications_before_start() {
        let pubs = vec![
            publication("A", Some("2009-12")),
            publication("B", Some("2012")),
            publication("C", None),
        ];
        let outcome = min_date_filter(pubs, Some("2010-01-01"));
        let ids: Vec<&str> = outcome.eligible.iter().map(|p| p.pmid.as_str()).collect();
        assert_eq!(ids, vec!["B", "C"]);
    }

    #[test]
    fn min_date_filter_keeps_everything_when_start_date_missing() {
        let pubs = vec![publication("A", Some("2009")), publication("B", None)];
        let outcome = min_date_filter(pubs, None);
        assert_eq!(outcome.eligible.len(), 2);
        assert!(outcome.filtered.is_empty());
    }

    #[test]
    fn max_date_filter_keeps_unknown_dates() {
        let pubs = vec![publication("A", None), publication("B", Some("2019"))];
        let outcome = max_date_filter(pubs, "2020-11-17");
        assert_eq!(outcome.eligible.len(), 2);
    }

    #[test]
    fn max_date_filter_drops_dates_at_or_after_cutoff() {
        let pubs = vec![publication("A", Some("2020-11-17")), publication("B", Some("2021"))];
        let outcome = max_date_filter(pubs, "2020-11-17");
        assert!(outcome.eligible.is_empty());
        assert_eq!(outcome.filtered.len(), 2);
    }

    #[test]
    fn max_date_filter_drops_invalid_date_strings() {
        let pubs = vec![publication("A", Some("not-a-date"))];
        let outcome = max_date_filter(pubs, "2020-11-17");
        assert!(outcome.eligible.is_empty());
        assert_eq!(outcome.filtered.len(), 1);
    }
}
