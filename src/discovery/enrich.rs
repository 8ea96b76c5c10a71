//! Deduplication, fusion, and PubMed enrichment: turns the union of every
//! strategy's candidates into the final per-trial `Publication[]`.

use std::collections::BTreeSet;

use crate::cache::{CacheType, Store};
use crate::model::{Candidate, Publication, StrategyId};
use crate::sources::pubmed::{PubmedClient, PubmedRecord};
use crate::error::PublinkError;

/// Union candidates across strategies, deduplicating by PMID while
/// unioning each entry's `sources` set. Idempotent: running dedup twice
/// on its own output is a no-op.
pub fn dedup(per_strategy: Vec<(StrategyId, Vec<Candidate>)>) -> Vec<Publication> {
    let mut by_pmid: std::collections::BTreeMap<String, Publication> = std::collections::BTreeMap::new();

    for (strategy_id, candidates) in per_strategy {
        for candidate in candidates {
            let entry = by_pmid.entry(candidate.pmid.clone()).or_insert_with(|| Publication {
                pmid: candidate.pmid.clone(),
                sources: BTreeSet::new(),
                ..Default::default()
            });
            entry.sources.insert(strategy_id.clone());
            if entry.publication_date.is_none() {
                entry.publication_date = candidate.publication_date.clone();
            }
        }
    }

    by_pmid.into_values().collect()
}

/// Batch-fetch PubMed records for every PMID in `candidates` and merge
/// them in, keyed primarily by PMID and falling back to DOI. An
/// enrichment record's `publicationDate` overwrites any
/// strategy-provided date once a record is available for that PMID; the
/// strategy-provided date survives only when no record could be fetched
/// for it.
///
/// Records are read through `publications_store` by PMID first, so a
/// PMID already enriched for one trial is never re-fetched from PubMed
/// when it resurfaces for another (the same content-addressed caching
/// `registrations_store` gives trial registrations).
pub async fn enrich(
    client: &PubmedClient,
    store: &Store,
    ttl_seconds: u64,
    candidates: Vec<Publication>,
) -> Result<Vec<Publication>, PublinkError> {
    let pmids: Vec<String> = candidates.iter().map(|c| c.pmid.clone()).collect();

    let mut by_pmid: std::collections::HashMap<String, PubmedRecord> = std::collections::HashMap::new();
    let mut misses = Vec::new();
    for pmid in &pmids {
        match store.read::<PubmedRecord>(pmid).await? {
            Some(record) => {
                by_pmid.insert(pmid.clone(), record);
            }
            None => misses.push(pmid.clone()),
        }
    }

    if !misses.is_empty() {
        let fetched = client.fetch_refs(&misses).await?;
        for record in fetched {
            store.write(&record.pmid, CacheType::Publication, ttl_seconds, &record).await?;
            by_pmid.insert(record.pmid.clone(), record);
        }
    }
    let mut by_doi: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for (pmid, record) in &by_pmid {
        if let Some(doi) = &record.doi {
            by_doi.insert(doi.clone(), pmid.clone());
        }
    }

    let mut merged = Vec::with_capacity(candidates.len());
    for mut publication in candidates {
        let matched_pmid = if by_pmid.contains_key(&publication.pmid) {
            Some(publication.pmid.clone())
        } else {
            publication
                .doi
                .as_ref()
                .and_then(|doi| by_doi.get(doi).cloned())
        };

        if let Some(pmid) = matched_pmid
            && let Some(record) = by_pmid.remove(&pmid)
        {
            publication.title = record.title.or(publication.title);
            publication.authors = (!record.authors.is_empty())
                .then(|| record.authors.join(", "))
                .or(publication.authors);
            publication.abstract_text = record.abstract_text.or(publication.abstract_text);
            publication.doi = record.doi.or(publication.doi);
            publication.nct_ids = if record.nct_ids.is_empty() {
                publication.nct_ids
            } else {
                record.nct_ids
            };
            if let Some(date) = record.publication_date {
                publication.publication_date = Some(date);
            }
        }

        merged.push(publication);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_unions_sources_for_shared_pmids() {
        let per_strategy = vec![
            ("strategy_a".to_string(), vec![Candidate { pmid: "222".into(), publication_date: None }]),
            ("strategy_b".to_string(), vec![Candidate { pmid: "222".into(), publication_date: None }]),
            ("strategy_c".to_string(), vec![Candidate { pmid: "333".into(), publication_date: None }]),
        ];
        let publications = dedup(per_strategy);
        assert_eq!(publications.len(), 2);
        let p222 = publications.iter().find(|p| p.pmid == "222").unwrap();
        assert_eq!(p222.sources.len(), 2);
        let p333 = publications.iter().find(|p| p.pmid == "333").unwrap();
        assert_eq!(p333.sources.len(), 1);
    }

    #[test]
    fn dedup_of_dedup_is_a_no_op() {
        let per_strategy = vec![("s".to_string(), vec![Candidate { pmid: "1".into(), publication_date: None }])];
        let once = dedup(per_strategy);
        let twice = dedup(vec![("s".to_string(), once.iter().map(|p| Candidate {
            pmid: p.pmid.clone(),
            publication_date: p.publication_date.clone(),
        }).collect())]);
        assert_eq!(once.len(), twice.len());
    }
}
