//! Core domain model for Greylit: query tiers, search results, upsert records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "greylit-core";

/// Maximum number of result items retained per site in one run.
pub const SITE_RESULT_CAP: usize = 40;

/// Items requested per search page; a shorter page signals upstream exhaustion.
pub const SEARCH_PAGE_SIZE: usize = 10;

/// One of up to three ordered search refinements. A tier with all four term
/// fields blank is inactive and is never queried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQueryTier {
    /// Terms combined with a logical AND.
    pub all_terms: String,
    /// A phrase every document must contain.
    pub exact_phrase: String,
    /// Terms of which every document must contain at least one.
    pub any_terms: String,
    /// Terms that must not appear in any document.
    pub none_terms: String,
}

impl SearchQueryTier {
    pub fn is_active(&self) -> bool {
        [
            &self.all_terms,
            &self.exact_phrase,
            &self.any_terms,
            &self.none_terms,
        ]
        .iter()
        .any(|field| !field.trim().is_empty())
    }

    /// Human-readable description of the tier's non-blank term fields, used in
    /// the per-site query label for traceability.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.all_terms.trim().is_empty() {
            parts.push(format!("AND: {}", self.all_terms.trim()));
        }
        if !self.exact_phrase.trim().is_empty() {
            parts.push(format!("EXACT: \"{}\"", self.exact_phrase.trim()));
        }
        if !self.any_terms.trim().is_empty() {
            parts.push(format!("OR: {}", self.any_terms.trim()));
        }
        if !self.none_terms.trim().is_empty() {
            parts.push(format!("NOT: {}", self.none_terms.trim()));
        }
        parts.join(" | ")
    }
}

/// One search hit, tagged with the tier that first discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultItem {
    pub link: String,
    pub title: String,
    pub snippet: String,
    /// 1-3, the first tier that returned this link. Re-discoveries by later
    /// tiers are dropped, not re-tagged.
    pub priority: u8,
}

/// Accumulated, deduplicated results for one target site. Items keep insertion
/// order: tier 1 hits first, then tier 2, then tier 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteResultSet {
    pub site: String,
    /// Consulted tiers' descriptions joined with "; ".
    pub query_label: String,
    pub items: Vec<ResultItem>,
}

impl SiteResultSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Explicit context for one interactive search run. Owned by the caller; there
/// is no ambient session state anywhere in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Per-site result sets in the order the sites were supplied.
    pub sites: Vec<SiteResultSet>,
    /// Set when every search credential was spent during this run. Partial
    /// results accumulated before exhaustion are retained.
    pub limit_exceeded: bool,
}

impl SearchRun {
    pub fn total_results(&self) -> usize {
        self.sites.iter().map(|s| s.items.len()).sum()
    }
}

/// Normalized record shape written to the tabular store. Constructed
/// transiently per item at upsert time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertRecord {
    pub title: String,
    pub link: String,
    pub snippet: String,
    /// Domain parsed from the link, empty when the link does not parse.
    pub source_domain: String,
    pub search_query: String,
    pub priority: u8,
    /// ISO-8601 date the item was scraped, UTC.
    pub scraped_at: NaiveDate,
    pub status: String,
}

/// Initial screening status assigned to every newly created record.
pub const RECORD_STATUS_TODO: &str = "Todo";

/// Aggregate counters for one upsert invocation. Monotonically incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    pub processed: usize,
    pub created: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Snapshot handed to the progress callback, once per processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertProgress {
    pub processed: usize,
    pub total: usize,
    pub created: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tier_is_inactive() {
        let tier = SearchQueryTier {
            all_terms: "   ".into(),
            ..Default::default()
        };
        assert!(!tier.is_active());
    }

    #[test]
    fn tier_with_one_field_is_active() {
        let tier = SearchQueryTier {
            any_terms: "report evaluation".into(),
            ..Default::default()
        };
        assert!(tier.is_active());
    }

    #[test]
    fn describe_renders_only_filled_fields() {
        let tier = SearchQueryTier {
            all_terms: "climate adaptation".into(),
            exact_phrase: "grey literature".into(),
            any_terms: String::new(),
            none_terms: "news".into(),
        };
        assert_eq!(
            tier.describe(),
            "AND: climate adaptation | EXACT: \"grey literature\" | NOT: news"
        );
    }

    #[test]
    fn run_totals_sum_across_sites() {
        let item = ResultItem {
            link: "https://example.org/a".into(),
            title: "A".into(),
            snippet: String::new(),
            priority: 1,
        };
        let run = SearchRun {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sites: vec![
                SiteResultSet {
                    site: "example.org".into(),
                    query_label: "AND: a".into(),
                    items: vec![item.clone(), item.clone()],
                },
                SiteResultSet {
                    site: "example.com".into(),
                    query_label: "AND: a".into(),
                    items: vec![item],
                },
            ],
            limit_exceeded: false,
        };
        assert_eq!(run.total_results(), 3);
    }
}
