//! Candidate clause selection for pre-agreed terms.
//!
//! A fixed, ordered list of strategies proposes clauses to compare a term
//! against. Results are merged and deduplicated by clause id; the first
//! strategy to select a clause owns its selection reason, which is carried
//! through to the analysis blob for auditability.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::schema::{ClauseBoundary, PreAgreedTerm, SelectionStrategy};

/// Minimum precomputed library similarity for the embedding fallback.
pub const EMBEDDING_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Keyword tokens shorter than this match too much boilerplate.
const MIN_KEYWORD_LEN: usize = 4;

static TYPE_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Broader category → plausible clause types, for terms whose category does
/// not literally equal a clause type.
static FALLBACK_TYPES: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        ("payment_terms", &["payment", "fees", "compensation", "invoicing"]),
        ("term", &["term", "duration"]),
        ("termination", &["termination", "term"]),
        ("exclusivity", &["exclusivity", "non_compete"]),
        ("usage_rights", &["usage_rights", "license", "intellectual_property"]),
        ("territory", &["territory", "governing_law"]),
        ("deliverables", &["deliverables", "services", "scope_of_work"]),
        ("confidentiality", &["confidentiality", "non_disclosure"]),
        ("governing_law", &["governing_law", "jurisdiction"]),
        ("indemnification", &["indemnification", "liability"]),
    ];
    entries.iter().copied().collect()
});

/// Canonical form for clause-type comparison: lowercase, separators to `_`.
pub fn normalize_type(raw: &str) -> String {
    TYPE_SEPARATORS
        .replace_all(&raw.trim().to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

/// A clause proposed for comparison, tagged with the strategy that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub clause: &'a ClauseBoundary,
    pub strategy: SelectionStrategy,
}

/// Per-document clause lookup, built once so each term's selection is O(1)
/// per related type instead of a scan over the full clause list.
pub struct ClauseIndex<'a> {
    by_type: HashMap<String, Vec<&'a ClauseBoundary>>,
    all: &'a [ClauseBoundary],
}

impl<'a> ClauseIndex<'a> {
    pub fn build(clauses: &'a [ClauseBoundary]) -> Self {
        let mut by_type: HashMap<String, Vec<&'a ClauseBoundary>> = HashMap::new();
        for clause in clauses {
            by_type
                .entry(normalize_type(&clause.clause_type))
                .or_default()
                .push(clause);
        }
        Self { by_type, all: clauses }
    }

    fn of_type(&self, normalized: &str) -> &[&'a ClauseBoundary] {
        self.by_type.get(normalized).map(Vec::as_slice).unwrap_or(&[])
    }
}

trait SelectStrategy {
    fn strategy(&self) -> SelectionStrategy;

    /// Whether this strategy runs only when earlier strategies found nothing.
    fn only_as_fallback(&self) -> bool {
        false
    }

    fn select<'a>(&self, term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<&'a ClauseBoundary>;
}

/// Clause types directly declared on the term.
struct TypeMatch;

impl SelectStrategy for TypeMatch {
    fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::TypeMatch
    }

    fn select<'a>(&self, term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<&'a ClauseBoundary> {
        term.related_clause_types
            .iter()
            .flat_map(|raw| index.of_type(&normalize_type(raw)).iter().copied())
            .collect()
    }
}

/// Category → plausible clause types via the static fallback map.
struct FallbackType;

impl SelectStrategy for FallbackType {
    fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::FallbackType
    }

    fn select<'a>(&self, term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<&'a ClauseBoundary> {
        let Some(types) = FALLBACK_TYPES.get(normalize_type(&term.category).as_str()) else {
            return Vec::new();
        };
        types
            .iter()
            .flat_map(|ty| index.of_type(ty).iter().copied())
            .collect()
    }
}

/// Free-text keyword lookup against clause content and type, engaged only
/// when the structural strategies found nothing.
struct KeywordMatch;

impl KeywordMatch {
    fn keywords(term: &PreAgreedTerm) -> Vec<String> {
        let source = format!("{} {}", term.category, term.expected_value);
        let mut seen = HashSet::new();
        TYPE_SEPARATORS
            .split(&source.to_lowercase())
            .filter(|token| token.len() >= MIN_KEYWORD_LEN)
            .filter(|token| seen.insert(token.to_string()))
            .map(str::to_string)
            .collect()
    }
}

impl SelectStrategy for KeywordMatch {
    fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::Keyword
    }

    fn only_as_fallback(&self) -> bool {
        true
    }

    fn select<'a>(&self, term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<&'a ClauseBoundary> {
        let keywords = Self::keywords(term);
        if keywords.is_empty() {
            return Vec::new();
        }

        index
            .all
            .iter()
            .filter(|clause| {
                let haystack =
                    format!("{} {}", clause.clause_type, clause.content).to_lowercase();
                keywords.iter().any(|kw| haystack.contains(kw.as_str()))
            })
            .collect()
    }
}

/// Last resort: accept clauses whose precomputed vector-search similarity
/// clears a fixed threshold.
struct EmbeddingSimilarity {
    threshold: f64,
}

impl SelectStrategy for EmbeddingSimilarity {
    fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::EmbeddingSimilarity
    }

    fn only_as_fallback(&self) -> bool {
        true
    }

    fn select<'a>(&self, _term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<&'a ClauseBoundary> {
        let mut hits: Vec<&'a ClauseBoundary> = index
            .all
            .iter()
            .filter(|clause| clause.library_similarity.unwrap_or(0.0) >= self.threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.library_similarity
                .partial_cmp(&a.library_similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits
    }
}

pub struct ClauseSelector {
    strategies: Vec<Box<dyn SelectStrategy + Send + Sync>>,
}

impl Default for ClauseSelector {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(TypeMatch),
                Box::new(FallbackType),
                Box::new(KeywordMatch),
                Box::new(EmbeddingSimilarity {
                    threshold: EMBEDDING_SIMILARITY_THRESHOLD,
                }),
            ],
        }
    }
}

impl ClauseSelector {
    /// Ranked, deduplicated candidates for one term. An empty result means
    /// the term is missing from the document; the orchestrator decides what
    /// that implies.
    pub fn select<'a>(&self, term: &PreAgreedTerm, index: &ClauseIndex<'a>) -> Vec<Candidate<'a>> {
        let mut seen: HashSet<i64> = HashSet::new();
        let mut out: Vec<Candidate<'a>> = Vec::new();

        for strategy in &self.strategies {
            if strategy.only_as_fallback() && !out.is_empty() {
                continue;
            }
            for clause in strategy.select(term, index) {
                if seen.insert(clause.id) {
                    out.push(Candidate {
                        clause,
                        strategy: strategy.strategy(),
                    });
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(id: i64, clause_type: &str, content: &str) -> ClauseBoundary {
        ClauseBoundary {
            id,
            document_id: 1,
            clause_type: clause_type.into(),
            content: content.into(),
            confidence: 0.9,
            start_char: 0,
            end_char: content.len(),
            section_title: None,
            library_similarity: None,
        }
    }

    fn term(category: &str, expected: &str, related: &[&str]) -> PreAgreedTerm {
        PreAgreedTerm {
            id: 1,
            deal_id: 1,
            category: category.into(),
            expected_value: expected.into(),
            mandatory: true,
            related_clause_types: related.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn declared_type_match_comes_first() {
        let clauses = vec![
            clause(1, "payment", "Payment shall be made within 30 days of invoice"),
            clause(2, "termination", "Either party may terminate"),
        ];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        let candidates = selector.select(&term("payment_terms", "Net 30", &["payment"]), &index);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].clause.id, 1);
        assert_eq!(candidates[0].strategy, SelectionStrategy::TypeMatch);
    }

    #[test]
    fn type_normalization_bridges_naming_styles() {
        let clauses = vec![clause(1, "Payment Terms", "Net 30 from invoice date")];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        let candidates = selector.select(&term("payment", "Net 30", &["payment-terms"]), &index);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].strategy, SelectionStrategy::TypeMatch);
    }

    #[test]
    fn fallback_map_covers_category_aliases() {
        let clauses = vec![clause(1, "fees", "A fee of £10,000 is payable")];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        // No declared related types; category routes through the fallback map.
        let candidates = selector.select(&term("payment_terms", "£10,000", &[]), &index);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].strategy, SelectionStrategy::FallbackType);
    }

    #[test]
    fn first_strategy_owns_the_selection_reason() {
        let clauses = vec![clause(1, "payment", "Payment within 30 days")];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        // Both type match (declared) and fallback map would select clause 1.
        let candidates = selector.select(&term("payment_terms", "Net 30", &["payment"]), &index);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].strategy, SelectionStrategy::TypeMatch);
    }

    #[test]
    fn keyword_match_engages_only_when_structural_finds_nothing() {
        let clauses = vec![
            clause(1, "general", "All deliverables are due by March"),
            clause(2, "payment", "Payment within 30 days"),
        ];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        // Structural match exists: keyword must not widen the result.
        let structural = selector.select(&term("payment_terms", "deliverables", &["payment"]), &index);
        assert_eq!(structural.len(), 1);
        assert_eq!(structural[0].strategy, SelectionStrategy::TypeMatch);

        // No structural match: keyword lookup kicks in.
        let keyword = selector.select(&term("deliverables", "due by March", &[]), &index);
        assert!(!keyword.is_empty());
        assert!(keyword.iter().any(|c| c.clause.id == 1));
        assert!(keyword.iter().all(|c| c.strategy == SelectionStrategy::Keyword));
    }

    #[test]
    fn embedding_fallback_requires_all_other_strategies_empty() {
        let mut similar = clause(1, "miscellaneous", "zzz");
        similar.library_similarity = Some(0.9);
        let mut dissimilar = clause(2, "miscellaneous", "yyy");
        dissimilar.library_similarity = Some(0.3);
        let clauses = vec![similar, dissimilar];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        let candidates = selector.select(&term("bespoke_category", "qqq", &[]), &index);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].clause.id, 1);
        assert_eq!(candidates[0].strategy, SelectionStrategy::EmbeddingSimilarity);
    }

    #[test]
    fn zero_candidates_is_an_explicit_empty_result() {
        let clauses = vec![clause(1, "miscellaneous", "zzz")];
        let index = ClauseIndex::build(&clauses);
        let selector = ClauseSelector::default();

        let candidates = selector.select(&term("bespoke_category", "qqq", &[]), &index);
        assert!(candidates.is_empty());
    }
}
