//! Identity-category term matching.
//!
//! Names (counterparties, talent, brands) do not need a semantic
//! comparison: the question is only whether the expected value appears in
//! the document. Terms in an identity category short-circuit here and are
//! never routed to the batch comparator.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use strsim::damerau_levenshtein;
use unicode_normalization::UnicodeNormalization;

use crate::schema::{IdentityMatchType, RagStatus};

/// Token coverage below this never counts as a partial match.
const PARTIAL_COVERAGE_THRESHOLD: f64 = 0.5;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

static IDENTITY_CATEGORIES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "counterparty_name",
        "company_name",
        "talent_name",
        "artist_name",
        "brand_name",
        "manager_name",
    ]
    .into_iter()
    .collect()
});

/// Result of checking one identity term against document text.
///
/// `matches` is true for `exact` and `normalized` hits; a `partial` hit
/// found something similar but not the agreed value.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub matches: bool,
    pub match_type: IdentityMatchType,
    pub confidence: f64,
    pub found_value: Option<String>,
}

pub fn is_identity_category(category: &str) -> bool {
    IDENTITY_CATEGORIES.contains(category)
}

/// Case-fold, NFKC-normalize, strip punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    NON_ALNUM.replace_all(&folded, " ").trim().to_string()
}

fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

fn token_found(expected: &str, doc_tokens: &[&str]) -> bool {
    doc_tokens.iter().any(|candidate| {
        if *candidate == expected {
            return true;
        }
        // One edit of tolerance for longer tokens only; short tokens must
        // match exactly or "inc"/"ltd" style noise matches everything.
        expected.len() > 3 && candidate.len() > 3 && damerau_levenshtein(candidate, expected) <= 1
    })
}

/// Check whether `expected` is satisfied by `text`.
pub fn match_identity(expected: &str, text: &str) -> IdentityMatch {
    let expected_raw = expected.trim();
    if expected_raw.is_empty() {
        return IdentityMatch {
            matches: false,
            match_type: IdentityMatchType::Absent,
            confidence: 0.0,
            found_value: None,
        };
    }

    if text.contains(expected_raw) {
        return IdentityMatch {
            matches: true,
            match_type: IdentityMatchType::Exact,
            confidence: 1.0,
            found_value: Some(expected_raw.to_string()),
        };
    }

    let expected_norm = normalize(expected_raw);
    let text_norm = normalize(text);
    if !expected_norm.is_empty() && text_norm.contains(&expected_norm) {
        return IdentityMatch {
            matches: true,
            match_type: IdentityMatchType::Normalized,
            confidence: 0.85,
            found_value: Some(expected_norm),
        };
    }

    let expected_tokens = tokens(&expected_norm);
    let doc_tokens = tokens(&text_norm);
    if !expected_tokens.is_empty() && !doc_tokens.is_empty() {
        let found = expected_tokens
            .iter()
            .filter(|token| token_found(token, &doc_tokens))
            .count();
        let coverage = found as f64 / expected_tokens.len() as f64;
        if coverage >= PARTIAL_COVERAGE_THRESHOLD {
            return IdentityMatch {
                matches: false,
                match_type: IdentityMatchType::Partial,
                confidence: 0.6,
                found_value: None,
            };
        }
    }

    IdentityMatch {
        matches: false,
        match_type: IdentityMatchType::Absent,
        confidence: 0.0,
        found_value: None,
    }
}

/// RAG mapping for identity checks: exact/normalized are green, partial is
/// amber, absent is red only when the term is mandatory.
pub fn identity_rag(result: &IdentityMatch, mandatory: bool) -> RagStatus {
    match result.match_type {
        IdentityMatchType::Exact | IdentityMatchType::Normalized => RagStatus::Green,
        IdentityMatchType::Partial => RagStatus::Amber,
        IdentityMatchType::Absent => {
            if mandatory {
                RagStatus::Red
            } else {
                RagStatus::Amber
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_categories_are_recognised() {
        assert!(is_identity_category("counterparty_name"));
        assert!(is_identity_category("talent_name"));
        assert!(!is_identity_category("payment_terms"));
    }

    #[test]
    fn exact_substring_wins_with_full_confidence() {
        let result = match_identity("Acme Inc.", "between Acme Inc. and the Artist");
        assert_eq!(result.match_type, IdentityMatchType::Exact);
        assert!(result.matches);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.found_value.as_deref(), Some("Acme Inc."));
    }

    #[test]
    fn formatting_differences_fall_back_to_normalized() {
        let result = match_identity("Acme Inc.", "THIS AGREEMENT is made by ACME   INC. (the Company)");
        assert_eq!(result.match_type, IdentityMatchType::Normalized);
        assert!(result.matches);
        assert_eq!(result.confidence, 0.85);
    }

    #[test]
    fn token_overlap_yields_partial() {
        let result = match_identity(
            "Acme Media Group Limited",
            "services provided to Acme Media under this agreement",
        );
        assert_eq!(result.match_type, IdentityMatchType::Partial);
        assert!(!result.matches);
        assert_eq!(result.confidence, 0.6);
    }

    #[test]
    fn single_edit_typos_still_count_toward_coverage() {
        let result = match_identity("John Smithson", "signed by Jhon Smithson as talent");
        assert!(matches!(
            result.match_type,
            IdentityMatchType::Partial | IdentityMatchType::Normalized
        ));
    }

    #[test]
    fn absent_value_scores_zero() {
        let result = match_identity("Acme Inc.", "this text never names the company");
        assert_eq!(result.match_type, IdentityMatchType::Absent);
        assert!(!result.matches);
        assert_eq!(result.confidence, 0.0);
        assert!(result.found_value.is_none());
    }

    #[test]
    fn empty_expected_value_is_absent() {
        let result = match_identity("   ", "anything");
        assert_eq!(result.match_type, IdentityMatchType::Absent);
    }

    #[test]
    fn rag_mapping_follows_match_type_and_mandatory_flag() {
        let exact = match_identity("Acme", "Acme");
        assert_eq!(identity_rag(&exact, true), RagStatus::Green);

        let absent = match_identity("Acme", "nothing here");
        assert_eq!(identity_rag(&absent, true), RagStatus::Red);
        assert_eq!(identity_rag(&absent, false), RagStatus::Amber);

        let partial = match_identity("Acme Media Group", "Acme Media appears");
        assert_eq!(identity_rag(&partial, true), RagStatus::Amber);
    }

    #[test]
    fn normalize_collapses_punctuation_and_case() {
        assert_eq!(normalize("  ACME,   Inc. "), "acme inc");
        assert_eq!(normalize("Ｎｅｔ ３０"), "net 30");
    }
}
