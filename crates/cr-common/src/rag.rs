//! RAG decision tables. Every persisted `rag_status` must be derivable
//! through [`combine`]; no other code path is allowed to set it.

use crate::schema::{RagStatus, Severity};

fn rank(status: RagStatus) -> u8 {
    match status {
        RagStatus::Green => 0,
        RagStatus::Amber => 1,
        RagStatus::Red => 2,
    }
}

/// Verdict for a single (term, clause) comparison.
///
/// `matches=true, severity=none` is the only green path. A failed match or
/// a major deviation is red for mandatory terms and amber otherwise.
pub fn term_rag(matches: bool, severity: Severity, mandatory: bool) -> RagStatus {
    if matches && severity == Severity::None {
        return RagStatus::Green;
    }
    if matches && severity == Severity::Minor {
        return RagStatus::Amber;
    }
    if mandatory {
        RagStatus::Red
    } else {
        RagStatus::Amber
    }
}

/// Aggregate verdict across every term comparison touching one clause:
/// red if any constituent is red, else amber if any is amber, else green.
pub fn aggregate_parsing<I>(verdicts: I) -> RagStatus
where
    I: IntoIterator<Item = RagStatus>,
{
    verdicts
        .into_iter()
        .max_by_key(|v| rank(*v))
        .unwrap_or(RagStatus::Green)
}

/// Final verdict from library risk and parsing verdicts. Red if either is
/// red; green only if both are green; amber otherwise. Neither side can
/// override the other.
pub fn combine(risk: RagStatus, parsing: RagStatus) -> RagStatus {
    if risk == RagStatus::Red || parsing == RagStatus::Red {
        RagStatus::Red
    } else if risk == RagStatus::Green && parsing == RagStatus::Green {
        RagStatus::Green
    } else {
        RagStatus::Amber
    }
}

/// [`combine`] for rows without a library verdict (virtual rows for missing
/// mandatory terms or whole-document identity checks): the parsing verdict
/// stands alone.
pub fn combine_opt(risk: Option<RagStatus>, parsing: RagStatus) -> RagStatus {
    match risk {
        Some(risk) => combine(risk, parsing),
        None => parsing,
    }
}
