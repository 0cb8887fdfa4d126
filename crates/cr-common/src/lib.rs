//! Contract reconciliation core.
//!
//! A queue-driven pipeline ingests uploaded contracts, and this crate's
//! reconciliation engine compares the extracted clauses against a deal's
//! pre-agreed commercial terms: identity short-circuit, multi-strategy
//! clause selection, batched semantic comparison, and a deterministic
//! red/amber/green verdict per clause, with discrepancies and review-queue
//! entries for anything a human should look at.

pub mod cache;
pub mod compare;
pub mod db;
pub mod identity;
pub mod linemap;
pub mod logging;
pub mod queue;
pub mod rag;
pub mod recon;
pub mod schema;
pub mod selection;
pub mod stages;
