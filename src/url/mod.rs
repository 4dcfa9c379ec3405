//! URL handling module for Sumi-Conductor
//!
//! This module provides URL normalization (the frontier's identity key),
//! domain extraction (the key for per-domain budgets and circuits), and the
//! domain patterns used by `[[domain]]` rate rules.

mod domain;
mod matcher;
mod normalize;

use crate::ConductorError;
use url::Url;

// Re-export main functions
pub use domain::extract_domain;
pub use matcher::{most_specific, DomainPattern};
pub use normalize::normalize_url;

/// Normalizes a submitted URL and extracts its domain in one step
///
/// Any failure is reported as [`ConductorError::InvalidTask`] since this is
/// the validation performed on every submission.
pub fn task_identity(raw: &str) -> Result<(Url, String), ConductorError> {
    let invalid = |reason: String| ConductorError::InvalidTask {
        url: raw.to_string(),
        reason,
    };

    let url = normalize_url(raw).map_err(|e| invalid(e.to_string()))?;
    let domain = extract_domain(&url).ok_or_else(|| invalid("URL has no host".to_string()))?;
    Ok((url, domain))
}
