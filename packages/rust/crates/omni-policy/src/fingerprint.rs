//! Context fingerprinting.
//!
//! A fingerprint summarizes "the situation" an action is chosen in: intent
//! keywords, the previous action and how far into the session we are. It is
//! the state key of the policy table.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PolicyError, PolicyResult};

/// Hex length of a SHA-256 fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

/// Consolidation-domain terms recognized in intent text.
pub const DEFAULT_DOMAIN_VOCABULARY: &[&str] = &[
    "dimension",
    "member",
    "account",
    "entity",
    "period",
    "scenario",
    "journal",
    "consolidation",
    "report",
    "data",
    "retrieve",
    "export",
    "import",
    "rule",
    "job",
    "status",
    "hierarchy",
    "balance",
    "currency",
];

/// Deterministic digest of a situation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct ContextFingerprint(String);

impl ContextFingerprint {
    /// Validate an externally supplied fingerprint (64 lowercase hex chars).
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] on wrong length or alphabet.
    pub fn parse(raw: &str) -> PolicyResult<Self> {
        let raw = raw.trim();
        if raw.len() != FINGERPRINT_LEN {
            return Err(PolicyError::invalid(format!(
                "context fingerprint must be {FINGERPRINT_LEN} hex chars, got {}",
                raw.len()
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(PolicyError::invalid(
                "context fingerprint must be lowercase hex",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContextFingerprint {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContextFingerprint {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContextFingerprint> for String {
    fn from(value: ContextFingerprint) -> Self {
        value.0
    }
}

// Field order is alphabetical so the serialized form is canonical.
#[derive(Serialize)]
struct CanonicalContext<'a> {
    keywords: Vec<&'a str>,
    previous_action: &'a str,
    session_length: u64,
}

/// Builds [`ContextFingerprint`]s from intent text and session position.
#[derive(Debug, Clone)]
pub struct ContextFingerprinter {
    vocabulary: Vec<String>,
    leading_tokens: usize,
}

impl ContextFingerprinter {
    /// Create a fingerprinter over a vocabulary.
    #[must_use]
    pub fn new(vocabulary: Vec<String>, leading_tokens: usize) -> Self {
        let vocabulary = vocabulary
            .into_iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self {
            vocabulary,
            leading_tokens,
        }
    }

    /// Vocabulary terms present in the text plus its leading tokens.
    #[must_use]
    pub fn extract_keywords(&self, intent: &str) -> BTreeSet<String> {
        let lowered = intent.to_lowercase();
        let mut keywords: BTreeSet<String> = self
            .vocabulary
            .iter()
            .filter(|term| lowered.contains(term.as_str()))
            .cloned()
            .collect();
        keywords.extend(
            lowered
                .split_whitespace()
                .take(self.leading_tokens)
                .map(str::to_string),
        );
        keywords
    }

    /// Fingerprint a situation.
    #[must_use]
    pub fn fingerprint(
        &self,
        intent: &str,
        previous_action: Option<&str>,
        session_length: u64,
    ) -> ContextFingerprint {
        let keywords = self.extract_keywords(intent);
        let canonical = CanonicalContext {
            keywords: keywords.iter().map(String::as_str).collect(),
            previous_action: previous_action.unwrap_or(""),
            session_length,
        };
        // Serializing a struct of strings and integers cannot fail.
        let payload = serde_json::to_vec(&canonical).unwrap_or_default();
        ContextFingerprint(hex::encode(Sha256::digest(&payload)))
    }
}

impl Default for ContextFingerprinter {
    fn default() -> Self {
        Self::new(
            DEFAULT_DOMAIN_VOCABULARY
                .iter()
                .map(ToString::to_string)
                .collect(),
            5,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_merge_vocabulary_and_leading_tokens() {
        let fingerprinter = ContextFingerprinter::default();
        let keywords = fingerprinter.extract_keywords("Show Journal status for entity E01 now please");
        assert!(keywords.contains("journal"));
        assert!(keywords.contains("status"));
        assert!(keywords.contains("entity"));
        assert!(keywords.contains("show"));
        assert!(!keywords.contains("please"));
    }

    #[test]
    fn empty_intent_has_no_keywords() {
        assert!(ContextFingerprinter::default().extract_keywords("").is_empty());
    }
}
