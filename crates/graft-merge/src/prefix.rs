//! Prefix normalization.
//!
//! Every prefix is reduced to a canonical form: leading and trailing dots are
//! stripped and exactly one trailing dot is appended, so `"image_encoder"`,
//! `".image_encoder."` and `"image_encoder.."` all become `"image_encoder."`.
//! A prefix that is empty after stripping stays empty and never matches.

use graft_core::PrefixSpec;

/// Canonical form of a single prefix.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('.');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}.")
    }
}

/// Whether `key` falls under a normalized prefix. Empty prefixes match nothing.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    !prefix.is_empty() && key.starts_with(prefix)
}

/// A [`PrefixSpec`] with every prefix in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPrefixes {
    target: String,
    replace: String,
    skip: Vec<String>,
}

impl NormalizedPrefixes {
    /// Normalize a spec. The replace prefix falls back to the target prefix.
    pub fn new(spec: &PrefixSpec) -> Self {
        let mut skip: Vec<String> = spec
            .skip_prefixes
            .iter()
            .map(|p| normalize_prefix(p))
            .filter(|p| !p.is_empty())
            .collect();
        skip.sort();
        skip.dedup();

        Self {
            target: normalize_prefix(&spec.target_prefix),
            replace: normalize_prefix(spec.effective_replace_prefix()),
            skip,
        }
    }

    /// Prefix prepended to student keys.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Prefix of teacher keys superseded by the student.
    pub fn replace(&self) -> &str {
        &self.replace
    }

    /// Prefixes of teacher keys dropped unconditionally.
    pub fn skip(&self) -> &[String] {
        &self.skip
    }

    /// Rewrite a student key into the merged namespace.
    pub fn rewrite_student_key(&self, key: &str) -> String {
        format!("{}{}", self.target, key)
    }

    /// Whether a teacher key is superseded by the student.
    pub fn is_replaced(&self, key: &str) -> bool {
        matches_prefix(key, &self.replace)
    }

    /// The first skip prefix covering a teacher key.
    pub fn skip_match(&self, key: &str) -> Option<&str> {
        self.skip
            .iter()
            .find(|p| matches_prefix(key, p))
            .map(String::as_str)
    }
}
