//! Canonical child keys.
//!
//! Records live under a key derived from the child's display name. This
//! module owns that derivation and the [`ChildKey`] type that carries its
//! result around the rest of the crate.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalize a human-entered display name into a canonical key.
///
/// The name is lowercased and trimmed, then every character outside
/// `[a-z0-9]` becomes `_`. Non-ASCII letters are replaced as well, so
/// `"Aïda Mwangi"` becomes `"a_da_mwangi"`.
///
/// Two different names can normalize to the same key. No attempt is made to
/// tell them apart.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A non-empty canonical key identifying a child record.
///
/// Keys built through [`ChildKey::from_display_name`] are always normalized.
/// [`ChildKey::from_stored`] accepts whatever key a record currently lives
/// under, which may not be normalized (that mismatch is what reconciliation
/// repairs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildKey(String);

impl ChildKey {
    /// Derive the canonical key for a display name.
    ///
    /// Returns `None` when the name normalizes to the empty string.
    #[must_use]
    pub fn from_display_name(name: &str) -> Option<Self> {
        let key = normalize(name);
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    /// Wrap a key exactly as it appears in the store.
    ///
    /// Returns `None` for the empty string.
    #[must_use]
    pub fn from_stored(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this key is the canonical key for `display_name`.
    #[must_use]
    pub fn matches_display_name(&self, display_name: &str) -> bool {
        normalize(display_name) == self.0
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChildKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Split a comma-separated list of display names.
///
/// Names are trimmed and empty entries dropped. When several names share a
/// canonical key, only the first spelling is kept.
#[must_use]
pub fn parse_display_names(input: &str) -> Vec<String> {
    dedupe_names(input.split(','))
}

/// Trim, drop empty names, and keep the first name for each canonical key.
pub fn dedupe_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref().trim();
            let key = normalize(name);
            (!key.is_empty() && seen.insert(key)).then(|| name.to_string())
        })
        .collect()
}

/// Find the key closest to `name` by edit distance.
///
/// Only keys within `max(2, len / 3)` edits of the normalized name are
/// considered. Ties go to the key that sorts first.
pub fn closest_key<'a, I>(name: &str, keys: I) -> Option<&'a ChildKey>
where
    I: IntoIterator<Item = &'a ChildKey>,
{
    let target = normalize(name);
    if target.is_empty() {
        return None;
    }
    let bound = (target.chars().count() / 3).max(2);

    keys.into_iter()
        .map(|key| (levenshtein(&target, key.as_str()), key))
        .filter(|(distance, _)| *distance <= bound)
        .min_by(|(da, ka), (db, kb)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(_, key)| key)
}

/// Levenshtein edit distance between two strings, counted in chars.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}
