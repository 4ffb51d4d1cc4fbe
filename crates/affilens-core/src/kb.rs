//! Organization knowledge base.
//!
//! A flat list of canonical organizations with spelling variants, backed by a
//! normalized-alias lookup table. A built-in table ships inside the binary;
//! a user-supplied TOML file can be layered on top (its entries win on alias
//! collisions).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::text::{normalize_key, token_sort_similarity};
use crate::{CoreError, OrgType};

const BUILTIN_KB: &str = include_str!("data/kb.toml");

/// One canonical organization.
#[derive(Debug, Clone, Deserialize)]
pub struct KbEntry {
    pub canonical: String,
    #[serde(default)]
    pub variants: Vec<String>,
    pub country: String,
    pub country_code: String,
    #[serde(rename = "type")]
    pub org_type: OrgType,
    /// ROR identifier, e.g. "https://ror.org/00f54p054".
    #[serde(default)]
    pub ror: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl KbEntry {
    /// All names this entry answers to: canonical, variants, aliases.
    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical.as_str())
            .chain(self.variants.iter().map(String::as_str))
            .chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Deserialize)]
struct KbFile {
    #[serde(rename = "org", default)]
    orgs: Vec<KbEntry>,
}

/// A fuzzy match candidate: the best similarity any of the entry's names
/// achieved against the query.
#[derive(Debug, Clone)]
pub struct ScoredEntry<'a> {
    pub score: f64,
    pub entry: &'a KbEntry,
}

pub struct KnowledgeBase {
    entries: Vec<KbEntry>,
    /// Normalized alias → entry index. First writer wins, so earlier entries
    /// shadow later ones on alias collisions.
    lookup: HashMap<String, usize>,
}

impl KnowledgeBase {
    fn from_entries(entries: Vec<KbEntry>) -> Self {
        let mut lookup = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            for name in entry.names() {
                let key = normalize_key(name);
                if !key.is_empty() {
                    lookup.entry(key).or_insert(i);
                }
            }
        }
        Self { entries, lookup }
    }

    /// The knowledge base compiled into the binary.
    pub fn builtin() -> Self {
        let file: KbFile =
            toml::from_str(BUILTIN_KB).expect("built-in knowledge base must be valid TOML");
        Self::from_entries(file.orgs)
    }

    /// Built-in entries with an optional user file layered on top.
    ///
    /// User entries are placed first so they win alias collisions.
    pub fn load(overlay: Option<&Path>) -> Result<Self, CoreError> {
        let mut entries = match overlay {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let file: KbFile = toml::from_str(&content)
                    .map_err(|e| CoreError::Kb(format!("{}: {}", path.display(), e)))?;
                tracing::info!(path = %path.display(), entries = file.orgs.len(), "loaded knowledge base overlay");
                file.orgs
            }
            None => Vec::new(),
        };
        let builtin: KbFile =
            toml::from_str(BUILTIN_KB).expect("built-in knowledge base must be valid TOML");
        entries.extend(builtin.orgs);
        Ok(Self::from_entries(entries))
    }

    /// Exact lookup on the normalized key of `raw`.
    pub fn lookup_exact(&self, raw: &str) -> Option<&KbEntry> {
        let key = normalize_key(raw);
        self.lookup.get(&key).map(|&i| &self.entries[i])
    }

    /// Score every entry against `raw` and return the top `k`, best first.
    ///
    /// An entry's score is the maximum token-sort similarity over all of its
    /// names. Ties sort lexicographically by canonical name so results are
    /// deterministic.
    pub fn fuzzy_candidates(&self, raw: &str, k: usize) -> Vec<ScoredEntry<'_>> {
        let mut scored: Vec<ScoredEntry<'_>> = self
            .entries
            .iter()
            .map(|entry| {
                let score = entry
                    .names()
                    .map(|name| token_sort_similarity(raw, name))
                    .fold(0.0_f64, f64::max);
                ScoredEntry { score, entry }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.canonical.cmp(&b.entry.canonical))
        });
        scored.truncate(k);
        scored
    }

    pub fn entries(&self) -> &[KbEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
