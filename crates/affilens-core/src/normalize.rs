//! Three-rung affiliation normalization.
//!
//! Rung 1: exact knowledge-base lookup on the normalized key.
//! Rung 2: fuzzy token-sort matching; the best candidate is accepted outright
//!         at or above `tau_high`.
//! Rung 3: LLM fallback, offered the top fuzzy candidates above `tau_low`.
//!
//! Results are memoized per normalized key, so a raw string appearing under
//! many authors is resolved once per run. An LLM failure is not memoized.

use std::sync::Arc;

use affilens_llm::{LlmClient, LlmRequest, Message};
use dashmap::DashMap;
use serde::Deserialize;

use crate::kb::{KbEntry, KnowledgeBase};
use crate::rate_limit::ServiceLimiters;
use crate::text::{clean_display, normalize_key};
use crate::{AuthorRecord, MatchMethod, NormalizedOrg, NormalizerConfig, OrgType};

/// Confidence assigned to an LLM fallback decision.
const LLM_FALLBACK_SCORE: f64 = 0.5;

/// Two fuzzy scores within this distance count as a tie.
const TIE_EPSILON: f64 = 0.01;

const SYSTEM_PROMPT: &str = "You normalize research organization names from paper \
affiliation strings. Respond with JSON only, in the form {\"name\": \"...\", \
\"country\": \"...\" or null, \"country_code\": \"...\" or null, \"org_type\": \
\"university\" | \"company\" | \"research_institute\" | \"government\" | \
\"hospital\" | \"nonprofit\" | \"unknown\"}. The name must be the organization's \
canonical name without departments, labs, or addresses. If one of the listed \
candidates is the same organization, return its name exactly as listed.";

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    name: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    org_type: Option<OrgType>,
}

pub struct Normalizer {
    kb: Arc<KnowledgeBase>,
    llm: Arc<LlmClient>,
    limiters: Arc<ServiceLimiters>,
    config: NormalizerConfig,
    memo: DashMap<String, NormalizedOrg>,
}

impl Normalizer {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        llm: Arc<LlmClient>,
        limiters: Arc<ServiceLimiters>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            kb,
            llm,
            limiters,
            config,
            memo: DashMap::new(),
        }
    }

    /// Resolve every raw affiliation of every author, in place.
    pub async fn normalize_authors(&self, authors: &mut [AuthorRecord]) {
        for author in authors.iter_mut() {
            author.normalized.clear();
            for raw in &author.raw_affiliations {
                author.normalized.push(self.normalize(raw).await);
            }
        }
    }

    /// Run one raw affiliation string down the ladder.
    pub async fn normalize(&self, raw: &str) -> NormalizedOrg {
        let key = normalize_key(raw);
        if let Some(hit) = self.memo.get(&key) {
            return hit.clone();
        }

        let result = self.resolve(raw).await;
        // Failed LLM calls are transient; do not pin them for the whole run.
        if result.method != MatchMethod::LlmFailed {
            self.memo.insert(key, result.clone());
        }
        result
    }

    async fn resolve(&self, raw: &str) -> NormalizedOrg {
        // Rung 1: exact lookup.
        if let Some(entry) = self.kb.lookup_exact(raw) {
            tracing::debug!(raw, canonical = %entry.canonical, "kb exact match");
            return from_entry(entry, MatchMethod::KbExact, 1.0, false);
        }

        // Rung 2: fuzzy.
        let candidates = self.kb.fuzzy_candidates(raw, self.config.top_k);
        if let Some(best) = candidates.first()
            && best.score >= self.config.tau_high
        {
            let ambiguous = candidates
                .get(1)
                .is_some_and(|second| best.score - second.score < TIE_EPSILON);
            tracing::debug!(raw, canonical = %best.entry.canonical, score = best.score, ambiguous, "fuzzy match");
            return from_entry(best.entry, MatchMethod::Fuzzy, best.score, ambiguous);
        }

        // Rung 3: LLM fallback, with candidates above tau_low as context.
        let offered: Vec<&KbEntry> = candidates
            .iter()
            .filter(|c| c.score >= self.config.tau_low)
            .map(|c| c.entry)
            .collect();

        match self.ask_llm(raw, &offered).await {
            Ok(org) => org,
            Err(reason) => {
                tracing::warn!(raw, reason = %reason, "llm fallback failed, keeping raw string");
                NormalizedOrg {
                    name: clean_display(raw),
                    country: None,
                    country_code: None,
                    org_type: OrgType::Unknown,
                    ror: None,
                    method: MatchMethod::LlmFailed,
                    score: 0.0,
                    ambiguous: false,
                }
            }
        }
    }

    async fn ask_llm(&self, raw: &str, offered: &[&KbEntry]) -> Result<NormalizedOrg, String> {
        let mut user = format!("Affiliation string: {}", raw);
        if !offered.is_empty() {
            user.push_str("\n\nCandidates:\n");
            for entry in offered {
                user.push_str(&format!("- {}\n", entry.canonical));
            }
        }

        if let Some(lim) = self.limiters.get("llm") {
            lim.acquire().await;
        }
        let value = self
            .llm
            .complete_json(LlmRequest::structured(vec![
                Message::system(SYSTEM_PROMPT),
                Message::user(user),
            ]))
            .await
            .map_err(|e| e.to_string())?;

        let verdict: LlmVerdict =
            serde_json::from_value(value).map_err(|e| format!("schema mismatch: {}", e))?;
        let name = clean_display(&verdict.name);
        if name.is_empty() {
            return Err("empty name in verdict".into());
        }

        // If the model named a KB entry, trust the KB's metadata over the
        // model's.
        if let Some(entry) = self.kb.lookup_exact(&name) {
            return Ok(from_entry(
                entry,
                MatchMethod::LlmFallback,
                LLM_FALLBACK_SCORE,
                false,
            ));
        }

        Ok(NormalizedOrg {
            name,
            country: verdict.country.filter(|c| !c.trim().is_empty()),
            // Only a two-letter ISO 3166-1 code is kept; anything else is
            // dropped rather than stored malformed.
            country_code: verdict.country_code.and_then(|c| {
                let code = c.trim().to_ascii_uppercase();
                (code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphabetic()))
                    .then_some(code)
            }),
            org_type: verdict.org_type.unwrap_or(OrgType::Unknown),
            ror: None,
            method: MatchMethod::LlmFallback,
            score: LLM_FALLBACK_SCORE,
            ambiguous: false,
        })
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

fn from_entry(entry: &KbEntry, method: MatchMethod, score: f64, ambiguous: bool) -> NormalizedOrg {
    NormalizedOrg {
        name: entry.canonical.clone(),
        country: Some(entry.country.clone()),
        country_code: Some(entry.country_code.clone()),
        org_type: entry.org_type,
        ror: entry.ror.clone(),
        method,
        score,
        ambiguous,
    }
}
