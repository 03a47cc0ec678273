//! Generative matching, the resolver's final fallback. The model sees the raw
//! receipt text plus a shortlist of same-NCM canonical names and must either
//! point at one of them or declare a new product, returning a cleaned display
//! name either way. Sampling temperature is pinned to zero so the same input
//! keeps producing the same decision.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::database_ops::canonical::CanonicalCandidate;
use crate::normalization::product::rank_by_similarity;

/// Most-similar candidates offered to the model.
pub const DEFAULT_MAX_CANDIDATES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    /// Distinct product; `canonical_name` is the cleaned display name.
    New { canonical_name: String },
    /// Same product as an existing canonical row.
    Same { matched_id: i64 },
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_candidates: usize,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        use crate::util::env::{env_parse, env_req};
        Ok(Self {
            api_url: env_req("LLM_API_URL")?,
            api_key: env_req("LLM_API_KEY")?,
            model: env_req("LLM_MODEL")?,
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 10u64)),
            max_candidates: env_parse("LLM_MAX_CANDIDATES", DEFAULT_MAX_CANDIDATES),
        })
    }
}

pub struct LlmMatcher {
    http: Client,
    cfg: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    matched_id: Option<serde_json::Value>,
    #[serde(default)]
    canonical_name: Option<String>,
}

impl LlmMatcher {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("failed to construct LLM HTTP client")?;
        Ok(Self { http, cfg })
    }

    /// Ask the model to match `raw_name` against the shortlist. Returns None
    /// when the reply is unusable (treated as a miss by the waterfall).
    pub async fn decide(
        &self,
        raw_name: &str,
        candidates: &[CanonicalCandidate],
    ) -> Result<Option<MatchDecision>> {
        let shortlist = shortlist(raw_name, candidates, self.cfg.max_candidates);
        let prompt = build_prompt(raw_name, &shortlist);
        debug!(candidates = shortlist.len(), "asking model for product match");

        let body = json!({
            "model": self.cfg.model,
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ]
        });
        let resp = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("LLM request failed (status={status}): {text}"));
        }
        let reply: ChatReply = resp.json().await.context("LLM reply was not JSON")?;
        let content = reply
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();
        Ok(parse_decision(content, &shortlist))
    }
}

const SYSTEM_PROMPT: &str = "You deduplicate grocery products from Brazilian NFC-e receipts. \
Receipt lines abbreviate heavily. Given a raw line and a numbered list of known products in \
the same fiscal class, answer with a JSON object: \
{\"decision\":\"same\",\"matched_id\":<id>,\"canonical_name\":\"...\"} when the line is one \
of the listed products, or {\"decision\":\"new\",\"canonical_name\":\"...\"} when it is not. \
canonical_name must always be the full, properly cased product name with abbreviations expanded.";

/// Keep only the most similar candidates, preserving their canonical ids.
fn shortlist(
    raw_name: &str,
    candidates: &[CanonicalCandidate],
    limit: usize,
) -> Vec<CanonicalCandidate> {
    let names: Vec<&str> = candidates.iter().map(|c| c.product_name.as_str()).collect();
    rank_by_similarity(raw_name, &names, limit)
        .into_iter()
        .map(|idx| candidates[idx].clone())
        .collect()
}

fn build_prompt(raw_name: &str, shortlist: &[CanonicalCandidate]) -> String {
    let mut out = format!("Receipt line: {raw_name}\n\nKnown products:\n");
    if shortlist.is_empty() {
        out.push_str("(none)\n");
    }
    for c in shortlist {
        out.push_str(&format!("{}: {}\n", c.id, c.product_name));
    }
    out
}

/// Parse and validate the model's reply against the actual candidate set.
/// An out-of-range or malformed `matched_id` downgrades to "new"; a reply
/// with no usable canonical name is a miss.
pub fn parse_decision(content: &str, shortlist: &[CanonicalCandidate]) -> Option<MatchDecision> {
    let raw: RawDecision = serde_json::from_str(content.trim()).ok()?;
    let canonical_name = raw
        .canonical_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let matched_id = raw.matched_id.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    });

    match raw.decision.as_deref() {
        Some("same") => {
            if let Some(id) = matched_id {
                if shortlist.iter().any(|c| c.id == id) {
                    return Some(MatchDecision::Same { matched_id: id });
                }
            }
            // Candidate id missing, malformed or not in the offered set.
            canonical_name.map(|canonical_name| MatchDecision::New { canonical_name })
        }
        Some("new") => canonical_name.map(|canonical_name| MatchDecision::New { canonical_name }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<CanonicalCandidate> {
        vec![
            CanonicalCandidate {
                id: 10,
                product_name: "Leite Condensado Ninho 395g".into(),
            },
            CanonicalCandidate {
                id: 11,
                product_name: "Leite Condensado Italac 395g".into(),
            },
        ]
    }

    #[test]
    fn valid_same_decision_is_accepted() {
        let out = parse_decision(
            r#"{"decision":"same","matched_id":11,"canonical_name":"Leite Condensado Italac 395g"}"#,
            &candidates(),
        );
        assert_eq!(out, Some(MatchDecision::Same { matched_id: 11 }));
    }

    #[test]
    fn out_of_range_candidate_downgrades_to_new() {
        let out = parse_decision(
            r#"{"decision":"same","matched_id":999,"canonical_name":"Leite Condensado 395g"}"#,
            &candidates(),
        );
        assert_eq!(
            out,
            Some(MatchDecision::New {
                canonical_name: "Leite Condensado 395g".into()
            })
        );
    }

    #[test]
    fn string_candidate_ids_are_tolerated() {
        let out = parse_decision(
            r#"{"decision":"same","matched_id":"10","canonical_name":"x"}"#,
            &candidates(),
        );
        assert_eq!(out, Some(MatchDecision::Same { matched_id: 10 }));
    }

    #[test]
    fn new_decision_needs_a_name() {
        let out = parse_decision(r#"{"decision":"new","canonical_name":"Pao Frances kg"}"#, &[]);
        assert_eq!(
            out,
            Some(MatchDecision::New {
                canonical_name: "Pao Frances kg".into()
            })
        );
        assert_eq!(parse_decision(r#"{"decision":"new"}"#, &[]), None);
        assert_eq!(
            parse_decision(r#"{"decision":"new","canonical_name":"  "}"#, &[]),
            None
        );
    }

    #[test]
    fn garbage_replies_are_misses() {
        assert_eq!(parse_decision("not json at all", &candidates()), None);
        assert_eq!(parse_decision(r#"{"foo":1}"#, &candidates()), None);
        assert_eq!(
            parse_decision(r#"{"decision":"maybe","canonical_name":"x"}"#, &candidates()),
            None
        );
    }

    #[test]
    fn shortlist_keeps_most_similar_and_caps_size() {
        let mut many: Vec<CanonicalCandidate> = (0..30)
            .map(|i| CanonicalCandidate {
                id: i,
                product_name: format!("Produto Generico {i}"),
            })
            .collect();
        many.push(CanonicalCandidate {
            id: 99,
            product_name: "Leite Condensado Ninho 395g".into(),
        });
        let list = shortlist("LEITE COND NINHO", &many, DEFAULT_MAX_CANDIDATES);
        assert_eq!(list.len(), DEFAULT_MAX_CANDIDATES);
        assert_eq!(list[0].id, 99);
    }

    #[test]
    fn prompt_numbers_candidates_by_canonical_id() {
        let prompt = build_prompt("ARROZ T1 5KG", &candidates());
        assert!(prompt.contains("10: Leite Condensado Ninho 395g"));
        assert!(prompt.contains("Receipt line: ARROZ T1 5KG"));
    }
}
