//! Credential-pool rotation for the Cosmos catalog API.
//!
//! Each rotor instance owns its pool and cursor; nothing is global, so tests
//! and parallel pipelines can run independent rotors. The cursor persists
//! across calls: the pool resumes from the last credential that worked.

use anyhow::{anyhow, Result};
use std::future::Future;
use tracing::warn;

/// Classification of one attempt against an external source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceReply<T> {
    Hit(T),
    NotFound,
    /// The credential used for this attempt is out of quota (or rejected).
    QuotaExceeded,
}

/// Result of driving a request through the whole pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotorOutcome<T> {
    Hit(T),
    NotFound,
    /// Every credential in the pool is out of quota. Callers treat this as a
    /// stop-condition for the whole run, never as "product unmatched".
    Exhausted,
}

pub struct TokenRotor {
    tokens: Vec<String>,
    cursor: usize,
}

impl TokenRotor {
    pub fn new(tokens: Vec<String>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(anyhow!("credential pool is empty"));
        }
        Ok(Self { tokens, cursor: 0 })
    }

    /// Pool from the comma-separated `COSMOS_TOKENS` env var.
    pub fn from_env() -> Result<Self> {
        let raw = crate::util::env::env_req("COSMOS_TOKENS")?;
        let tokens: Vec<String> = raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self::new(tokens)
    }

    pub fn pool_size(&self) -> usize {
        self.tokens.len()
    }

    /// Drive `request` once per credential, starting at the cursor. A
    /// quota-exceeded reply advances the cursor (wrapping) and retries with
    /// the next credential; a full fruitless cycle returns `Exhausted`.
    /// Transport errors propagate as-is — retrying those is the client's job.
    pub async fn call<T, F, Fut>(&mut self, mut request: F) -> Result<RotorOutcome<T>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<SourceReply<T>>>,
    {
        for attempt in 0..self.tokens.len() {
            let token = self.tokens[self.cursor].clone();
            match request(token).await? {
                SourceReply::Hit(value) => return Ok(RotorOutcome::Hit(value)),
                SourceReply::NotFound => return Ok(RotorOutcome::NotFound),
                SourceReply::QuotaExceeded => {
                    warn!(
                        attempt,
                        credential = self.cursor,
                        pool = self.tokens.len(),
                        "credential out of quota; rotating"
                    );
                    self.cursor = (self.cursor + 1) % self.tokens.len();
                }
            }
        }
        warn!(pool = self.tokens.len(), "credential pool exhausted");
        Ok(RotorOutcome::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(n: usize) -> TokenRotor {
        TokenRotor::new((0..n).map(|i| format!("tok{i}")).collect()).unwrap()
    }

    #[tokio::test]
    async fn exhausted_after_exactly_one_full_cycle() {
        let mut rotor = pool(3);
        let calls = AtomicUsize::new(0);
        let out: RotorOutcome<String> = rotor
            .call(|_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(SourceReply::QuotaExceeded) }
            })
            .await
            .unwrap();
        assert_eq!(out, RotorOutcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rotates_past_spent_credentials_to_a_hit() {
        let mut rotor = pool(3);
        let out = rotor
            .call(|token| async move {
                if token == "tok2" {
                    Ok(SourceReply::Hit(token))
                } else {
                    Ok(SourceReply::QuotaExceeded)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, RotorOutcome::Hit("tok2".to_string()));
    }

    #[tokio::test]
    async fn cursor_persists_across_calls() {
        let mut rotor = pool(3);
        // First call burns tok0 and lands on tok1.
        let _ = rotor
            .call(|token| async move {
                if token == "tok0" {
                    Ok(SourceReply::QuotaExceeded)
                } else {
                    Ok(SourceReply::Hit(()))
                }
            })
            .await
            .unwrap();
        // Second call must start from tok1, not rewind to tok0.
        let seen = std::sync::Mutex::new(Vec::new());
        let _: RotorOutcome<()> = rotor
            .call(|token| {
                seen.lock().unwrap().push(token);
                async { Ok(SourceReply::NotFound) }
            })
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &["tok1".to_string()]);
    }

    #[tokio::test]
    async fn not_found_does_not_consume_the_pool() {
        let mut rotor = pool(2);
        let out: RotorOutcome<()> = rotor
            .call(|_| async { Ok(SourceReply::NotFound) })
            .await
            .unwrap();
        assert_eq!(out, RotorOutcome::NotFound);
        // Pool untouched: a follow-up call still has both credentials.
        let calls = AtomicUsize::new(0);
        let out: RotorOutcome<()> = rotor
            .call(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(SourceReply::QuotaExceeded) }
            })
            .await
            .unwrap();
        assert_eq!(out, RotorOutcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(TokenRotor::new(Vec::new()).is_err());
    }
}
