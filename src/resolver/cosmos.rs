//! Bluesoft Cosmos catalog client: GTIN lookup (primary identity source) and
//! free-text product search (fuzzy fallback). Every request goes through the
//! token rotor; quota and rejected-credential statuses rotate, transient
//! transport failures retry in place with linear backoff.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::rotor::{RotorOutcome, SourceReply, TokenRotor};

const DEFAULT_BASE_URL: &str = "https://api.cosmos.bluesoft.com.br";

#[derive(Debug, Clone)]
pub struct CosmosConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for CosmosConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(8),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl CosmosConfig {
    pub fn from_env() -> Self {
        use crate::util::env::{env_opt, env_parse};
        let mut cfg = Self::default();
        if let Some(v) = env_opt("COSMOS_BASE_URL") {
            cfg.base_url = v.trim_end_matches('/').to_string();
        }
        cfg.timeout = Duration::from_secs(env_parse("LOOKUP_TIMEOUT_SECS", 8u64));
        cfg.max_retries = env_parse("COSMOS_MAX_RETRIES", 2u32);
        cfg.backoff = Duration::from_millis(env_parse("COSMOS_BACKOFF_MS", 500u64));
        cfg
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CosmosBrand {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CosmosNcm {
    #[serde(default)]
    pub code: Option<String>,
}

/// One catalog product, from either the GTIN endpoint or a search result.
#[derive(Debug, Clone, Deserialize)]
pub struct CosmosProduct {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub gtin: Option<i64>,
    #[serde(default)]
    pub brand: Option<CosmosBrand>,
    #[serde(default)]
    pub ncm: Option<CosmosNcm>,
}

impl CosmosProduct {
    /// Display name: catalog description, with the brand appended when the
    /// description does not already carry it.
    pub fn display_name(&self) -> Option<String> {
        let desc = self.description.as_deref()?.trim();
        if desc.is_empty() {
            return None;
        }
        match self.brand.as_ref().and_then(|b| b.name.as_deref()) {
            Some(brand)
                if !brand.trim().is_empty()
                    && !desc.to_lowercase().contains(&brand.trim().to_lowercase()) =>
            {
                Some(format!("{} {}", desc, brand.trim()))
            }
            _ => Some(desc.to_string()),
        }
    }

    pub fn gtin_string(&self) -> Option<String> {
        self.gtin.map(|g| g.to_string())
    }

    pub fn ncm_code(&self) -> Option<&str> {
        self.ncm.as_ref().and_then(|n| n.code.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CosmosSearchPage {
    #[serde(default)]
    products: Vec<CosmosProduct>,
}

pub struct CosmosClient {
    http: Client,
    cfg: CosmosConfig,
}

impl CosmosClient {
    pub fn new(cfg: CosmosConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("precos-enrich/0.3")
            .timeout(cfg.timeout)
            .build()
            .context("failed to construct Cosmos HTTP client")?;
        Ok(Self { http, cfg })
    }

    /// GTIN lookup through the rotor. `NotFound` means the catalog does not
    /// know the barcode; `Exhausted` means every credential is out of quota.
    pub async fn lookup_gtin(
        &self,
        rotor: &mut TokenRotor,
        ean: &str,
    ) -> Result<RotorOutcome<CosmosProduct>> {
        let url = format!("{}/gtins/{}.json", self.cfg.base_url, ean.trim());
        rotor
            .call(|token| {
                let url = url.clone();
                async move { self.request_json::<CosmosProduct>(&url, &token, &[]).await }
            })
            .await
    }

    /// Free-text catalog search through the rotor, first page of candidates.
    pub async fn search(
        &self,
        rotor: &mut TokenRotor,
        query: &str,
    ) -> Result<RotorOutcome<Vec<CosmosProduct>>> {
        let url = format!("{}/products.json", self.cfg.base_url);
        let outcome = rotor
            .call(|token| {
                let url = url.clone();
                let query = query.to_string();
                async move {
                    self.request_json::<CosmosSearchPage>(&url, &token, &[("query", query.as_str())])
                        .await
                }
            })
            .await?;
        Ok(match outcome {
            RotorOutcome::Hit(page) => {
                debug!(candidates = page.products.len(), "cosmos search returned");
                RotorOutcome::Hit(page.products)
            }
            RotorOutcome::NotFound => RotorOutcome::Hit(Vec::new()),
            RotorOutcome::Exhausted => RotorOutcome::Exhausted,
        })
    }

    /// One classified attempt with a single credential. Retries transient
    /// transport/server failures in place; quota and rejected credentials are
    /// reported to the rotor for rotation.
    async fn request_json<T>(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
    ) -> Result<SourceReply<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            let response = self
                .http
                .get(url)
                .header("X-Cosmos-Token", token)
                .query(query)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        let parsed: T = serde_json::from_str(&text).map_err(|err| {
                            anyhow!("failed to parse Cosmos payload ({err}): {text}")
                        })?;
                        return Ok(SourceReply::Hit(parsed));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(SourceReply::NotFound);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::UNAUTHORIZED
                        || status == StatusCode::FORBIDDEN
                    {
                        return Ok(SourceReply::QuotaExceeded);
                    }
                    if status.is_server_error() && attempt < self.cfg.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.cfg.backoff.saturating_mul(attempt)).await;
                        continue;
                    }
                    let text = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("cosmos request failed (status={status}): {text}"));
                }
                Err(err) => {
                    if attempt < self.cfg.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.cfg.backoff.saturating_mul(attempt)).await;
                        continue;
                    }
                    return Err(err).context("cosmos request failed after retries");
                }
            }
        }
    }
}
