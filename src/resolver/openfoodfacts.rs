//! Open Food Facts fallback: open grocery catalog, barcode lookup only.
//! Lower confidence than Cosmos, no credentials, no quota.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://world.openfoodfacts.org";

#[derive(Debug, Clone, Deserialize)]
struct OffProduct {
    #[serde(default)]
    product_name_pt: Option<String>,
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    brands: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OffReply {
    #[serde(default)]
    status: i32,
    #[serde(default)]
    product: Option<OffProduct>,
}

impl OffReply {
    /// Localized name preferred; reply with status 0 means unknown barcode.
    fn into_name(self) -> Option<String> {
        if self.status != 1 {
            return None;
        }
        let product = self.product?;
        let name = product
            .product_name_pt
            .filter(|n| !n.trim().is_empty())
            .or(product.product_name)
            .filter(|n| !n.trim().is_empty())?;
        match product.brands.as_deref() {
            Some(brands) if !brands.trim().is_empty() => {
                let first = brands.split(',').next().unwrap_or("").trim();
                if first.is_empty() || name.to_lowercase().contains(&first.to_lowercase()) {
                    Some(name)
                } else {
                    Some(format!("{} {}", name.trim(), first))
                }
            }
            _ => Some(name.trim().to_string()),
        }
    }
}

pub struct OffClient {
    http: Client,
    base_url: String,
}

impl OffClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let base_url = crate::util::env::env_opt("OFF_BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = Client::builder()
            .user_agent("precos-enrich/0.3")
            .timeout(timeout)
            .build()
            .context("failed to construct Open Food Facts HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub async fn lookup_gtin(&self, ean: &str) -> Result<Option<String>> {
        let url = format!("{}/api/v0/product/{}.json", self.base_url, ean.trim());
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("open food facts request failed")?;
        if !resp.status().is_success() {
            // The open catalog answers 200 with status=0 for unknown codes;
            // anything else is treated as a miss, not an error.
            return Ok(None);
        }
        let reply: OffReply = resp.json().await.unwrap_or(OffReply {
            status: 0,
            product: None,
        });
        Ok(reply.into_name())
    }
}
