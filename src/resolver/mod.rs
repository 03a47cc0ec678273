//! Product identity resolution: an ordered waterfall of matching strategies,
//! short-circuiting at the first hit. Local reuse comes first (registry, then
//! audit trail), then the external catalogs, then generative matching. A
//! rate-limit signal from a rotor-backed step propagates immediately — it
//! must never decay into "product unmatched".

pub mod cosmos;
pub mod llm;
pub mod openfoodfacts;
pub mod rotor;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::database_ops::audit::{self, AuditReuse};
use crate::database_ops::canonical::{self, CanonicalCandidate};
use crate::database_ops::db::Db;
use crate::database_ops::models::is_usable_ean;
use crate::normalization::product::best_match;
use cosmos::{CosmosClient, CosmosProduct};
use llm::{LlmMatcher, MatchDecision};
use openfoodfacts::OffClient;
use rotor::{RotorOutcome, TokenRotor};

/// Which strategy produced the canonical identity. The string forms are what
/// lands in the audit trail's `source_used` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSource {
    Registry,
    AuditTrail,
    Cosmos,
    CosmosSearch,
    OpenFoodFacts,
    Generative,
}

impl ResolvedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedSource::Registry => "REGISTRY",
            ResolvedSource::AuditTrail => "AUDIT_TRAIL",
            ResolvedSource::Cosmos => "COSMOS_BLUE",
            ResolvedSource::CosmosSearch => "COSMOS_SEARCH",
            ResolvedSource::OpenFoodFacts => "OPEN_FOOD_FACTS",
            ResolvedSource::Generative => "LLM",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        name: String,
        /// Barcode discovered along the way (audit reuse or fuzzy search
        /// promote no-barcode items); None when no new barcode was learned.
        discovered_ean: Option<String>,
        source: ResolvedSource,
    },
    /// No source could resolve the item; terminal until manually curated.
    Backlog,
    /// The credential pool is exhausted; the whole run must stop.
    RateLimited,
}

/// The fields of a raw line the waterfall needs.
#[derive(Debug, Clone, Copy)]
pub struct ResolveItem<'a> {
    pub ean: &'a str,
    pub product_name: &'a str,
    pub ncm: &'a str,
    pub market_id: &'a str,
}

/// One external step's classified outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome<T> {
    Hit(T),
    Miss,
    RateLimited,
}

/// A product identity returned by a barcode catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogHit {
    pub name: String,
    pub ean: Option<String>,
}

/// One free-text search candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogCandidate {
    pub description: String,
    pub ean: Option<String>,
    pub ncm: Option<String>,
}

/// Read access to what the system already knows. Backed by the store in
/// production; stubbed in tests.
#[async_trait]
pub trait LocalIndex: Send + Sync {
    async fn canonical_name_by_ean(&self, ean: &str) -> Result<Option<String>>;
    async fn audit_reuse(&self, original_name: &str, ncm: &str) -> Result<Option<AuditReuse>>;
    async fn candidates_by_ncm(&self, ncm: &str) -> Result<Vec<CanonicalCandidate>>;
}

/// The external lookup surface, in waterfall order.
#[async_trait]
pub trait ExternalSources: Send {
    async fn primary_by_gtin(&mut self, ean: &str) -> Result<SourceOutcome<CatalogHit>>;
    async fn fuzzy_search(&mut self, raw_text: &str) -> Result<SourceOutcome<Vec<CatalogCandidate>>>;
    async fn open_catalog_by_gtin(&mut self, ean: &str) -> Result<Option<String>>;
    async fn generative_match(
        &mut self,
        raw_name: &str,
        candidates: &[CanonicalCandidate],
    ) -> Result<Option<MatchDecision>>;
}

/// Run the waterfall for one line.
#[instrument(skip(local, ext), fields(ncm = %item.ncm, market_id = %item.market_id))]
pub async fn resolve<L, E>(local: &L, ext: &mut E, item: &ResolveItem<'_>) -> Result<Resolution>
where
    L: LocalIndex,
    E: ExternalSources,
{
    let has_ean = is_usable_ean(item.ean);

    if has_ean {
        // Physical identity is market-independent: any market that resolved
        // this barcode already names it for everyone.
        if let Some(name) = local.canonical_name_by_ean(item.ean).await? {
            debug!(source = "registry", "resolved from local registry");
            return Ok(Resolution::Resolved {
                name,
                discovered_ean: Some(item.ean.trim().to_string()),
                source: ResolvedSource::Registry,
            });
        }
    } else if let Some(reuse) = local.audit_reuse(item.product_name, item.ncm).await? {
        debug!(source = "audit", "resolved from lookup trail");
        return Ok(Resolution::Resolved {
            name: reuse.final_name,
            discovered_ean: Some(reuse.discovered_ean),
            source: ResolvedSource::AuditTrail,
        });
    }

    if has_ean {
        match ext.primary_by_gtin(item.ean).await? {
            SourceOutcome::Hit(hit) => {
                let discovered = hit.ean.or_else(|| Some(item.ean.trim().to_string()));
                return Ok(Resolution::Resolved {
                    name: hit.name,
                    discovered_ean: discovered,
                    source: ResolvedSource::Cosmos,
                });
            }
            SourceOutcome::RateLimited => return Ok(Resolution::RateLimited),
            SourceOutcome::Miss => {}
        }
    }

    match ext.fuzzy_search(item.product_name).await? {
        SourceOutcome::Hit(candidates) => {
            // Only candidates in the same fiscal class may match; with none
            // left this step is a miss, never a guess across classes.
            let in_class: Vec<&CatalogCandidate> = candidates
                .iter()
                .filter(|c| c.ncm.as_deref() == Some(item.ncm))
                .collect();
            let descriptions: Vec<&str> =
                in_class.iter().map(|c| c.description.as_str()).collect();
            if let Some((idx, score)) = best_match(item.product_name, &descriptions) {
                let chosen = in_class[idx];
                debug!(score, ean = ?chosen.ean, "fuzzy search candidate accepted");
                return Ok(Resolution::Resolved {
                    name: chosen.description.clone(),
                    discovered_ean: chosen.ean.clone(),
                    source: ResolvedSource::CosmosSearch,
                });
            }
        }
        SourceOutcome::RateLimited => return Ok(Resolution::RateLimited),
        SourceOutcome::Miss => {}
    }

    if has_ean {
        if let Some(name) = ext.open_catalog_by_gtin(item.ean).await? {
            return Ok(Resolution::Resolved {
                name,
                discovered_ean: Some(item.ean.trim().to_string()),
                source: ResolvedSource::OpenFoodFacts,
            });
        }
    }

    let candidates = local.candidates_by_ncm(item.ncm).await?;
    if let Some(decision) = ext.generative_match(item.product_name, &candidates).await? {
        match decision {
            MatchDecision::Same { matched_id } => {
                if let Some(existing) = candidates.iter().find(|c| c.id == matched_id) {
                    debug!(matched_id, "generative match to existing product");
                    return Ok(Resolution::Resolved {
                        name: existing.product_name.clone(),
                        discovered_ean: None,
                        source: ResolvedSource::Generative,
                    });
                }
            }
            MatchDecision::New { canonical_name } => {
                debug!("generative match declared new product");
                return Ok(Resolution::Resolved {
                    name: canonical_name,
                    discovered_ean: None,
                    source: ResolvedSource::Generative,
                });
            }
        }
    }

    Ok(Resolution::Backlog)
}

/// Store-backed `LocalIndex`.
pub struct DbIndex<'a> {
    db: &'a Db,
}

impl<'a> DbIndex<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LocalIndex for DbIndex<'_> {
    async fn canonical_name_by_ean(&self, ean: &str) -> Result<Option<String>> {
        canonical::find_name_by_ean(self.db, ean).await
    }

    async fn audit_reuse(&self, original_name: &str, ncm: &str) -> Result<Option<AuditReuse>> {
        audit::find_reuse(self.db, original_name, ncm).await
    }

    async fn candidates_by_ncm(&self, ncm: &str) -> Result<Vec<CanonicalCandidate>> {
        canonical::candidates_by_ncm(self.db, ncm).await
    }
}

/// Production wiring of the external surface: Cosmos behind the token rotor,
/// Open Food Facts, and the generative matcher.
pub struct LiveSources {
    cosmos: CosmosClient,
    off: OffClient,
    matcher: LlmMatcher,
    rotor: TokenRotor,
}

impl LiveSources {
    pub fn new(
        cosmos: CosmosClient,
        off: OffClient,
        matcher: LlmMatcher,
        rotor: TokenRotor,
    ) -> Self {
        Self {
            cosmos,
            off,
            matcher,
            rotor,
        }
    }

    pub fn from_env() -> Result<Self> {
        use crate::util::env::env_parse;
        let timeout = std::time::Duration::from_secs(env_parse("LOOKUP_TIMEOUT_SECS", 8u64));
        Ok(Self {
            cosmos: CosmosClient::new(cosmos::CosmosConfig::from_env())?,
            off: OffClient::new(timeout)?,
            matcher: LlmMatcher::new(llm::LlmConfig::from_env()?)?,
            rotor: TokenRotor::from_env()?,
        })
    }
}

#[async_trait]
impl ExternalSources for LiveSources {
    async fn primary_by_gtin(&mut self, ean: &str) -> Result<SourceOutcome<CatalogHit>> {
        match self.cosmos.lookup_gtin(&mut self.rotor, ean).await? {
            RotorOutcome::Hit(product) => Ok(catalog_hit(product)),
            RotorOutcome::NotFound => Ok(SourceOutcome::Miss),
            RotorOutcome::Exhausted => Ok(SourceOutcome::RateLimited),
        }
    }

    async fn fuzzy_search(
        &mut self,
        raw_text: &str,
    ) -> Result<SourceOutcome<Vec<CatalogCandidate>>> {
        match self.cosmos.search(&mut self.rotor, raw_text).await? {
            RotorOutcome::Hit(products) => Ok(SourceOutcome::Hit(
                products
                    .into_iter()
                    .filter_map(|p| {
                        let description = p.display_name()?;
                        Some(CatalogCandidate {
                            ean: p.gtin_string(),
                            ncm: p.ncm_code().map(|c| c.to_string()),
                            description,
                        })
                    })
                    .collect(),
            )),
            RotorOutcome::NotFound => Ok(SourceOutcome::Miss),
            RotorOutcome::Exhausted => Ok(SourceOutcome::RateLimited),
        }
    }

    async fn open_catalog_by_gtin(&mut self, ean: &str) -> Result<Option<String>> {
        self.off.lookup_gtin(ean).await
    }

    async fn generative_match(
        &mut self,
        raw_name: &str,
        candidates: &[CanonicalCandidate],
    ) -> Result<Option<MatchDecision>> {
        self.matcher.decide(raw_name, candidates).await
    }
}

fn catalog_hit(product: CosmosProduct) -> SourceOutcome<CatalogHit> {
    match product.display_name() {
        Some(name) => SourceOutcome::Hit(CatalogHit {
            ean: product.gtin_string(),
            name,
        }),
        // A catalog row with no usable description resolves nothing.
        None => SourceOutcome::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubIndex {
        registry: Vec<(String, String)>,
        trail: Vec<(String, String, AuditReuse)>,
        candidates: Vec<CanonicalCandidate>,
        registry_calls: AtomicUsize,
    }

    #[async_trait]
    impl LocalIndex for StubIndex {
        async fn canonical_name_by_ean(&self, ean: &str) -> Result<Option<String>> {
            self.registry_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .registry
                .iter()
                .find(|(e, _)| e == ean)
                .map(|(_, n)| n.clone()))
        }

        async fn audit_reuse(&self, name: &str, ncm: &str) -> Result<Option<AuditReuse>> {
            Ok(self
                .trail
                .iter()
                .find(|(n, c, _)| n == name && c == ncm)
                .map(|(_, _, r)| r.clone()))
        }

        async fn candidates_by_ncm(&self, _ncm: &str) -> Result<Vec<CanonicalCandidate>> {
            Ok(self.candidates.clone())
        }
    }

    #[derive(Default)]
    struct StubSources {
        primary: Option<SourceOutcome<CatalogHit>>,
        search: Option<SourceOutcome<Vec<CatalogCandidate>>>,
        open_catalog: Option<String>,
        decision: Option<MatchDecision>,
        primary_calls: usize,
        search_calls: usize,
        open_calls: usize,
        generative_calls: usize,
    }

    #[async_trait]
    impl ExternalSources for StubSources {
        async fn primary_by_gtin(&mut self, _ean: &str) -> Result<SourceOutcome<CatalogHit>> {
            self.primary_calls += 1;
            Ok(self.primary.clone().unwrap_or(SourceOutcome::Miss))
        }

        async fn fuzzy_search(
            &mut self,
            _raw: &str,
        ) -> Result<SourceOutcome<Vec<CatalogCandidate>>> {
            self.search_calls += 1;
            Ok(self.search.clone().unwrap_or(SourceOutcome::Miss))
        }

        async fn open_catalog_by_gtin(&mut self, _ean: &str) -> Result<Option<String>> {
            self.open_calls += 1;
            Ok(self.open_catalog.clone())
        }

        async fn generative_match(
            &mut self,
            _raw: &str,
            _candidates: &[CanonicalCandidate],
        ) -> Result<Option<MatchDecision>> {
            self.generative_calls += 1;
            Ok(self.decision.clone())
        }
    }

    fn item<'a>() -> ResolveItem<'a> {
        ResolveItem {
            ean: "7891000100103",
            product_name: "LEITE COND NINHO",
            ncm: "04021000",
            market_id: "MKT11111111",
        }
    }

    #[tokio::test]
    async fn registry_reuse_short_circuits_before_any_external_call() {
        let local = StubIndex {
            registry: vec![(
                "7891000100103".into(),
                "Leite Condensado Ninho 395g".into(),
            )],
            ..Default::default()
        };
        let mut ext = StubSources::default();
        let out = resolve(&local, &mut ext, &item()).await.unwrap();
        assert_eq!(
            out,
            Resolution::Resolved {
                name: "Leite Condensado Ninho 395g".into(),
                discovered_ean: Some("7891000100103".into()),
                source: ResolvedSource::Registry,
            }
        );
        assert_eq!(ext.primary_calls, 0);
        assert_eq!(ext.search_calls, 0);
        assert_eq!(ext.generative_calls, 0);
    }

    #[tokio::test]
    async fn audit_trail_reuse_promotes_barcodeless_items() {
        let local = StubIndex {
            trail: vec![(
                "LEITE COND NINHO".into(),
                "04021000".into(),
                AuditReuse {
                    final_name: "Leite Condensado Ninho 395g".into(),
                    discovered_ean: "7891000100103".into(),
                },
            )],
            ..Default::default()
        };
        let mut ext = StubSources::default();
        let no_ean = ResolveItem {
            ean: "SEM GTIN",
            ..item()
        };
        let out = resolve(&local, &mut ext, &no_ean).await.unwrap();
        match out {
            Resolution::Resolved {
                discovered_ean,
                source,
                ..
            } => {
                assert_eq!(discovered_ean.as_deref(), Some("7891000100103"));
                assert_eq!(source, ResolvedSource::AuditTrail);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(ext.primary_calls, 0);
        // Registry is never consulted for the sentinel barcode.
        assert_eq!(local.registry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limit_propagates_without_falling_through() {
        let local = StubIndex::default();
        let mut ext = StubSources {
            primary: Some(SourceOutcome::RateLimited),
            ..Default::default()
        };
        let out = resolve(&local, &mut ext, &item()).await.unwrap();
        assert_eq!(out, Resolution::RateLimited);
        assert_eq!(ext.search_calls, 0);
        assert_eq!(ext.open_calls, 0);
        assert_eq!(ext.generative_calls, 0);
    }

    #[tokio::test]
    async fn fuzzy_search_requires_same_fiscal_class() {
        let local = StubIndex::default();
        let mut ext = StubSources {
            search: Some(SourceOutcome::Hit(vec![CatalogCandidate {
                description: "LEITE COND NINHO".into(),
                ean: Some("7891000100103".into()),
                ncm: Some("99999999".into()), // wrong class: must not match
            }])),
            ..Default::default()
        };
        let no_ean = ResolveItem {
            ean: "SEM GTIN",
            ..item()
        };
        let out = resolve(&local, &mut ext, &no_ean).await.unwrap();
        assert_eq!(out, Resolution::Backlog);
        assert_eq!(ext.generative_calls, 1);
    }

    #[tokio::test]
    async fn fuzzy_hit_carries_the_candidate_barcode() {
        let local = StubIndex::default();
        let mut ext = StubSources {
            search: Some(SourceOutcome::Hit(vec![CatalogCandidate {
                description: "Leite Condensado Ninho 395g".into(),
                ean: Some("7891000100103".into()),
                ncm: Some("04021000".into()),
            }])),
            ..Default::default()
        };
        let no_ean = ResolveItem {
            ean: "SEM GTIN",
            ..item()
        };
        let out = resolve(&local, &mut ext, &no_ean).await.unwrap();
        match out {
            Resolution::Resolved {
                discovered_ean,
                source,
                ..
            } => {
                assert_eq!(discovered_ean.as_deref(), Some("7891000100103"));
                assert_eq!(source, ResolvedSource::CosmosSearch);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn generative_same_reuses_the_stored_candidate_name() {
        let local = StubIndex {
            candidates: vec![CanonicalCandidate {
                id: 7,
                product_name: "Leite Condensado Ninho 395g".into(),
            }],
            ..Default::default()
        };
        let mut ext = StubSources {
            decision: Some(MatchDecision::Same { matched_id: 7 }),
            ..Default::default()
        };
        let no_ean = ResolveItem {
            ean: "SEM GTIN",
            ..item()
        };
        let out = resolve(&local, &mut ext, &no_ean).await.unwrap();
        assert_eq!(
            out,
            Resolution::Resolved {
                name: "Leite Condensado Ninho 395g".into(),
                discovered_ean: None,
                source: ResolvedSource::Generative,
            }
        );
    }

    #[tokio::test]
    async fn all_misses_end_in_backlog() {
        let local = StubIndex::default();
        let mut ext = StubSources::default();
        let out = resolve(&local, &mut ext, &item()).await.unwrap();
        assert_eq!(out, Resolution::Backlog);
        // Every applicable step ran exactly once.
        assert_eq!(ext.primary_calls, 1);
        assert_eq!(ext.search_calls, 1);
        assert_eq!(ext.open_calls, 1);
        assert_eq!(ext.generative_calls, 1);
    }
}
