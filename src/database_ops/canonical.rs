//! Canonical product identity: one `unique_products` row per product per
//! market. Rows with a real EAN key on `(market_id, ean)` so different
//! spellings of the same barcode collapse; rows without one key on the
//! resolver's cleaned `(market_id, product_name)`.

use anyhow::Result;
use sqlx::Row;
use tracing::{debug, instrument};

use super::db::Db;
use super::models::is_usable_ean;

/// A same-NCM canonical name offered to the generative matcher.
#[derive(Debug, Clone)]
pub struct CanonicalCandidate {
    pub id: i64,
    pub product_name: String,
}

/// Insert-or-update the canonical row for a resolved product.
/// Returns the row id.
#[instrument(skip(db, name, unidade_comercial), fields(market_id = %market_id))]
pub async fn upsert(
    db: &Db,
    market_id: &str,
    ean: &str,
    ncm: &str,
    name: &str,
    unidade_comercial: &str,
    price: f64,
    nfce_url: &str,
) -> Result<i64> {
    let existing: Option<i64> = if is_usable_ean(ean) {
        sqlx::query_scalar("SELECT id FROM unique_products WHERE market_id=$1 AND ean=$2")
            .persistent(false)
            .bind(market_id)
            .bind(ean.trim())
            .fetch_optional(&db.pool)
            .await?
    } else {
        sqlx::query_scalar(
            "SELECT id FROM unique_products WHERE market_id=$1 AND product_name=$2",
        )
        .persistent(false)
        .bind(market_id)
        .bind(name)
        .fetch_optional(&db.pool)
        .await?
    };

    match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE unique_products \
                 SET ncm=$2, ean=$3, product_name=$4, unidade_comercial=$5, price=$6, \
                     nfce_url=$7, last_updated=now() \
                 WHERE id=$1",
            )
            .persistent(false)
            .bind(id)
            .bind(ncm)
            .bind(ean)
            .bind(name)
            .bind(unidade_comercial)
            .bind(price)
            .bind(nfce_url)
            .execute(&db.pool)
            .await?;
            debug!(id, "canonical row updated");
            Ok(id)
        }
        None => {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO unique_products \
                 (market_id, ncm, ean, product_name, unidade_comercial, price, nfce_url, last_updated) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,now()) \
                 RETURNING id",
            )
            .persistent(false)
            .bind(market_id)
            .bind(ncm)
            .bind(ean)
            .bind(name)
            .bind(unidade_comercial)
            .bind(price)
            .bind(nfce_url)
            .fetch_one(&db.pool)
            .await?;
            debug!(id, "canonical row created");
            Ok(id)
        }
    }
}

/// Physical product identity is market-independent: any market that already
/// resolved this EAN supplies the canonical name verbatim.
pub async fn find_name_by_ean(db: &Db, ean: &str) -> Result<Option<String>> {
    if !is_usable_ean(ean) {
        return Ok(None);
    }
    let name: Option<String> = sqlx::query_scalar(
        "SELECT product_name FROM unique_products \
         WHERE ean=$1 ORDER BY last_updated DESC LIMIT 1",
    )
    .persistent(false)
    .bind(ean.trim())
    .fetch_optional(&db.pool)
    .await?;
    Ok(name)
}

/// All canonical names in the given fiscal class, across every market, for
/// generative-match candidate shortlisting.
pub async fn candidates_by_ncm(db: &Db, ncm: &str) -> Result<Vec<CanonicalCandidate>> {
    let rows = sqlx::query("SELECT id, product_name FROM unique_products WHERE ncm=$1")
        .persistent(false)
        .bind(ncm)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| CanonicalCandidate {
            id: r.get("id"),
            product_name: r.get("product_name"),
        })
        .collect())
}

