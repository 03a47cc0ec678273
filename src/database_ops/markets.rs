//! Market registry: match-or-create by (name, address), with generated
//! `MKT` + 8 uppercase alphanumeric codes.

use anyhow::Result;
use rand::Rng;
use sqlx::Row;
use tracing::info;

use super::db::Db;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MarketRow {
    pub id: i64,
    pub market_id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketAction {
    Matched,
    Created,
}

pub fn generate_market_id<R: Rng>(rng: &mut R) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let suffix: String = (0..8)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("MKT{suffix}")
}

/// Match an existing market by exact (name, address) or create a new one with
/// a fresh code, re-rolling on the unlikely code collision.
pub async fn ensure_market(
    db: &Db,
    name: &str,
    address: &str,
) -> Result<(MarketRow, MarketAction)> {
    let existing: Option<MarketRow> =
        sqlx::query_as("SELECT id, market_id, name, address FROM markets WHERE name=$1 AND address=$2")
            .persistent(false)
            .bind(name)
            .bind(address)
            .fetch_optional(&db.pool)
            .await?;
    if let Some(market) = existing {
        return Ok((market, MarketAction::Matched));
    }

    let mut rng = rand::thread_rng();
    let mut code = generate_market_id(&mut rng);
    loop {
        let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM markets WHERE market_id=$1")
            .persistent(false)
            .bind(&code)
            .fetch_optional(&db.pool)
            .await?;
        if taken.is_none() {
            break;
        }
        code = generate_market_id(&mut rng);
    }

    let row = sqlx::query(
        "INSERT INTO markets (market_id, name, address) VALUES ($1,$2,$3) \
         RETURNING id, market_id, name, address",
    )
    .persistent(false)
    .bind(&code)
    .bind(name)
    .bind(address)
    .fetch_one(&db.pool)
    .await?;
    info!(market_id = %code, name, "market created");
    Ok((
        MarketRow {
            id: row.get("id"),
            market_id: row.get("market_id"),
            name: row.get("name"),
            address: row.get("address"),
        },
        MarketAction::Created,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_codes_have_fixed_shape() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let code = generate_market_id(&mut rng);
            assert_eq!(code.len(), 11);
            assert!(code.starts_with("MKT"));
            assert!(code[3..]
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn generated_codes_vary() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = generate_market_id(&mut rng);
        let b = generate_market_id(&mut rng);
        assert_ne!(a, b);
    }
}
