use strsim::jaro_winkler;

/// Minimum similarity score (Jaro-Winkler) required for a catalog candidate
/// to be treated as the same product as a raw receipt line.
pub const MIN_MATCH_SIMILARITY: f64 = 0.80;

/// Canonicalized product key used for fuzzy comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductKey {
    normalized: String,
    size_sig: Option<String>,
}

impl ProductKey {
    /// Build a normalized comparison key from raw receipt text.
    ///
    /// Normalization steps:
    /// - trim whitespace, lowercase
    /// - expand common receipt abbreviations (COND -> condensado, ...)
    /// - remove punctuation, collapse runs of whitespace
    /// - record the package-size signature so 395g != 500g
    pub fn new(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase();
        let expanded: Vec<String> = lowered
            .split_whitespace()
            .map(expand_receipt_abbreviation)
            .collect();
        let joined = expanded.join(" ");
        let normalized: String = joined
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let size_sig = extract_size_signature(&normalized);
        Self {
            normalized,
            size_sig,
        }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Package-size signature, e.g. "395g" or "2l".
    pub fn size_signature(&self) -> Option<&str> {
        self.size_sig.as_deref()
    }

    /// Whether the size signatures are compatible (both absent or equal).
    pub fn size_compatible(&self, other: &Self) -> bool {
        match (&self.size_sig, &other.size_sig) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => true, // receipts often omit the size; absence is not a mismatch
        }
    }

    /// Jaro-Winkler similarity between two normalized keys. Incompatible
    /// package sizes cap the score below the acceptance threshold.
    pub fn similarity(&self, other: &Self) -> f64 {
        if let (Some(a), Some(b)) = (&self.size_sig, &other.size_sig) {
            if a != b {
                return jaro_winkler(&self.normalized, &other.normalized)
                    .min(MIN_MATCH_SIMILARITY - 0.01);
            }
        }
        jaro_winkler(&self.normalized, &other.normalized)
    }
}

/// Score a raw receipt text against candidate descriptions; return the index
/// and score of the best candidate when it clears the acceptance threshold.
pub fn best_match(raw: &str, candidates: &[&str]) -> Option<(usize, f64)> {
    let key = ProductKey::new(raw);
    let mut best: Option<(usize, f64)> = None;
    for (idx, cand) in candidates.iter().enumerate() {
        let score = key.similarity(&ProductKey::new(cand));
        match best {
            Some((_, s)) if s >= score => {}
            _ => best = Some((idx, score)),
        }
    }
    best.filter(|(_, score)| *score >= MIN_MATCH_SIMILARITY)
}

/// Rank candidate indices by similarity to the raw text, best first,
/// truncated to `limit`. Used to shortlist generative-match candidates.
pub fn rank_by_similarity(raw: &str, candidates: &[&str], limit: usize) -> Vec<usize> {
    let key = ProductKey::new(raw);
    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .map(|(idx, cand)| (idx, key.similarity(&ProductKey::new(cand))))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(idx, _)| idx).collect()
}

/// Receipt lines abbreviate aggressively to fit the thermal-printer column.
/// Expansion table covers the recurring grocery stems.
fn expand_receipt_abbreviation(token: &str) -> String {
    let expanded = match token {
        "cond" | "cond." => "condensado",
        "leit" => "leite",
        "choc" | "choc." => "chocolate",
        "refri" | "refrig" => "refrigerante",
        "bisc" | "bisc." => "biscoito",
        "marg" => "margarina",
        "cerv" => "cerveja",
        "achoc" => "achocolatado",
        "det" => "detergente",
        "sab" => "sabonete",
        "cr" => "creme",
        "past" => "pastoso",
        "integ" | "int" => "integral",
        "trad" => "tradicional",
        other => other,
    };
    expanded.to_string()
}

fn extract_size_signature(normalized: &str) -> Option<String> {
    const UNITS: [&str; 5] = ["kg", "ml", "g", "l", "un"];
    for token in normalized.split_whitespace() {
        let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            continue;
        }
        let rest = &token[digits.len()..];
        for unit in UNITS {
            if rest == unit {
                return Some(format!("{digits}{unit}"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_receipt_abbreviations() {
        let a = ProductKey::new("LEITE COND NINHO 395G");
        assert!(a.normalized().contains("condensado"));
        assert_eq!(a.size_signature(), Some("395g"));
    }

    #[test]
    fn same_product_different_spellings_clear_threshold() {
        let a = ProductKey::new("LEITE COND NINHO 395G");
        let b = ProductKey::new("Leite Condensado Ninho 395g");
        assert!(a.similarity(&b) >= MIN_MATCH_SIMILARITY);
    }

    #[test]
    fn different_sizes_never_merge() {
        let a = ProductKey::new("Leite Condensado Ninho 395g");
        let b = ProductKey::new("Leite Condensado Ninho 500g");
        assert!(a.similarity(&b) < MIN_MATCH_SIMILARITY);
        assert!(!a.size_compatible(&b));
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        // A candidate scoring exactly at the threshold is accepted; one just
        // below is rejected.
        let raw = "arroz branco tipo 1";
        let good = "arroz branco tipo 1";
        let bad = "feijao preto tipo 1";
        let accepted = best_match(raw, &[good]);
        assert!(accepted.is_some());
        let (idx, score) = accepted.unwrap();
        assert_eq!(idx, 0);
        assert!(score >= MIN_MATCH_SIMILARITY);
        assert!(best_match(raw, &[bad]).is_none());
    }

    #[test]
    fn best_match_picks_the_maximum() {
        let raw = "LEITE COND NINHO";
        let candidates = [
            "Leite Integral Ninho 1L",
            "Leite Condensado Ninho",
            "Creme de Leite Nestle",
        ];
        let (idx, _) = best_match(raw, &candidates).expect("should match");
        assert_eq!(idx, 1);
    }

    #[test]
    fn ranking_orders_by_similarity_and_truncates() {
        let raw = "cafe torrado e moido 500g";
        let candidates = [
            "Sabonete Glicerinado",
            "Cafe Torrado e Moido Pilao 500g",
            "Cafe Soluvel 200g",
        ];
        let ranked = rank_by_similarity(raw, &candidates, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], 1);
    }
}
