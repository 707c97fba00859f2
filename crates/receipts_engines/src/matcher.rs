#![forbid(unsafe_code)]

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use receipts_kernel_contracts::receipt::{CustomerName, ReceiptId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyMatcherConfig {
    /// Minimum score (0..=100) the caller accepts as a match.
    pub threshold: u8,
    /// Upper bound on the unforwarded pool scanned per query.
    pub pool_limit: usize,
}

impl FuzzyMatcherConfig {
    pub fn mvp_v1() -> Self {
        Self {
            threshold: 80,
            pool_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub best: Option<ReceiptId>,
    pub score: u8,
}

impl MatchOutcome {
    pub fn accepted(&self, threshold: u8) -> Option<&ReceiptId> {
        if self.score >= threshold {
            self.best.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    config: FuzzyMatcherConfig,
}

impl FuzzyMatcher {
    pub fn new(config: FuzzyMatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> FuzzyMatcherConfig {
        self.config
    }

    /// Scores `query` against the pool in the given order. The pool must already be ordered by
    /// creation time; only a strictly greater score replaces the current best.
    pub fn best_match<'a, I>(&self, query: &str, pool: I) -> MatchOutcome
    where
        I: IntoIterator<Item = (&'a ReceiptId, &'a CustomerName)>,
    {
        let query = sorted_tokens(query);
        let mut best = None;
        let mut best_score = 0u8;
        for (receipt_id, name) in pool.into_iter().take(self.config.pool_limit) {
            let score = indel_ratio(&query, &sorted_tokens(name.as_str()));
            if score > best_score {
                best_score = score;
                best = Some(receipt_id.clone());
            }
        }
        MatchOutcome {
            best,
            score: best_score,
        }
    }
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(FuzzyMatcherConfig::mvp_v1())
    }
}

/// Token-order-insensitive similarity in `0..=100`.
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    indel_ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(raw: &str) -> Vec<char> {
    let folded: String = raw
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ").chars().collect()
}

fn indel_ratio(a: &[char], b: &[char]) -> u8 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0;
    }
    let lcs = lcs_len(a, b);
    let ratio = (200 * lcs + total / 2) / total;
    ratio.min(100) as u8
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
