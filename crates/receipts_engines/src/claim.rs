#![forbid(unsafe_code)]

use receipts_kernel_contracts::receipt::CustomerName;
use receipts_kernel_contracts::ContractViolation;

const CLAIM_TOKEN_TRIM: &[char] = &[':', '-', ',', '.', '*', '#', '_'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimParserConfig {
    pub keywords: Vec<String>,
}

impl ClaimParserConfig {
    pub fn mvp_v1() -> Self {
        Self {
            keywords: vec!["recc".to_string()],
        }
    }

    /// Builds a config from a comma separated keyword list. Blank lists keep the default.
    pub fn from_csv(raw: &str) -> Self {
        let keywords: Vec<String> = raw
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Self::mvp_v1();
        }
        Self { keywords }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDetection {
    NotAClaim,
    Claimed(CustomerName),
    /// Keyword present but the name fails validation (for example too long).
    InvalidName(ContractViolation),
}

impl ClaimDetection {
    pub fn into_name(self) -> Option<CustomerName> {
        match self {
            Self::Claimed(name) => Some(name),
            Self::NotAClaim | Self::InvalidName(_) => None,
        }
    }
}

/// Detects "keyword + name" claim messages.
#[derive(Debug, Clone)]
pub struct ClaimParser {
    keywords: Vec<String>,
}

impl ClaimParser {
    pub fn new(config: ClaimParserConfig) -> Self {
        let keywords = config
            .keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Claimed customer name when `text` holds a keyword followed by at least one name token.
    pub fn parse(&self, text: &str) -> Option<CustomerName> {
        self.detect(text).into_name()
    }

    /// The keyword may be glued to the name with a separator (`recc:Maria`).
    pub fn detect(&self, text: &str) -> ClaimDetection {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        for (idx, token) in tokens.iter().enumerate() {
            let lowered = token.to_lowercase();
            for keyword in &self.keywords {
                let Some(rest) = lowered.strip_prefix(keyword.as_str()) else {
                    continue;
                };
                if rest.is_empty() || rest.chars().all(|c| CLAIM_TOKEN_TRIM.contains(&c)) {
                    return name_from_tokens(&tokens[idx + 1..]);
                }
                if let Some(glued) = rest.strip_prefix(|c: char| c == ':' || c == '-') {
                    // Keep the caller's casing for the glued part.
                    let original = token
                        .len()
                        .checked_sub(glued.len())
                        .and_then(|offset| token.get(offset..))
                        .unwrap_or(glued);
                    let mut name_tokens = vec![original];
                    name_tokens.extend_from_slice(&tokens[idx + 1..]);
                    return name_from_tokens(&name_tokens);
                }
            }
        }
        ClaimDetection::NotAClaim
    }

    pub fn is_claim(&self, text: &str) -> bool {
        self.parse(text).is_some()
    }
}

impl Default for ClaimParser {
    fn default() -> Self {
        Self::new(ClaimParserConfig::mvp_v1())
    }
}

fn name_from_tokens(tokens: &[&str]) -> ClaimDetection {
    let cleaned: Vec<&str> = tokens
        .iter()
        .map(|t| t.trim_matches(CLAIM_TOKEN_TRIM))
        .filter(|t| !t.is_empty())
        .collect();
    if cleaned.is_empty() {
        return ClaimDetection::NotAClaim;
    }
    match CustomerName::new(cleaned.join(" ")) {
        Ok(name) => ClaimDetection::Claimed(name),
        Err(violation) => ClaimDetection::InvalidName(violation),
    }
}
