#![forbid(unsafe_code)]

//! Runtime configuration from `RECEIPTS_*` environment variables. Out-of-range numbers fall back
//! to their defaults instead of failing startup.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;

use receipts_engines::claim::ClaimParserConfig;
use receipts_engines::pending_image::PendingImageConfig;
use receipts_engines::secret_vault::resolve_secret_env_first;
use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::secrets::ReceiptSecretId;
use tracing::warn;

use crate::correlation::CorrelationConfig;
use crate::forward::FORWARD_QUEUE_CAPACITY_DEFAULT;
use crate::media_fetch::HttpMediaFetcherConfig;
use crate::telegram::{TelegramBotConfig, TELEGRAM_API_BASE_DEFAULT};

pub const HTTP_BIND_DEFAULT: &str = "127.0.0.1:8080";

#[derive(Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub correlation: CorrelationConfig,
    pub encryption_key: Option<String>,
    pub image_dir: PathBuf,
    pub store_path: PathBuf,
    pub media: HttpMediaFetcherConfig,
    pub bot: TelegramBotConfig,
    pub forward_queue_capacity: usize,
    pub http_bind: String,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("correlation", &self.correlation)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("image_dir", &self.image_dir)
            .field("store_path", &self.store_path)
            .field("media", &self.media)
            .field("bot", &self.bot)
            .field("forward_queue_capacity", &self.forward_queue_capacity)
            .field("http_bind", &self.http_bind)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok(), resolve_secret_env_first)
    }

    /// `var` reads plain settings, `secret` resolves vault-backed ones.
    pub fn from_lookup<V, S>(var: V, secret: S) -> Self
    where
        V: Fn(&str) -> Option<String>,
        S: Fn(ReceiptSecretId) -> Option<String>,
    {
        let text = |key: &str| {
            var(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let bounded = |key: &str, min: u64, max: u64, default: u64| {
            text(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| (min..=max).contains(v))
                .unwrap_or(default)
        };

        let monitored_groups = text("RECEIPTS_MONITORED_GROUPS")
            .map(|raw| parse_group_list(&raw))
            .unwrap_or_default();
        let claim = text("RECEIPTS_CLAIM_KEYWORDS")
            .map(|raw| ClaimParserConfig::from_csv(&raw))
            .unwrap_or_else(ClaimParserConfig::mvp_v1);
        let pending = PendingImageConfig::with_ttl_secs(bounded(
            "RECEIPTS_PENDING_IMAGE_TTL_SECS",
            1,
            3_600,
            120,
        ));
        let mut correlation = CorrelationConfig {
            monitored_groups,
            claim,
            pending,
            forward_on_store: text("RECEIPTS_FORWARD_ON_STORE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            admin_chat_id: text("RECEIPTS_ADMIN_CHAT_ID"),
            ..CorrelationConfig::mvp_v1()
        };
        correlation.matcher.threshold = bounded("RECEIPTS_MATCH_THRESHOLD", 1, 100, 80) as u8;
        correlation.matcher.pool_limit =
            bounded("RECEIPTS_MATCH_POOL_LIMIT", 1, 10_000, 100) as usize;

        let media = HttpMediaFetcherConfig {
            api_key: secret(ReceiptSecretId::MediaApiKey),
            request_timeout_ms: bounded("RECEIPTS_MEDIA_TIMEOUT_MS", 100, 120_000, 15_000),
            ..HttpMediaFetcherConfig::mvp_v1()
        };
        let bot = TelegramBotConfig {
            api_base: text("RECEIPTS_TELEGRAM_API_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| TELEGRAM_API_BASE_DEFAULT.to_string()),
            bot_token: secret(ReceiptSecretId::OperatorBotToken),
            operator_chat_id: text("RECEIPTS_OPERATOR_CHAT_ID"),
            ..TelegramBotConfig::mvp_v1()
        };

        Self {
            correlation,
            encryption_key: secret(ReceiptSecretId::ReceiptEncryptionKey),
            image_dir: text("RECEIPTS_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_data_dir().join("images")),
            store_path: text("RECEIPTS_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_data_dir().join("store.jsonl")),
            media,
            bot,
            forward_queue_capacity: bounded(
                "RECEIPTS_FORWARD_QUEUE_CAPACITY",
                1,
                10_000,
                FORWARD_QUEUE_CAPACITY_DEFAULT as u64,
            ) as usize,
            http_bind: text("RECEIPTS_HTTP_BIND").unwrap_or_else(|| HTTP_BIND_DEFAULT.to_string()),
            webhook_secret: secret(ReceiptSecretId::WebhookSecret),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

fn parse_group_list(raw: &str) -> BTreeSet<GroupId> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .filter_map(|g| match GroupId::new(g) {
            Ok(group) => Some(group),
            Err(err) => {
                warn!(group = g, error = %err, "ignoring invalid monitored group");
                None
            }
        })
        .collect()
}

fn default_data_dir() -> PathBuf {
    if let Ok(home) = env::var("HOME") {
        let home = home.trim();
        if !home.is_empty() {
            return PathBuf::from(home).join(".receipts");
        }
    }
    PathBuf::from(".receipts")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_from(vars: &[(&str, &str)], secrets: &[(ReceiptSecretId, &str)]) -> RuntimeConfig {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let secrets: BTreeMap<ReceiptSecretId, String> =
            secrets.iter().map(|(k, v)| (*k, v.to_string())).collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned(), |id| secrets.get(&id).cloned())
    }

    #[test]
    fn at_config_01_defaults_when_nothing_is_set() {
        let config = config_from(&[], &[]);
        assert!(config.correlation.monitored_groups.is_empty());
        assert_eq!(config.correlation.claim, ClaimParserConfig::mvp_v1());
        assert_eq!(config.correlation.pending.ttl_ms, 120_000);
        assert_eq!(config.correlation.matcher.threshold, 80);
        assert_eq!(config.correlation.matcher.pool_limit, 100);
        assert!(!config.correlation.forward_on_store);
        assert_eq!(config.forward_queue_capacity, 256);
        assert_eq!(config.http_bind, "127.0.0.1:8080");
        assert_eq!(config.bot.api_base, TELEGRAM_API_BASE_DEFAULT);
        assert!(config.encryption_key.is_none());
        assert!(config.webhook_secret.is_none());
        assert!(config.store_path.ends_with("store.jsonl"));
    }

    #[test]
    fn at_config_02_explicit_values_are_applied() {
        let config = config_from(
            &[
                ("RECEIPTS_MONITORED_GROUPS", "a@g.us, b@g.us,,"),
                ("RECEIPTS_CLAIM_KEYWORDS", "RECC, recibo"),
                ("RECEIPTS_PENDING_IMAGE_TTL_SECS", "300"),
                ("RECEIPTS_MATCH_THRESHOLD", "85"),
                ("RECEIPTS_FORWARD_ON_STORE", "yes"),
                ("RECEIPTS_ADMIN_CHAT_ID", " 999 "),
                ("RECEIPTS_TELEGRAM_API_URL", "http://127.0.0.1:9000/"),
                ("RECEIPTS_STORE_PATH", "/tmp/r/store.jsonl"),
            ],
            &[
                (ReceiptSecretId::WebhookSecret, "s3cret"),
                (ReceiptSecretId::OperatorBotToken, "1:abc"),
            ],
        );
        assert_eq!(config.correlation.monitored_groups.len(), 2);
        assert_eq!(config.correlation.claim.keywords, vec!["recc", "recibo"]);
        assert_eq!(config.correlation.pending.ttl_ms, 300_000);
        assert_eq!(config.correlation.matcher.threshold, 85);
        assert!(config.correlation.forward_on_store);
        assert_eq!(config.correlation.admin_chat_id.as_deref(), Some("999"));
        assert_eq!(config.bot.api_base, "http://127.0.0.1:9000");
        assert_eq!(config.bot.bot_token.as_deref(), Some("1:abc"));
        assert_eq!(config.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.store_path, PathBuf::from("/tmp/r/store.jsonl"));
    }

    #[test]
    fn at_config_03_out_of_range_numbers_fall_back() {
        let config = config_from(
            &[
                ("RECEIPTS_PENDING_IMAGE_TTL_SECS", "0"),
                ("RECEIPTS_MATCH_THRESHOLD", "101"),
                ("RECEIPTS_MATCH_POOL_LIMIT", "abc"),
                ("RECEIPTS_FORWARD_QUEUE_CAPACITY", "1000000"),
                ("RECEIPTS_MEDIA_TIMEOUT_MS", "5"),
            ],
            &[],
        );
        assert_eq!(config.correlation.pending.ttl_ms, 120_000);
        assert_eq!(config.correlation.matcher.threshold, 80);
        assert_eq!(config.correlation.matcher.pool_limit, 100);
        assert_eq!(config.forward_queue_capacity, 256);
        assert_eq!(config.media.request_timeout_ms, 15_000);
    }

    #[test]
    fn at_config_04_debug_redacts_secrets() {
        let config = config_from(
            &[],
            &[
                (ReceiptSecretId::WebhookSecret, "hook-secret"),
                (ReceiptSecretId::ReceiptEncryptionKey, "enc-secret"),
                (ReceiptSecretId::MediaApiKey, "media-secret"),
            ],
        );
        let rendered = format!("{config:?}");
        for secret in ["hook-secret", "enc-secret", "media-secret"] {
            assert!(!rendered.contains(secret));
        }
    }
}
