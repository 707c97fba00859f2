#![forbid(unsafe_code)]

use std::io::Read;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use receipts_kernel_contracts::message::MediaRef;

use crate::error::CorrelationError;

pub const MEDIA_MAX_BYTES_DEFAULT: u64 = 20 * 1024 * 1024;

/// Resolves a media reference to raw bytes. No retries at this layer.
pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, media_ref: &MediaRef) -> Result<Vec<u8>, CorrelationError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct HttpMediaFetcherConfig {
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_bytes: u64,
}

impl std::fmt::Debug for HttpMediaFetcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMediaFetcherConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl HttpMediaFetcherConfig {
    pub fn mvp_v1() -> Self {
        Self {
            api_key: None,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 15_000,
            max_bytes: MEDIA_MAX_BYTES_DEFAULT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    agent: ureq::Agent,
    config: HttpMediaFetcherConfig,
}

impl HttpMediaFetcher {
    pub fn new(config: HttpMediaFetcherConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Self { agent, config }
    }

    fn fetch_http(&self, url: &url::Url) -> Result<Vec<u8>, CorrelationError> {
        let mut req = self.agent.get(url.as_str());
        if let Some(key) = self.config.api_key.as_ref() {
            req = req.set("apikey", key);
        }
        let resp = match req.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                return Err(CorrelationError::Fetch(format!(
                    "media download failed with http status {code}"
                )))
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(CorrelationError::Fetch(format!(
                    "media transport error: {err}"
                )))
            }
        };
        let mut body = Vec::new();
        resp.into_reader()
            .take(self.config.max_bytes.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|err| CorrelationError::Fetch(format!("media body read failed: {err}")))?;
        if body.len() as u64 > self.config.max_bytes {
            return Err(CorrelationError::Fetch(format!(
                "media exceeds {} bytes",
                self.config.max_bytes
            )));
        }
        if body.is_empty() {
            return Err(CorrelationError::Fetch("media body is empty".to_string()));
        }
        Ok(body)
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch(&self, media_ref: &MediaRef) -> Result<Vec<u8>, CorrelationError> {
        let raw = media_ref.as_str();
        if raw.starts_with("data:") {
            return decode_data_uri(raw, self.config.max_bytes);
        }
        let url = url::Url::parse(raw)
            .map_err(|err| CorrelationError::Fetch(format!("media reference is not a url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CorrelationError::Fetch(format!(
                "unsupported media scheme {}",
                url.scheme()
            )));
        }
        self.fetch_http(&url)
    }
}

/// Some gateways inline small media as `data:<mime>;base64,<payload>`.
fn decode_data_uri(raw: &str, max_bytes: u64) -> Result<Vec<u8>, CorrelationError> {
    let (header, payload) = raw
        .split_once(',')
        .ok_or_else(|| CorrelationError::Fetch("data uri without payload".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(CorrelationError::Fetch(
            "only base64 data uris are supported".to_string(),
        ));
    }
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .map_err(|err| CorrelationError::Fetch(format!("data uri decode failed: {err}")))?;
    if bytes.is_empty() || bytes.len() as u64 > max_bytes {
        return Err(CorrelationError::Fetch(
            "data uri payload size out of bounds".to_string(),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> HttpMediaFetcher {
        HttpMediaFetcher::new(HttpMediaFetcherConfig::mvp_v1())
    }

    #[test]
    fn at_fetch_01_data_uri_is_decoded_locally() {
        let media = MediaRef::new(format!("data:image/png;base64,{}", BASE64.encode(b"png!"))).unwrap();
        assert_eq!(fetcher().fetch(&media).unwrap(), b"png!".to_vec());
    }

    #[test]
    fn at_fetch_02_bad_references_fail_as_fetch_errors() {
        for raw in ["not a url", "ftp://host/file.jpg", "data:image/png,raw", "data:image/png;base64,"] {
            let media = MediaRef::new(raw).unwrap();
            assert!(
                matches!(fetcher().fetch(&media), Err(CorrelationError::Fetch(_))),
                "{raw} should fail"
            );
        }
    }

    #[test]
    fn at_fetch_03_oversized_inline_media_is_refused() {
        let media = MediaRef::new(format!("data:image/jpeg;base64,{}", BASE64.encode([0u8; 64]))).unwrap();
        let small = HttpMediaFetcher::new(HttpMediaFetcherConfig {
            max_bytes: 16,
            ..HttpMediaFetcherConfig::mvp_v1()
        });
        assert!(matches!(small.fetch(&media), Err(CorrelationError::Fetch(_))));
    }

    #[test]
    fn at_fetch_04_config_debug_redacts_api_key() {
        let config = HttpMediaFetcherConfig {
            api_key: Some("very-secret".to_string()),
            ..HttpMediaFetcherConfig::mvp_v1()
        };
        assert!(!format!("{config:?}").contains("very-secret"));
    }
}
