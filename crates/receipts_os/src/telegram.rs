#![forbid(unsafe_code)]

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::forward::OperatorChannel;

pub const TELEGRAM_API_BASE_DEFAULT: &str = "https://api.telegram.org";
/// Bot API limit for document captions, in characters.
pub const TELEGRAM_CAPTION_MAX_CHARS: usize = 1_024;
pub const TELEGRAM_MESSAGE_MAX_CHARS: usize = 4_096;
const NO_CHANNEL: &str = "no operator channel configured";

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramBotConfig {
    pub api_base: String,
    pub bot_token: Option<String>,
    pub operator_chat_id: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for TelegramBotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBotConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("operator_chat_id", &self.operator_chat_id)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl TelegramBotConfig {
    pub fn mvp_v1() -> Self {
        Self {
            api_base: TELEGRAM_API_BASE_DEFAULT.to_string(),
            bot_token: None,
            operator_chat_id: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }

    /// A channel can only deliver with both a token and a destination.
    pub fn is_deliverable(&self) -> bool {
        self.bot_token.is_some() && self.operator_chat_id.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API client owned by the forward worker. The agent keeps its connection pool alive
/// between tasks.
pub struct TelegramBotChannel {
    agent: ureq::Agent,
    api_base: String,
    bot_token: String,
    default_chat_id: String,
}

impl std::fmt::Debug for TelegramBotChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBotChannel")
            .field("api_base", &self.api_base)
            .field("default_chat_id", &self.default_chat_id)
            .finish()
    }
}

impl TelegramBotChannel {
    /// `None` when the config lacks a token or a destination chat.
    pub fn from_config(config: &TelegramBotConfig) -> Option<Self> {
        let bot_token = config.bot_token.clone()?;
        let default_chat_id = config.operator_chat_id.clone()?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Some(Self {
            agent,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token,
            default_chat_id,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn resolve_chat<'a>(&'a self, chat_id: Option<&'a str>) -> &'a str {
        chat_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.default_chat_id)
    }

    fn finish(
        result: Result<ureq::Response, ureq::Error>,
        method: &'static str,
    ) -> Result<(), DeliveryError> {
        let resp = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                debug!(method, code, "bot api refused request");
                return match serde_json::from_str::<BotApiResponse>(&body)
                    .ok()
                    .and_then(|parsed| parsed.description)
                {
                    Some(description) if code == 400 || code == 403 => {
                        Err(DeliveryError::Rejected(description))
                    }
                    _ => Err(DeliveryError::Status(code)),
                };
            }
            Err(ureq::Error::Transport(err)) => {
                // Transport errors can echo the request url, which carries the token.
                return Err(DeliveryError::Transport(err.kind().to_string()));
            }
        };
        let body = resp
            .into_string()
            .map_err(|err| DeliveryError::Transport(format!("response read failed: {err}")))?;
        let parsed: BotApiResponse = serde_json::from_str(&body)
            .map_err(|err| DeliveryError::Rejected(format!("unparseable bot api response: {err}")))?;
        if !parsed.ok {
            return Err(DeliveryError::Rejected(
                parsed
                    .description
                    .unwrap_or_else(|| "bot api answered ok=false".to_string()),
            ));
        }
        Ok(())
    }
}

impl OperatorChannel for TelegramBotChannel {
    fn send_document(
        &mut self,
        chat_id: Option<&str>,
        file_name: &str,
        bytes: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        let chat = self.resolve_chat(chat_id).to_string();
        let caption = clip_chars(caption, TELEGRAM_CAPTION_MAX_CHARS);
        let boundary = multipart_boundary();
        let body = multipart_body(
            &boundary,
            &[("chat_id", chat.as_str()), ("caption", caption.as_str())],
            ("document", file_name, bytes),
        );
        let result = self
            .agent
            .post(&self.method_url("sendDocument"))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body);
        Self::finish(result, "sendDocument")?;
        info!(chat_id = %chat, file_name, bytes = bytes.len(), "document delivered");
        Ok(())
    }

    fn send_message(&mut self, chat_id: Option<&str>, text: &str) -> Result<(), DeliveryError> {
        let chat = self.resolve_chat(chat_id).to_string();
        let payload = serde_json::json!({
            "chat_id": chat,
            "text": clip_chars(text, TELEGRAM_MESSAGE_MAX_CHARS),
        });
        let result = self
            .agent
            .post(&self.method_url("sendMessage"))
            .set("Content-Type", "application/json")
            .send_string(&payload.to_string());
        Self::finish(result, "sendMessage")?;
        info!(chat_id = %chat, "message delivered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telegram_bot"
    }
}

/// Used when no bot is configured. Deliveries are logged and refused, so matched receipts stay
/// unforwarded until a real channel is set up.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyChannel;

impl OperatorChannel for LogOnlyChannel {
    fn send_document(
        &mut self,
        chat_id: Option<&str>,
        file_name: &str,
        bytes: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        info!(
            chat_id = chat_id.unwrap_or("default"),
            file_name,
            bytes = bytes.len(),
            caption_len = caption.len(),
            "log-only channel: document not delivered"
        );
        Err(DeliveryError::Rejected(NO_CHANNEL.to_string()))
    }

    fn send_message(&mut self, chat_id: Option<&str>, text: &str) -> Result<(), DeliveryError> {
        info!(
            chat_id = chat_id.unwrap_or("default"),
            text_len = text.len(),
            "log-only channel: message not delivered"
        );
        Err(DeliveryError::Rejected(NO_CHANNEL.to_string()))
    }

    fn name(&self) -> &'static str {
        "log_only"
    }
}

fn clip_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}

fn multipart_boundary() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("----receipts{suffix}")
}

fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.2.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    let (field, file_name, bytes) = file;
    let file_name = file_name.replace(['"', '\r', '\n'], "_");
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_telegram_01_channel_requires_token_and_chat() {
        let mut config = TelegramBotConfig::mvp_v1();
        assert!(TelegramBotChannel::from_config(&config).is_none());
        config.bot_token = Some("123:abc".to_string());
        assert!(TelegramBotChannel::from_config(&config).is_none());
        config.operator_chat_id = Some("-100200".to_string());
        assert!(config.is_deliverable());
        let channel = TelegramBotChannel::from_config(&config).unwrap();
        assert_eq!(
            channel.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        assert_eq!(channel.resolve_chat(None), "-100200");
        assert_eq!(channel.resolve_chat(Some("admin")), "admin");
        assert!(!format!("{channel:?}").contains("123:abc"));
        assert!(!format!("{config:?}").contains("123:abc"));
    }

    #[test]
    fn at_telegram_02_multipart_body_layout() {
        let body = multipart_body(
            "B",
            &[("chat_id", "42"), ("caption", "Receipt: Maria")],
            ("document", "r\"x.jpg", b"\xff\xd8\xff"),
        );
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--B\r\nContent-Disposition: form-data; name=\"chat_id\"\r\n\r\n42\r\n"));
        assert!(text.contains("name=\"caption\"\r\n\r\nReceipt: Maria\r\n"));
        assert!(text.contains("filename=\"r_x.jpg\""));
        assert!(text.ends_with("\r\n--B--\r\n"));
        assert!(body.windows(3).any(|w| w == [0xff, 0xd8, 0xff]));
    }

    #[test]
    fn at_telegram_03_caption_is_clipped_on_char_boundary() {
        let caption = "é".repeat(2_000);
        let clipped = clip_chars(&caption, TELEGRAM_CAPTION_MAX_CHARS);
        assert_eq!(clipped.chars().count(), TELEGRAM_CAPTION_MAX_CHARS);
    }

    #[test]
    fn at_telegram_04_log_only_channel_refuses_delivery() {
        let mut channel = LogOnlyChannel;
        assert!(matches!(
            channel.send_document(None, "a.jpg", b"x", "cap"),
            Err(DeliveryError::Rejected(_))
        ));
        assert!(channel.send_message(Some("admin"), "hello").is_err());
        assert_eq!(channel.name(), "log_only");
    }
}
