#![forbid(unsafe_code)]

//! Turns gateway webhook bodies into canonical [`NormalizedMessage`] records.
//!
//! The gateway emits several incompatible envelopes for the same underlying chat message. Known
//! envelopes are detected first ([`PayloadShape`]); when none matches, a bounded structural walk
//! looks for an embedded `lastMessage` object or any object carrying a chat id. Normalization
//! never fails: malformed input yields an empty list.

use serde_json::{Map, Value};

use receipts_kernel_contracts::message::{
    GroupId, MediaRef, NormalizedMessage, SenderId, GROUP_CHAT_SUFFIX, MAX_MESSAGE_TEXT_LEN,
};
use receipts_kernel_contracts::MonotonicTimeNs;

const MAX_WALK_DEPTH: usize = 8;
const MAX_MESSAGES_PER_PAYLOAD: usize = 256;
const BASE64_BLOB_MIN_LEN: usize = 64;

/// Base64 encodings of JPEG, PNG, GIF, WEBP and PDF magic numbers.
const BASE64_MAGIC_PREFIXES: &[&str] = &["/9j/", "iVBORw0KGgo", "R0lGOD", "UklGR", "JVBERi0"];
const DATA_URI_PREFIXES: &[&str] = &["data:image/", "data:application/"];

type FieldPath = &'static [&'static str];

const GROUP_ID_PATHS: &[FieldPath] = &[
    &["key", "remoteJid"],
    &["chatId"],
    &["chat_id"],
    &["remoteJid"],
    &["from"],
    &["to"],
    &["chat", "id"],
    &["id", "remote"],
    &["_data", "id", "remote"],
];

const SENDER_ID_PATHS: &[FieldPath] = &[
    &["key", "participant"],
    &["participant"],
    &["author"],
    &["sender", "id"],
    &["sender"],
    &["senderId"],
    &["sender_id"],
    &["_data", "author"],
    &["_data", "participant"],
];

// Explicit body/caption fields come before deeply nested ones.
const TEXT_PATHS: &[FieldPath] = &[
    &["body"],
    &["text"],
    &["caption"],
    &["text", "body"],
    &["message", "conversation"],
    &["message", "extendedTextMessage", "text"],
    &["message", "imageMessage", "caption"],
    &["message", "documentMessage", "caption"],
    &["message", "videoMessage", "caption"],
    &["message", "text"],
    &["message", "caption"],
    &["media", "caption"],
    &["_data", "body"],
    &["_data", "caption"],
];

// Top-level fields first, then the nested and legacy names.
const MEDIA_REF_PATHS: &[FieldPath] = &[
    &["mediaUrl"],
    &["media_url"],
    &["fileUrl"],
    &["media", "url"],
    &["media", "mediaUrl"],
    &["media", "media_url"],
    &["media", "fileUrl"],
    &["media"],
    &["message", "mediaUrl"],
    &["message", "media", "url"],
    &["message", "imageMessage", "url"],
    &["message", "imageMessage", "mediaUrl"],
    &["message", "documentMessage", "url"],
    &["message", "documentMessage", "mediaUrl"],
    &["_data", "mediaUrl"],
    &["_data", "deprecatedMms3Url"],
    &["_data", "clientUrl"],
];

const TIMESTAMP_PATHS: &[FieldPath] = &[
    &["timestamp"],
    &["messageTimestamp"],
    &["t"],
    &["_data", "t"],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Flat,
    Wrapped,
    NestedEvent,
    MessagesArray,
    DataEnvelope,
    Fallback,
    Unrecognized,
}

impl PayloadShape {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Wrapped => "wrapped",
            Self::NestedEvent => "nested_event",
            Self::MessagesArray => "messages_array",
            Self::DataEnvelope => "data_envelope",
            Self::Fallback => "fallback",
            Self::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingGroup,
    NotGroupChat,
    InvalidField(&'static str),
}

impl DropReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingGroup => "missing_group",
            Self::NotGroupChat => "not_group_chat",
            Self::InvalidField(field) => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub shape: PayloadShape,
    pub messages: Vec<NormalizedMessage>,
    pub dropped: Vec<DropReason>,
}

#[derive(Debug, Clone, Copy)]
enum KnownShape<'a> {
    Flat(&'a Map<String, Value>),
    Wrapped(&'a Value),
    NestedEvent(&'a Value),
    MessagesArray(&'a [Value]),
    DataEnvelope(&'a Value),
}

impl<'a> KnownShape<'a> {
    fn detect(raw: &'a Value) -> Option<Self> {
        match raw {
            Value::Array(items) => Some(Self::MessagesArray(items)),
            Value::Object(obj) => {
                if let Some(Value::Object(inner)) = obj.get("event") {
                    if let Some(data) = inner.get("data").or_else(|| inner.get("payload")) {
                        return Some(Self::NestedEvent(data));
                    }
                }
                if let Some(Value::Array(items)) = obj.get("messages") {
                    return Some(Self::MessagesArray(items));
                }
                if let Some(payload @ (Value::Object(_) | Value::Array(_))) = obj.get("payload") {
                    return Some(Self::Wrapped(payload));
                }
                if let Some(data @ (Value::Object(_) | Value::Array(_))) = obj.get("data") {
                    return Some(Self::DataEnvelope(data));
                }
                if looks_like_message(obj) {
                    return Some(Self::Flat(obj));
                }
                None
            }
            _ => None,
        }
    }

    fn shape(self) -> PayloadShape {
        match self {
            Self::Flat(_) => PayloadShape::Flat,
            Self::Wrapped(_) => PayloadShape::Wrapped,
            Self::NestedEvent(_) => PayloadShape::NestedEvent,
            Self::MessagesArray(_) => PayloadShape::MessagesArray,
            Self::DataEnvelope(_) => PayloadShape::DataEnvelope,
        }
    }

    fn message_objects(self) -> Vec<&'a Map<String, Value>> {
        match self {
            Self::Flat(obj) => vec![obj],
            Self::Wrapped(value) | Self::NestedEvent(value) | Self::DataEnvelope(value) => {
                objects_in(value)
            }
            Self::MessagesArray(items) => items.iter().filter_map(Value::as_object).collect(),
        }
    }
}

/// Returns every in-scope message embedded in `raw`. Never panics on malformed input.
pub fn normalize(raw: &Value, now: MonotonicTimeNs) -> Vec<NormalizedMessage> {
    normalize_with_stats(raw, now).messages
}

pub fn normalize_with_stats(raw: &Value, now: MonotonicTimeNs) -> NormalizeOutcome {
    let now = MonotonicTimeNs(now.0.max(1));
    let (shape, objects) = match KnownShape::detect(raw) {
        Some(known) => {
            let objects = known.message_objects();
            if objects.is_empty() {
                (PayloadShape::Fallback, fallback_message_objects(raw))
            } else {
                (known.shape(), objects)
            }
        }
        None => (PayloadShape::Fallback, fallback_message_objects(raw)),
    };
    let shape = if objects.is_empty() {
        PayloadShape::Unrecognized
    } else {
        shape
    };

    let mut messages = Vec::new();
    let mut dropped = Vec::new();
    for obj in objects.into_iter().take(MAX_MESSAGES_PER_PAYLOAD) {
        match normalize_message(obj, now) {
            Ok(message) => messages.push(message),
            Err(reason) => dropped.push(reason),
        }
    }
    NormalizeOutcome {
        shape,
        messages,
        dropped,
    }
}

fn normalize_message(
    obj: &Map<String, Value>,
    now: MonotonicTimeNs,
) -> Result<NormalizedMessage, DropReason> {
    let raw_group = select_group_id(obj).ok_or(DropReason::MissingGroup)?;
    let group_id = GroupId::new(raw_group).map_err(|_| DropReason::InvalidField("group_id"))?;
    if !group_id.is_group_chat() {
        return Err(DropReason::NotGroupChat);
    }
    let sender_id = first_id_string(obj, SENDER_ID_PATHS).and_then(|s| SenderId::new(s).ok());
    let text = select_text(obj);
    let media_ref = first_id_string(obj, MEDIA_REF_PATHS).and_then(|s| MediaRef::new(s).ok());
    let received_at = select_timestamp(obj).unwrap_or(now);
    NormalizedMessage::v1(group_id, sender_id, text, media_ref, received_at)
        .map_err(|_| DropReason::InvalidField("normalized_message"))
}

/// Heuristic for inline binary payloads that must never be treated as customer text.
pub fn looks_like_base64_blob(candidate: &str) -> bool {
    let s = candidate.trim();
    if DATA_URI_PREFIXES.iter().any(|p| s.starts_with(p)) {
        return true;
    }
    if BASE64_MAGIC_PREFIXES.iter().any(|p| s.starts_with(p)) {
        return true;
    }
    s.len() >= BASE64_BLOB_MIN_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

fn select_text(obj: &Map<String, Value>) -> String {
    let candidates: Vec<&str> = TEXT_PATHS
        .iter()
        .filter_map(|path| value_at(obj, path))
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if let Some(human) = candidates.iter().find(|c| !looks_like_base64_blob(c)) {
        return clip_text(human);
    }
    // Last resort: the shortest raw candidate, even if it may not be human text.
    candidates
        .iter()
        .min_by_key(|c| c.len())
        .map(|c| clip_text(c))
        .unwrap_or_default()
}

fn select_group_id(obj: &Map<String, Value>) -> Option<&str> {
    let candidates: Vec<&str> = GROUP_ID_PATHS
        .iter()
        .filter_map(|path| value_at(obj, path))
        .filter_map(as_id_str)
        .collect();
    candidates
        .iter()
        .find(|c| c.ends_with(GROUP_CHAT_SUFFIX))
        .or_else(|| candidates.first())
        .copied()
}

fn select_timestamp(obj: &Map<String, Value>) -> Option<MonotonicTimeNs> {
    TIMESTAMP_PATHS
        .iter()
        .filter_map(|path| value_at(obj, path))
        .find_map(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .filter(|raw| *raw > 0)
        .map(|raw| {
            // Gateways disagree on seconds vs milliseconds.
            if raw > 1_000_000_000_000 {
                MonotonicTimeNs(raw.saturating_mul(1_000_000))
            } else {
                MonotonicTimeNs::from_unix_secs(raw)
            }
        })
}

fn first_id_string<'a>(obj: &'a Map<String, Value>, paths: &[FieldPath]) -> Option<&'a str> {
    paths
        .iter()
        .filter_map(|path| value_at(obj, path))
        .find_map(as_id_str)
}

fn value_at<'a>(obj: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = obj.get(*first)?;
    for key in rest {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Ids arrive either as plain strings or as `{ "_serialized": "..." }` objects.
fn as_id_str(value: &Value) -> Option<&str> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("_serialized")?.as_str()?,
        _ => return None,
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn looks_like_message(obj: &Map<String, Value>) -> bool {
    GROUP_ID_PATHS
        .iter()
        .filter_map(|path| value_at(obj, path))
        .any(|v| as_id_str(v).is_some())
}

fn objects_in(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Object(obj) => {
            if let Some(Value::Array(items)) = obj.get("messages") {
                return items.iter().filter_map(Value::as_object).collect();
            }
            vec![obj]
        }
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn fallback_message_objects(raw: &Value) -> Vec<&Map<String, Value>> {
    let mut out = Vec::new();
    collect_last_messages(raw, 0, &mut out);
    if out.is_empty() {
        if let Some(obj) = first_message_like(raw, 0) {
            out.push(obj);
        }
    }
    out
}

fn collect_last_messages<'a>(value: &'a Value, depth: usize, out: &mut Vec<&'a Map<String, Value>>) {
    if depth > MAX_WALK_DEPTH || out.len() >= MAX_MESSAGES_PER_PAYLOAD {
        return;
    }
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                if matches!(key.as_str(), "lastMessage" | "last_message") {
                    if let Value::Object(message) = child {
                        out.push(message);
                        continue;
                    }
                }
                collect_last_messages(child, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_last_messages(item, depth + 1, out);
            }
        }
        _ => {}
    }
}

fn first_message_like(value: &Value, depth: usize) -> Option<&Map<String, Value>> {
    if depth > MAX_WALK_DEPTH {
        return None;
    }
    match value {
        Value::Object(obj) => {
            if looks_like_message(obj) {
                return Some(obj);
            }
            obj.values()
                .find_map(|child| first_message_like(child, depth + 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|child| first_message_like(child, depth + 1)),
        _ => None,
    }
}

fn clip_text(raw: &str) -> String {
    if raw.len() <= MAX_MESSAGE_TEXT_LEN {
        return raw.to_string();
    }
    let mut end = MAX_MESSAGE_TEXT_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: MonotonicTimeNs = MonotonicTimeNs(1_700_000_000_000_000_000);

    fn base64_blob(len: usize) -> String {
        "QUJD".repeat(len / 4 + 1)[..len].to_string()
    }

    #[test]
    fn at_norm_01_flat_event_is_normalized() {
        let raw = json!({
            "from": "120363403036388430@g.us",
            "participant": "5511999990000@c.us",
            "body": "recc Maria Silva",
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::Flat);
        assert_eq!(out.messages.len(), 1);
        let m = &out.messages[0];
        assert_eq!(m.group_id.as_str(), "120363403036388430@g.us");
        assert_eq!(m.sender_id.as_ref().unwrap().as_str(), "5511999990000@c.us");
        assert_eq!(m.text, "recc Maria Silva");
        assert!(m.media_ref.is_none());
        assert_eq!(m.received_at, NOW);
    }

    #[test]
    fn at_norm_02_wrapped_event_uses_payload() {
        let raw = json!({
            "event": "message",
            "session": "default",
            "payload": {
                "from": "g1@g.us",
                "author": "s1@c.us",
                "caption": "hello",
                "media": { "url": "https://gw.local/files/1.jpg" },
                "timestamp": 1_700_000_123u64,
            }
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::Wrapped);
        assert_eq!(out.messages.len(), 1);
        let m = &out.messages[0];
        assert_eq!(m.text, "hello");
        assert_eq!(m.media_ref.as_ref().unwrap().as_str(), "https://gw.local/files/1.jpg");
        assert_eq!(m.received_at, MonotonicTimeNs::from_unix_secs(1_700_000_123));
    }

    #[test]
    fn at_norm_03_nested_event_yields_every_message() {
        let raw = json!({
            "event": {
                "event": "messages.upsert",
                "data": [
                    { "key": { "remoteJid": "g1@g.us", "participant": "a@s.whatsapp.net" },
                      "message": { "conversation": "first" } },
                    { "key": { "remoteJid": "g1@g.us", "participant": "b@s.whatsapp.net" },
                      "message": { "extendedTextMessage": { "text": "second" } } }
                ]
            }
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::NestedEvent);
        let texts: Vec<&str> = out.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn at_norm_04_messages_array_is_supported() {
        let raw = json!({
            "messages": [
                { "chatId": "g2@g.us", "sender": { "id": "s2@c.us" }, "text": "Joao" },
                "not-an-object",
                { "chatId": "g2@g.us", "sender": "s3@c.us", "text": { "body": "Ana" } }
            ]
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::MessagesArray);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].sender_id.as_ref().unwrap().as_str(), "s2@c.us");
        assert_eq!(out.messages[1].text, "Ana");
    }

    #[test]
    fn at_norm_05_data_envelope_reads_nested_image_message() {
        let raw = json!({
            "event": "messages.upsert",
            "instance": "main",
            "data": {
                "key": { "remoteJid": "g3@g.us", "participant": "p@s.whatsapp.net", "fromMe": false },
                "pushName": "Someone",
                "message": { "imageMessage": { "url": "https://mmg.whatsapp.net/x.enc", "caption": "recc Ana" } },
                "messageTimestamp": "1700000200"
            }
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::DataEnvelope);
        let m = &out.messages[0];
        assert_eq!(m.text, "recc Ana");
        assert_eq!(m.media_ref.as_ref().unwrap().as_str(), "https://mmg.whatsapp.net/x.enc");
        assert_eq!(m.received_at, MonotonicTimeNs::from_unix_secs(1_700_000_200));
    }

    #[test]
    fn at_norm_06_fallback_walker_finds_last_message() {
        let raw = json!({
            "kind": "chat_sync",
            "chats": [
                { "name": "Receipts", "lastMessage": { "from": "g4@g.us", "author": "s@c.us", "body": "Carlos" } }
            ]
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.shape, PayloadShape::Fallback);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].text, "Carlos");
    }

    #[test]
    fn at_norm_07_malformed_input_never_panics() {
        let inputs = vec![
            Value::Null,
            json!(42),
            json!("text"),
            json!([]),
            json!({}),
            json!({ "event": { "event": "x" } }),
            json!({ "payload": 3, "data": null }),
            json!({ "foo": { "bar": [1, 2, { "baz": true }] } }),
            json!({ "messages": [null, 1, "x"] }),
        ];
        for raw in inputs {
            assert!(normalize(&raw, NOW).is_empty(), "unexpected output for {raw}");
        }
    }

    #[test]
    fn at_norm_08_base64_body_loses_to_human_caption() {
        let raw = json!({
            "from": "g1@g.us",
            "participant": "s@c.us",
            "body": base64_blob(300),
            "caption": "Maria Silva",
        });
        let out = normalize(&raw, NOW);
        assert_eq!(out[0].text, "Maria Silva");
    }

    #[test]
    fn at_norm_09_only_base64_candidates_fall_back_to_shortest() {
        let short = format!("/9j/{}", base64_blob(80));
        let raw = json!({
            "from": "g1@g.us",
            "participant": "s@c.us",
            "body": base64_blob(300),
            "_data": { "body": short.clone() },
        });
        let out = normalize(&raw, NOW);
        assert_eq!(out[0].text, short);
    }

    #[test]
    fn at_norm_10_non_group_chat_is_dropped_silently() {
        let raw = json!({
            "messages": [
                { "from": "5511999990000@c.us", "body": "direct" },
                { "from": "g1@g.us", "participant": "s@c.us", "body": "group" }
            ]
        });
        let out = normalize_with_stats(&raw, NOW);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.dropped, vec![DropReason::NotGroupChat]);
    }

    #[test]
    fn at_norm_11_top_level_media_wins_over_nested() {
        let raw = json!({
            "from": "g1@g.us",
            "participant": "s@c.us",
            "mediaUrl": "https://gw.local/top.jpg",
            "_data": { "deprecatedMms3Url": "https://legacy.local/nested.jpg" }
        });
        let out = normalize(&raw, NOW);
        assert_eq!(out[0].media_ref.as_ref().unwrap().as_str(), "https://gw.local/top.jpg");

        let legacy_only = json!({
            "from": "g1@g.us",
            "participant": "s@c.us",
            "_data": { "deprecatedMms3Url": "https://legacy.local/nested.jpg" }
        });
        let out = normalize(&legacy_only, NOW);
        assert_eq!(
            out[0].media_ref.as_ref().unwrap().as_str(),
            "https://legacy.local/nested.jpg"
        );
    }

    #[test]
    fn at_norm_12_group_id_prefers_group_suffix_and_serialized_ids() {
        let raw = json!({
            "from": { "_serialized": "5511999990000@c.us" },
            "to": { "server": "g.us", "_serialized": "g9@g.us" },
            "author": "me@c.us",
            "body": "x"
        });
        let out = normalize(&raw, NOW);
        assert_eq!(out[0].group_id.as_str(), "g9@g.us");
    }

    #[test]
    fn at_norm_13_base64_heuristic() {
        assert!(looks_like_base64_blob(&base64_blob(300)));
        assert!(looks_like_base64_blob("iVBORw0KGgoAAAANSUhEUg"));
        assert!(looks_like_base64_blob("data:image/png;base64,AAAA"));
        assert!(!looks_like_base64_blob("Maria Silva"));
        assert!(!looks_like_base64_blob("MariaSilva"));
    }

    #[test]
    fn at_norm_14_millisecond_timestamps_are_scaled() {
        let raw = json!({ "from": "g1@g.us", "body": "x", "timestamp": 1_700_000_000_123u64 });
        let out = normalize(&raw, NOW);
        assert_eq!(out[0].received_at, MonotonicTimeNs(1_700_000_000_123_000_000));
        assert!(out[0].sender_id.is_none());
    }
}
