//! Typed parsing of `GB(...)` payloads
//!
//! A payload is a JSON object whose `"t"` field selects the message schema.
//! Companion apps embed binary-safe text as `atob("<base64>")` call tokens;
//! those are expanded to plain JSON strings before the object is parsed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

/// Message discriminators carried in the `"t"` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Notify,
    NotifyRemove,
    Call,
    Http,
    MusicInfo,
    MusicState,
    Unknown,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "notify" => MessageType::Notify,
            "notify-" => MessageType::NotifyRemove,
            "call" => MessageType::Call,
            "http" => MessageType::Http,
            "musicinfo" => MessageType::MusicInfo,
            "musicstate" => MessageType::MusicState,
            _ => MessageType::Unknown,
        }
    }
}

/// New or updated notification from the companion app. Every field is
/// optional on the wire; handlers check what was actually present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Notify {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub sender: Option<String>,
    pub tel: Option<String>,
}

/// Dismissal of a previously delivered notification
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotifyRemove {
    pub id: Option<i64>,
}

/// Phone call state change
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Call {
    pub cmd: Option<String>,
    pub name: Option<String>,
    pub number: Option<String>,
}

/// Response to an HTTP request made on the watch's behalf
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HttpResponse {
    pub id: Option<String>,
    pub resp: Option<String>,
    pub err: Option<String>,
}

/// Now-playing track metadata
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MusicInfo {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    #[serde(rename = "dur")]
    pub duration: Option<i64>,
    #[serde(rename = "c")]
    pub track_count: Option<i64>,
    #[serde(rename = "n")]
    pub track_number: Option<i64>,
}

/// Playback state
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MusicState {
    pub state: Option<String>,
    pub position: Option<i64>,
    pub shuffle: Option<i64>,
    pub repeat: Option<i64>,
}

/// Per-type message callbacks. Default implementations log the fields that
/// were present on the wire.
pub trait MessageHandler: Send {
    fn on_notify(&mut self, msg: Notify) {
        tracing::debug!("Notify:");
        if let Some(id) = msg.id {
            tracing::debug!("     ID: {}", id);
        }
        if let Some(title) = &msg.title {
            tracing::debug!("  Title: {}", title);
        }
        if let Some(subject) = &msg.subject {
            tracing::debug!("Subject: {}", subject);
        }
        if let Some(body) = &msg.body {
            tracing::debug!("   Body: {}", body);
        }
        if let Some(sender) = &msg.sender {
            tracing::debug!(" Sender: {}", sender);
        }
        if let Some(tel) = &msg.tel {
            tracing::debug!("    Tel: {}", tel);
        }
    }

    fn on_notify_remove(&mut self, msg: NotifyRemove) {
        tracing::debug!("Notify Remove:");
        if let Some(id) = msg.id {
            tracing::debug!("ID: {}", id);
        }
    }

    fn on_call(&mut self, msg: Call) {
        tracing::debug!("Call:");
        if let Some(cmd) = &msg.cmd {
            tracing::debug!("   CMD: {}", cmd);
        }
        if let Some(name) = &msg.name {
            tracing::debug!("  Name: {}", name);
        }
        if let Some(number) = &msg.number {
            tracing::debug!("Number: {}", number);
        }
    }

    fn on_http_response(&mut self, msg: HttpResponse) {
        tracing::debug!("HTTP Response:");
        if let Some(id) = &msg.id {
            tracing::debug!("  ID: {}", id);
        }
        if let Some(resp) = &msg.resp {
            tracing::debug!("Resp: {}", resp);
        }
        if let Some(err) = &msg.err {
            tracing::debug!(" Err: {}", err);
        }
    }

    fn on_music_info(&mut self, msg: MusicInfo) {
        tracing::debug!("Music Info:");
        if let Some(artist) = &msg.artist {
            tracing::debug!("      Artist: {}", artist);
        }
        if let Some(album) = &msg.album {
            tracing::debug!("       Album: {}", album);
        }
        if let Some(track) = &msg.track {
            tracing::debug!("       Track: {}", track);
        }
        if let Some(duration) = msg.duration {
            tracing::debug!("    Duration: {}", duration);
        }
        if let Some(count) = msg.track_count {
            tracing::debug!(" Track count: {}", count);
        }
        if let Some(number) = msg.track_number {
            tracing::debug!("Track number: {}", number);
        }
    }

    fn on_music_state(&mut self, msg: MusicState) {
        tracing::debug!("Music State:");
        if let Some(state) = &msg.state {
            tracing::debug!("   State: {}", state);
        }
        if let Some(position) = msg.position {
            tracing::debug!("Position: {}", position);
        }
        if let Some(shuffle) = msg.shuffle {
            tracing::debug!(" Shuffle: {}", shuffle);
        }
        if let Some(repeat) = msg.repeat {
            tracing::debug!("  Repeat: {}", repeat);
        }
    }

    fn on_unknown(&mut self, raw: &str) {
        tracing::debug!("{}", raw);
    }
}

/// Logging-only handler installed when the embedder provides nothing else
#[derive(Debug, Default)]
pub struct LogHandler;

impl MessageHandler for LogHandler {}

/// Expand every `atob("<base64>")` token into the JSON string it decodes to.
/// Source is scanned left to right and the expanded result written to a
/// second buffer; a token that fails to decode is passed through untouched.
pub fn expand_atob(input: &str) -> String {
    const TOKEN_OPEN: &str = "atob(\"";
    const TOKEN_CLOSE: &str = "\")";

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(TOKEN_OPEN) {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + TOKEN_OPEN.len()..];
        let Some(end) = after.find(TOKEN_CLOSE) else {
            tracing::warn!("Unterminated atob token");
            out.push_str(&rest[idx..]);
            return out;
        };
        let token = &after[..end];
        let span = &rest[idx..idx + TOKEN_OPEN.len() + end + TOKEN_CLOSE.len()];
        match BASE64.decode(token) {
            Ok(decoded) => match String::from_utf8(decoded) {
                Ok(text) => out.push_str(&Value::String(text).to_string()),
                Err(_) => {
                    tracing::warn!("atob token decodes to non-UTF-8 data");
                    out.push_str(span);
                }
            },
            Err(e) => {
                tracing::warn!("Invalid base64 in atob token: {}", e);
                out.push_str(span);
            }
        }
        rest = &after[end + TOKEN_CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Parse one `GB(...)` body and hand the typed message to the handler.
/// Malformed JSON drops the message without touching any handler state.
pub fn parse_gb(body: &str, handler: &mut dyn MessageHandler) {
    let expanded = expand_atob(body);
    let value: Value = match serde_json::from_str(&expanded) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("JSON decode error: {}", e);
            return;
        }
    };
    let tag = value.get("t").and_then(Value::as_str).unwrap_or_default();
    match MessageType::from_tag(tag) {
        MessageType::Notify => match serde_json::from_value(value) {
            Ok(msg) => handler.on_notify(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::NotifyRemove => match serde_json::from_value(value) {
            Ok(msg) => handler.on_notify_remove(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::Call => match serde_json::from_value(value) {
            Ok(msg) => handler.on_call(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::Http => match serde_json::from_value(value) {
            Ok(msg) => handler.on_http_response(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::MusicInfo => match serde_json::from_value(value) {
            Ok(msg) => handler.on_music_info(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::MusicState => match serde_json::from_value(value) {
            Ok(msg) => handler.on_music_state(msg),
            Err(e) => tracing::error!("JSON parse error: {}", e),
        },
        MessageType::Unknown => handler.on_unknown(&expanded),
    }
}
