//! Text rendering for inbound events.
//!
//! Every rendered message is framed by separator lines and lists its
//! metadata in a fixed order:
//!
//! ```text
//! ────────────────────────────────────────────────────────────────────────────────
//! Timestamp: 2024-05-01T12:00:00.000
//! Event: ping
//! Client ID: N/A
//! Connection ID: N/A
//! Data: hello
//! ────────────────────────────────────────────────────────────────────────────────
//! ```
//!
//! Renderers are looked up per event name through a [`RendererRegistry`], so
//! a deployment can route one event name to a more verbose layout without
//! touching the standard path.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use chrono::{Local, TimeZone};
use serde_json::Value;
use thiserror::Error;

use crate::constants::{
    GQL_RESULT_EVENT, NOT_AVAILABLE, SEPARATOR_CHAR, SEPARATOR_WIDTH, TIMESTAMP_FORMAT,
    UNNAMED_EVENT,
};
use crate::decode::{decode, decode_or_diagnostic, diagnostic, DecodedPayload};
use crate::message::{Message, PresenceMessage};

/// Failure while rendering a single event.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Formatting into the output buffer failed.
    #[error("format error")]
    Format(#[from] fmt::Error),

    /// The renderer panicked.
    #[error("renderer panicked: {0}")]
    Panicked(String),

    /// Writing rendered text to the output failed.
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

/// Formats a message as text.
pub trait MessageRenderer: Send + Sync {
    /// Renders `message`. With `debug`, a raw attribute dump is appended.
    fn render(&self, message: &Message, debug: bool) -> Result<String, RenderError>;
}

/// Default layout for all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRenderer;

impl MessageRenderer for StandardRenderer {
    fn render(&self, message: &Message, debug: bool) -> Result<String, RenderError> {
        let mut out = String::new();
        write_header(&mut out, message)?;
        writeln!(
            out,
            "Data: {}",
            decode_or_diagnostic(message.data.as_ref(), message.encoding.as_deref())
        )?;
        if let Some(extras) = message.non_empty_extras() {
            writeln!(out, "Extras: {extras}")?;
        }
        writeln!(out, "{}", separator())?;

        if debug {
            write_raw_dump(&mut out, message)?;
        }
        Ok(out)
    }
}

/// Expanded layout: message id, encoding tag, pretty-printed JSON payloads
/// and extras whenever present.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerboseRenderer;

impl MessageRenderer for VerboseRenderer {
    fn render(&self, message: &Message, debug: bool) -> Result<String, RenderError> {
        let mut out = String::new();
        write_header(&mut out, message)?;
        writeln!(
            out,
            "Message ID: {}",
            message.id.as_deref().unwrap_or(NOT_AVAILABLE)
        )?;
        writeln!(
            out,
            "Encoding: {}",
            message.encoding.as_deref().unwrap_or("none")
        )?;

        match decode(message.data.as_ref(), message.encoding.as_deref()) {
            Ok(payload) => match pretty_json(&payload) {
                Some(pretty) => writeln!(out, "Data:\n{pretty}")?,
                None => writeln!(out, "Data: {payload}")?,
            },
            Err(e) => writeln!(out, "Data: {}", diagnostic(&e))?,
        }

        if let Some(extras) = message.extras.as_ref().filter(|v| !v.is_null()) {
            match serde_json::to_string_pretty(extras) {
                Ok(pretty) => writeln!(out, "Extras:\n{pretty}")?,
                Err(e) => writeln!(out, "Extras: <unrenderable: {e}>")?,
            }
        }
        writeln!(out, "{}", separator())?;

        if debug {
            write_raw_dump(&mut out, message)?;
        }
        Ok(out)
    }
}

/// Structured payloads (decoded JSON text or passthrough JSON) pretty-printed.
fn pretty_json(payload: &DecodedPayload) -> Option<String> {
    let value = match payload {
        DecodedPayload::Json(value) => value.clone(),
        DecodedPayload::Text(text) => match serde_json::from_str::<Value>(text) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
            _ => return None,
        },
        DecodedPayload::Null | DecodedPayload::Binary(_) => return None,
    };
    serde_json::to_string_pretty(&value).ok()
}

/// Renders a presence update.
///
/// Presence output is only produced in debug mode; otherwise `None`.
pub fn render_presence(
    presence: &PresenceMessage,
    debug: bool,
) -> Result<Option<String>, RenderError> {
    if !debug {
        return Ok(None);
    }

    let mut out = String::new();
    writeln!(out, "{}", separator())?;
    writeln!(out, "Presence: {}", presence.action)?;
    writeln!(out, "Timestamp: {}", format_timestamp(presence.timestamp))?;
    writeln!(
        out,
        "Client ID: {}",
        presence.client_id.as_deref().unwrap_or(NOT_AVAILABLE)
    )?;
    writeln!(
        out,
        "Connection ID: {}",
        presence.connection_id.as_deref().unwrap_or(NOT_AVAILABLE)
    )?;
    writeln!(
        out,
        "Data: {}",
        decode_or_diagnostic(presence.data.as_ref(), presence.encoding.as_deref())
    )?;
    writeln!(out, "{}", separator())?;
    Ok(Some(out))
}

/// Separator line framing each event.
pub fn separator() -> String {
    std::iter::repeat(SEPARATOR_CHAR)
        .take(SEPARATOR_WIDTH)
        .collect()
}

/// Formats epoch milliseconds as local date-time with millisecond precision.
pub fn format_timestamp(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        None => format!("<invalid timestamp {millis}>"),
    }
}

fn write_header(out: &mut String, message: &Message) -> fmt::Result {
    writeln!(out, "{}", separator())?;
    writeln!(out, "Timestamp: {}", format_timestamp(message.timestamp))?;
    writeln!(out, "Event: {}", message.name().unwrap_or(UNNAMED_EVENT))?;
    writeln!(
        out,
        "Client ID: {}",
        message.client_id.as_deref().unwrap_or(NOT_AVAILABLE)
    )?;
    writeln!(
        out,
        "Connection ID: {}",
        message.connection_id.as_deref().unwrap_or(NOT_AVAILABLE)
    )
}

/// Best-effort dump of every attribute of the raw event.
fn write_raw_dump(out: &mut String, message: &Message) -> fmt::Result {
    writeln!(out, "Raw event:")?;
    for (name, value) in raw_attributes(message) {
        match value {
            Ok(text) => writeln!(out, "  {name}: {text}")?,
            Err(e) => writeln!(out, "  {name}: <unrenderable: {e}>")?,
        }
    }
    Ok(())
}

fn raw_attributes(message: &Message) -> Vec<(&'static str, Result<String, String>)> {
    vec![
        ("id", Ok(optional(message.id.as_deref()))),
        ("name", Ok(optional(message.name.as_deref()))),
        ("timestamp", Ok(message.timestamp.to_string())),
        ("clientId", Ok(optional(message.client_id.as_deref()))),
        ("connectionId", Ok(optional(message.connection_id.as_deref()))),
        ("data", stringify(message.data.as_ref())),
        ("encoding", Ok(optional(message.encoding.as_deref()))),
        ("extras", stringify(message.extras.as_ref())),
    ]
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("null").to_string()
}

fn stringify(value: Option<&Value>) -> Result<String, String> {
    serde_json::to_string(&value).map_err(|e| e.to_string())
}

/// Per-event-name renderer lookup with a default fallback.
pub struct RendererRegistry {
    default: Box<dyn MessageRenderer>,
    overrides: HashMap<String, Box<dyn MessageRenderer>>,
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.overrides.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RendererRegistry")
            .field("overrides", &names)
            .finish_non_exhaustive()
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new(StandardRenderer)
    }
}

impl RendererRegistry {
    /// Registry with `default` and no overrides.
    pub fn new(default: impl MessageRenderer + 'static) -> Self {
        Self {
            default: Box::new(default),
            overrides: HashMap::new(),
        }
    }

    /// Standard renderer plus the built-in `gql-result` override.
    pub fn with_builtin_overrides() -> Self {
        let mut registry = Self::default();
        registry.register(GQL_RESULT_EVENT, VerboseRenderer);
        registry
    }

    /// Routes messages named `name` to `renderer`, returning any previous override.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        renderer: impl MessageRenderer + 'static,
    ) -> Option<Box<dyn MessageRenderer>> {
        self.overrides.insert(name.into(), Box::new(renderer))
    }

    /// Removes the override for `name`.
    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn MessageRenderer>> {
        self.overrides.remove(name)
    }

    /// Returns `true` if `name` has an override.
    pub fn has_override(&self, name: &str) -> bool {
        self.overrides.contains_key(name)
    }

    /// Renderer responsible for messages with this name.
    pub fn renderer_for(&self, name: Option<&str>) -> &dyn MessageRenderer {
        match name.and_then(|n| self.overrides.get(n)) {
            Some(renderer) => renderer.as_ref(),
            None => self.default.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn test_standard_layout() {
        let msg = Message {
            name: Some("ping".to_string()),
            timestamp: 0,
            client_id: Some("alice".to_string()),
            data: Some(json!("a")),
            ..Message::default()
        };

        let text = StandardRenderer.render(&msg, false).unwrap();
        let lines = lines(&text);
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], separator());
        assert!(lines[1].starts_with("Timestamp: "));
        assert_eq!(lines[2], "Event: ping");
        assert_eq!(lines[3], "Client ID: alice");
        assert_eq!(lines[4], "Connection ID: N/A");
        assert_eq!(lines[5], "Data: a");
        assert_eq!(lines[6], separator());
    }

    #[test]
    fn test_missing_fields_use_sentinels() {
        let text = StandardRenderer.render(&Message::default(), false).unwrap();
        assert!(text.contains("Event: unnamed\n"));
        assert!(text.contains("Client ID: N/A\n"));
        assert!(text.contains("Data: null\n"));
        assert!(!text.contains("Extras:"));
    }

    #[test]
    fn test_extras_only_when_present() {
        let mut msg = Message::new("ping", "a");
        msg.extras = Some(json!({"headers": {"k": "v"}}));
        let text = StandardRenderer.render(&msg, false).unwrap();
        assert!(text.contains("Extras: {\"headers\":{\"k\":\"v\"}}\n"));

        msg.extras = Some(json!({}));
        let text = StandardRenderer.render(&msg, false).unwrap();
        assert!(!text.contains("Extras:"));
    }

    #[test]
    fn test_base64_data_decoded() {
        let mut msg = Message::new("ping", "aGVsbG8=");
        msg.encoding = Some("base64".to_string());
        let text = StandardRenderer.render(&msg, false).unwrap();
        assert!(text.contains("Data: hello\n"));
    }

    #[test]
    fn test_malformed_base64_rendered_inline() {
        let mut msg = Message::new("ping", "!!!invalid");
        msg.encoding = Some("base64".to_string());
        let text = StandardRenderer.render(&msg, false).unwrap();
        assert!(text.contains("Data: <decode error: base64:"));
        assert!(text.contains("Event: ping\n"));
    }

    #[test]
    fn test_debug_appends_raw_dump() {
        let mut msg = Message::new("ping", "a");
        msg.id = Some("id-1".to_string());
        let text = StandardRenderer.render(&msg, true).unwrap();
        assert!(text.contains("Raw event:\n"));
        assert!(text.contains("  id: id-1\n"));
        assert!(text.contains("  data: \"a\"\n"));
        assert!(text.contains("  extras: null\n"));

        let plain = StandardRenderer.render(&msg, false).unwrap();
        assert!(!plain.contains("Raw event:"));
    }

    #[test]
    fn test_verbose_renderer_pretty_prints_json() {
        let mut msg = Message::new(GQL_RESULT_EVENT, base64_of("{\"data\":{\"ok\":true}}"));
        msg.encoding = Some("base64".to_string());
        msg.extras = Some(json!({}));

        let text = VerboseRenderer.render(&msg, false).unwrap();
        assert!(text.contains("Event: gql-result\n"));
        assert!(text.contains("Encoding: base64\n"));
        assert!(text.contains("Data:\n{\n  \"data\": {\n    \"ok\": true\n  }\n}\n"));
        assert!(text.contains("Extras:\n{}\n"));
    }

    #[test]
    fn test_verbose_renderer_decode_error_inline() {
        let mut msg = Message::new(GQL_RESULT_EVENT, "%%%");
        msg.encoding = Some("base64".to_string());
        let text = VerboseRenderer.render(&msg, false).unwrap();
        assert!(text.contains("Data: <decode error:"));
    }

    #[test]
    fn test_presence_only_in_debug() {
        let presence = PresenceMessage {
            action: crate::message::PresenceAction::Enter,
            client_id: Some("bob".to_string()),
            data: Some(json!("hi")),
            ..PresenceMessage::default()
        };
        assert!(render_presence(&presence, false).unwrap().is_none());

        let text = render_presence(&presence, true).unwrap().unwrap();
        assert!(text.contains("Presence: enter\n"));
        assert!(text.contains("Client ID: bob\n"));
        assert!(text.contains("Connection ID: N/A\n"));
        assert!(text.contains("Data: hi\n"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RendererRegistry::with_builtin_overrides();
        assert!(registry.has_override(GQL_RESULT_EVENT));

        let gql = Message::new(GQL_RESULT_EVENT, "x");
        let text = registry.renderer_for(gql.name()).render(&gql, false).unwrap();
        assert!(text.contains("Message ID: N/A\n"));

        let other = Message::new("ping", "x");
        let text = registry.renderer_for(other.name()).render(&other, false).unwrap();
        assert!(!text.contains("Message ID:"));

        let text = registry.renderer_for(None).render(&Message::default(), false).unwrap();
        assert!(text.contains("Event: unnamed\n"));
    }

    #[test]
    fn test_registry_unregister() {
        let mut registry = RendererRegistry::with_builtin_overrides();
        assert!(registry.unregister(GQL_RESULT_EVENT).is_some());
        assert!(!registry.has_override(GQL_RESULT_EVENT));
        assert_eq!(
            format!("{registry:?}"),
            "RendererRegistry { overrides: [], .. }"
        );
    }

    #[test]
    fn test_separator_width() {
        assert_eq!(separator().chars().count(), 80);
    }

    #[test]
    fn test_format_timestamp_millis() {
        let text = format_timestamp(1_700_000_000_123);
        assert!(text.ends_with(".123"), "{text}");
    }

    fn base64_of(text: &str) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(text)
    }
}
