//! Message contracts between the controller, the session server, the
//! display and the cover producers.
//!
//! All JSON bodies use camelCase keys. The controller addresses individual
//! state fields by a short identifier such as `deck0content` or `mixer`;
//! the values are opaque to the server except for the deck content fields,
//! whose `filePath` names the cover asset a deck currently needs.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A controller state snapshot: field identifier -> opaque JSON value.
pub type FieldMap = Map<String, Value>;

/// Fields whose value carries the file path of the track loaded on a deck.
pub const DECK_CONTENT_FIELDS: [&str; 4] =
    ["deck0content", "deck1content", "deck2content", "deck3content"];

/// Key inside a deck content value holding the track's file path.
pub const FILE_PATH_KEY: &str = "filePath";

/// Maximum length of a field identifier.
const MAX_FIELD_LEN: usize = 64;

/// Validate a field identifier: 1-64 chars, ASCII alphanumeric, `_` or `-`.
pub fn validate_field(field: &str) -> Result<(), String> {
    if field.is_empty() {
        return Err("field must not be empty".into());
    }
    if field.len() > MAX_FIELD_LEN {
        return Err(format!(
            "field too long ({} chars, max {})",
            field.len(),
            MAX_FIELD_LEN
        ));
    }
    if !field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!("field contains invalid characters: {field}"));
    }
    Ok(())
}

/// Extract the asset key (track file path) from a deck content value.
///
/// Returns `None` for anything that is not an object with a non-empty
/// string `filePath`, which is how an empty deck is reported.
pub fn asset_key(value: &Value) -> Option<&str> {
    value
        .get(FILE_PATH_KEY)
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
}

#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint {endpoint}: {reason}")]
pub struct EndpointError {
    pub endpoint: String,
    pub reason: String,
}

/// Parse a session server endpoint such as `http://host:8080/`.
///
/// Only http(s) URLs are accepted. A trailing slash is added so relative
/// joins (`connect`, `cover/ws`) land under the endpoint's path.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, EndpointError> {
    let invalid = |reason: String| EndpointError {
        endpoint: endpoint.to_owned(),
        reason,
    };
    let mut url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("expected an http(s) URL".into()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Response to `GET /connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    pub debug_logging: bool,
}

/// Body of `POST /init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub session_id: String,
    /// Controller wall clock in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub state: FieldMap,
}

/// Body of `POST /update/{field}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub session_id: String,
    pub state: Value,
}

/// Body of `POST /session/reset`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default)]
    pub debug_logging: Option<bool>,
}

/// A consistent view of the server-side session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub session_id: String,
    pub initialized: bool,
    pub state: Option<FieldMap>,
    pub required: Vec<String>,
    pub loaded: Vec<String>,
    pub needed: Vec<String>,
}

/// Events published to display consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MirrorEvent {
    /// Full snapshot, sent when a display attaches or after it lagged.
    Sync { snapshot: StateSnapshot },
    /// A controller session was initialized with a full state.
    #[serde(rename_all = "camelCase")]
    Initialized {
        session_id: String,
        time_offset_ms: Option<i64>,
        state: FieldMap,
    },
    /// A single field changed on an initialized session.
    Updated { field: String, value: Value },
    /// The session was reset; all mirrored state is gone.
    #[serde(rename_all = "camelCase")]
    Reset { session_id: String },
    /// Cover data for `path` is available from `/cover/image`.
    CoverLoaded { path: String },
    /// A log line sent by the controller.
    Log { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_field_accepts_known_fields() {
        for field in DECK_CONTENT_FIELDS {
            assert!(validate_field(field).is_ok());
        }
        assert!(validate_field("mixer").is_ok());
        assert!(validate_field("deck_0-playstate").is_ok());
    }

    #[test]
    fn validate_field_rejects_bad_input() {
        assert!(validate_field("").is_err());
        assert!(validate_field(&"a".repeat(65)).is_err());
        assert!(validate_field("deck0/content").is_err());
        assert!(validate_field("deck 0").is_err());
    }

    #[test]
    fn asset_key_reads_file_path() {
        let value = json!({ "filePath": "/music/a.mp3", "title": "A" });
        assert_eq!(asset_key(&value), Some("/music/a.mp3"));
    }

    #[test]
    fn asset_key_ignores_empty_or_missing_path() {
        assert_eq!(asset_key(&json!({ "filePath": "" })), None);
        assert_eq!(asset_key(&json!({ "title": "A" })), None);
        assert_eq!(asset_key(&json!({ "filePath": 3 })), None);
        assert_eq!(asset_key(&json!(null)), None);
    }

    #[test]
    fn parse_endpoint_appends_trailing_slash() {
        let url = parse_endpoint("http://localhost:8080").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");
        let url = parse_endpoint("http://host:8080/decks").unwrap();
        assert_eq!(
            url.join("connect").unwrap().as_str(),
            "http://host:8080/decks/connect"
        );
    }

    #[test]
    fn parse_endpoint_rejects_garbage() {
        assert!(parse_endpoint("not a url").is_err());
        let err = parse_endpoint("mailto:dj@example.com").unwrap_err();
        assert!(err.to_string().contains("expected an http(s) URL"));
    }

    #[test]
    fn connect_response_uses_camel_case() {
        let resp = ConnectResponse {
            session_id: "abc".into(),
            debug_logging: true,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, json!({ "sessionId": "abc", "debugLogging": true }));
    }

    #[test]
    fn init_request_timestamp_is_optional() {
        let req: InitRequest =
            serde_json::from_value(json!({ "sessionId": "s", "state": { "mixer": {} } })).unwrap();
        assert_eq!(req.timestamp, None);
        assert!(req.state.contains_key("mixer"));

        let req: InitRequest = serde_json::from_value(
            json!({ "sessionId": "s", "timestamp": 1700000000000u64, "state": {} }),
        )
        .unwrap();
        assert_eq!(req.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn mirror_event_is_tagged() {
        let event = MirrorEvent::Reset {
            session_id: "s2".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({ "event": "reset", "sessionId": "s2" }));

        let event = MirrorEvent::CoverLoaded {
            path: "/a.mp3".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({ "event": "coverLoaded", "path": "/a.mp3" }));
    }
}
