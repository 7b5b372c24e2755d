//! Wire format of the `/_events` endpoints.
//!
//! Requests are JSON bodies; the watch stream is newline-delimited JSON with
//! bare `\n` lines as keep-alives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::observable::{Record, Wid};

/// One subscription request: a client-chosen id and a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEntry {
    pub wid: Wid,
    pub req: Value,
}

/// Body of `POST /_events/watch`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WatchRequest {
    pub add: Vec<WatchEntry>,
}

/// Body of `POST /_events/sub`.
#[derive(Debug, Deserialize)]
pub struct SubRequest {
    pub sid: String,
    #[serde(default)]
    pub add: Vec<WatchEntry>,
    #[serde(default)]
    pub remove: Vec<Wid>,
}

/// Body of `POST /_events/vote`.
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub origin: String,
    pub id: String,
    pub voter: String,
    pub answer: String,
}

/// First line of a watch stream.
#[derive(Debug, Serialize)]
pub struct Opened<'a> {
    pub sid: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<Wid>,
}

/// Response to `POST /_events/sub`.
#[derive(Debug, Serialize)]
pub struct SubResult {
    pub failed: Vec<Wid>,
}

/// Frame a record as one stream line. `data` is already JSON.
pub fn frame(record: &Record) -> String {
    format!("{{\"wid\":{},\"data\":{}}}\n", record.wid, record.data)
}

/// Frame a JSON message as one stream line.
pub fn line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut text = serde_json::to_string(message)?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_frame_record() {
        let record = Record {
            wid: 3,
            data: Arc::from(r#"{"show":true}"#),
        };
        assert_eq!(frame(&record), "{\"wid\":3,\"data\":{\"show\":true}}\n");
    }

    #[test]
    fn test_opened_omits_empty_failed() {
        let opened = Opened {
            sid: "abc",
            failed: vec![],
        };
        assert_eq!(line(&opened).unwrap(), "{\"sid\":\"abc\"}\n");

        let opened = Opened {
            sid: "abc",
            failed: vec![2],
        };
        assert_eq!(line(&opened).unwrap(), "{\"sid\":\"abc\",\"failed\":[2]}\n");
    }

    #[test]
    fn test_parse_sub_request_defaults() {
        let req: SubRequest = serde_json::from_str(r#"{"sid":"x"}"#).unwrap();
        assert_eq!(req.sid, "x");
        assert!(req.add.is_empty());
        assert!(req.remove.is_empty());

        let req: WatchRequest =
            serde_json::from_str(r#"{"add":[{"wid":1,"req":{"name":"build"}}]}"#).unwrap();
        assert_eq!(req.add[0].wid, 1);
    }
}
