//! Assets compiled into the binary.
//!
//! - [`CLIENT_JS`]: the live-reload / subscription client, served at
//!   [`CLIENT_JS_PATH`] and injected into every HTML page
//! - [`UNAVAILABLE_HTML`]: shown until the first build succeeds

/// URL path of the embedded client.
pub const CLIENT_JS_PATH: &str = "/_events/client.js";

pub const CLIENT_JS: &str = include_str!("client.js");

/// Reloads itself through the client once a build is published.
pub const UNAVAILABLE_HTML: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Building…</title></head>
<body><p>No build available yet. This page reloads when the first build completes.</p></body></html>
";

/// `<script>` tag loading the client.
pub fn client_script_tag() -> String {
    format!(r#"<script src="{CLIENT_JS_PATH}" defer></script>"#)
}
