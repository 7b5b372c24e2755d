//! Content types for served build output and event responses.

use std::path::Path;

pub mod types {
    pub const HTML: &str = "text/html; charset=utf-8";
    pub const PLAIN: &str = "text/plain; charset=utf-8";
    pub const CSS: &str = "text/css; charset=utf-8";
    pub const JAVASCRIPT: &str = "text/javascript; charset=utf-8";
    pub const JSON: &str = "application/json";
    pub const NDJSON: &str = "application/x-ndjson";
    pub const XML: &str = "application/xml";
    pub const PDF: &str = "application/pdf";
    pub const WASM: &str = "application/wasm";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    pub const PNG: &str = "image/png";
    pub const JPEG: &str = "image/jpeg";
    pub const GIF: &str = "image/gif";
    pub const WEBP: &str = "image/webp";
    pub const SVG: &str = "image/svg+xml";
    pub const ICO: &str = "image/x-icon";

    pub const WOFF: &str = "font/woff";
    pub const WOFF2: &str = "font/woff2";
    pub const TTF: &str = "font/ttf";
    pub const OTF: &str = "font/otf";

    pub const MP4: &str = "video/mp4";
    pub const WEBM: &str = "video/webm";
}

/// Guess the content type from a file extension.
pub fn from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => types::HTML,
        Some("css") => types::CSS,
        Some("js" | "mjs") => types::JAVASCRIPT,
        Some("json" | "map") => types::JSON,
        Some("xml") => types::XML,
        Some("txt" | "rst" | "md") => types::PLAIN,
        Some("pdf") => types::PDF,
        Some("wasm") => types::WASM,

        Some("png") => types::PNG,
        Some("jpg" | "jpeg") => types::JPEG,
        Some("gif") => types::GIF,
        Some("webp") => types::WEBP,
        Some("svg") => types::SVG,
        Some("ico") => types::ICO,

        Some("woff") => types::WOFF,
        Some("woff2") => types::WOFF2,
        Some("ttf") => types::TTF,
        Some("otf") => types::OTF,

        Some("mp4") => types::MP4,
        Some("webm") => types::WEBM,

        _ => types::OCTET_STREAM,
    }
}

pub fn is_html(mime: &str) -> bool {
    mime.starts_with("text/html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(from_path(Path::new("index.html")), types::HTML);
        assert_eq!(from_path(Path::new("INDEX.HTM")), types::HTML);
        assert_eq!(from_path(Path::new("_static/app.js")), types::JAVASCRIPT);
        assert_eq!(from_path(Path::new("logo.svg")), types::SVG);
        assert_eq!(from_path(Path::new("objects.inv")), types::OCTET_STREAM);
        assert_eq!(from_path(Path::new("noext")), types::OCTET_STREAM);
    }

    #[test]
    fn test_is_html() {
        assert!(is_html(types::HTML));
        assert!(!is_html(types::CSS));
    }
}
