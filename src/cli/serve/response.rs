//! HTTP response handlers.

use crate::{
    embed,
    utils::mime::{self, types},
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{fs, path::Path};
use tiny_http::{Header, Method, Request, Response, StatusCode};

/// Read a file for sending, injecting the client script into HTML.
pub fn read_file(path: &Path) -> Result<(&'static str, Vec<u8>)> {
    let content_type = mime::from_path(path);
    let body = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if mime::is_html(content_type) {
        return Ok((content_type, inject_client_script(&body)));
    }
    Ok((content_type, body))
}

/// Respond with an already loaded file.
pub fn respond_loaded(request: Request, content_type: &'static str, body: Vec<u8>) -> Result<()> {
    if is_head_request(&request) {
        return send_head(request, 200, content_type);
    }
    send_body(request, 200, content_type, body)
}

/// Respond with a JSON body.
pub fn respond_json<T: Serialize>(request: Request, status: u16, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    send_body(request, status, types::JSON, body)
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Respond with `{"error": message}`.
pub fn respond_error(request: Request, status: u16, message: &str) -> Result<()> {
    respond_json(request, status, &ErrorBody { error: message })
}

/// Respond with 404, using the build's own `404.html` body when given.
pub fn respond_not_found(request: Request, custom_404: Option<Vec<u8>>) -> Result<()> {
    let (content_type, body) = match custom_404 {
        Some(page) => (types::HTML, inject_client_script(&page)),
        None => (types::PLAIN, b"404 Not Found".to_vec()),
    };
    if is_head_request(&request) {
        return send_head(request, 404, content_type);
    }
    send_body(request, 404, content_type, body)
}

/// Respond with 503 while no build exists yet. The page reloads itself.
pub fn respond_no_build(request: Request) -> Result<()> {
    let body = inject_client_script(embed::UNAVAILABLE_HTML.as_bytes());
    send_body(request, 503, types::HTML, body)
}

/// Respond with 503 Service Unavailable (server shutting down).
pub fn respond_unavailable(request: Request) -> Result<()> {
    send_body(request, 503, types::PLAIN, b"503 Service Unavailable".to_vec())
}

pub fn respond_method_not_allowed(request: Request) -> Result<()> {
    send_body(request, 405, types::PLAIN, b"405 Method Not Allowed".to_vec())
}

/// Respond with the embedded client script.
pub fn respond_client_js(request: Request) -> Result<()> {
    send_body(
        request,
        200,
        types::JAVASCRIPT,
        embed::CLIENT_JS.as_bytes().to_vec(),
    )
}

/// Inject the client `<script>` before the last `</body>`, or append it.
pub fn inject_client_script(content: &[u8]) -> Vec<u8> {
    let script = embed::client_script_tag();
    let script_bytes = script.as_bytes();

    const PATTERN: &[u8] = b"</body>";

    let mut result = Vec::with_capacity(content.len() + script_bytes.len());
    match content
        .windows(PATTERN.len())
        .rposition(|w| w.eq_ignore_ascii_case(PATTERN))
    {
        Some(pos) => {
            result.extend_from_slice(&content[..pos]);
            result.extend_from_slice(script_bytes);
            result.extend_from_slice(&content[pos..]);
        }
        None => {
            result.extend_from_slice(content);
            result.extend_from_slice(script_bytes);
        }
    }
    result
}

pub fn is_head_request(request: &Request) -> bool {
    request.method() == &Method::Head
}

fn send_head(request: Request, status: u16, content_type: &'static str) -> Result<()> {
    let response =
        Response::empty(StatusCode(status)).with_header(make_header("Content-Type", content_type));
    request.respond(response)?;
    Ok(())
}

fn send_body(
    request: Request,
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
) -> Result<()> {
    let response = Response::from_data(body)
        .with_status_code(StatusCode(status))
        .with_header(make_header("Content-Type", content_type))
        .with_header(make_header("Cache-Control", "no-cache"));
    request.respond(response)?;
    Ok(())
}

/// Header from static strings; both are ASCII literals.
fn make_header(key: &'static str, value: &'static str) -> Header {
    Header::from_bytes(key, value).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_before_last_body() {
        let html = b"<html><body><pre></body></pre></BODY></html>";
        let out = String::from_utf8(inject_client_script(html)).unwrap();
        let tag = embed::client_script_tag();
        assert_eq!(
            out,
            format!("<html><body><pre></body></pre>{tag}</BODY></html>")
        );
    }

    #[test]
    fn test_inject_appends_without_body() {
        let out = String::from_utf8(inject_client_script(b"<p>fragment</p>")).unwrap();
        assert!(out.starts_with("<p>fragment</p><script"));
        assert!(out.contains(embed::CLIENT_JS_PATH));
    }
}
