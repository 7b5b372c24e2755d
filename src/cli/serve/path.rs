//! URL to filesystem path resolution.

use std::path::{Path, PathBuf};

/// Resolve URL to a file under `serve_root`, handling index.html for directories
pub fn resolve_path(url: &str, serve_root: &Path) -> Option<PathBuf> {
    let clean = normalize_url(url);

    // Reject paths with suspicious patterns early
    if clean.contains("..") {
        return None;
    }

    let local = serve_root.join(&clean);

    // Canonicalize to resolve symlinks and verify path is under serve_root
    let canonical = local.canonicalize().ok()?;
    let root_canonical = serve_root.canonicalize().ok()?;

    if !canonical.starts_with(&root_canonical) {
        return None;
    }

    if canonical.is_file() {
        return Some(canonical);
    }

    if canonical.is_dir() {
        let index = canonical.join("index.html");
        if index.is_file() {
            return Some(index);
        }
    }

    None
}

/// Normalize URL: strip query and fragment, decode, trim slashes
fn normalize_url(url: &str) -> String {
    use percent_encoding::percent_decode_str;

    let path = url.split(['?', '#']).next().unwrap_or(url);
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_default();

    decoded.trim_matches('/').to_string()
}

/// Path part of a URL, without query string.
pub fn url_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Decoded path of a `Referer` URL (`http://host:port/a/b.html?x` -> `/a/b.html`).
pub fn referer_path(referer: &str) -> Option<String> {
    use percent_encoding::percent_decode_str;

    let after_scheme = referer.split_once("://").map_or(referer, |(_, rest)| rest);
    let path = &after_scheme[after_scheme.find('/')?..];
    let path = path.split(['?', '#']).next().unwrap_or(path);
    percent_decode_str(path)
        .decode_utf8()
        .ok()
        .map(std::borrow::Cow::into_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("site");
        fs::create_dir_all(root.join("intro")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("index.html"), "home").unwrap();
        fs::write(root.join("intro/index.html"), "intro").unwrap();
        fs::write(root.join("intro/a b.png"), "img").unwrap();
        fs::write(tmp.path().join("secret"), "s").unwrap();
        tmp
    }

    #[test]
    fn test_resolve_files_and_indexes() {
        let tmp = site();
        let root = tmp.path().join("site");
        let root_c = root.canonicalize().unwrap();

        assert_eq!(resolve_path("/", &root), Some(root_c.join("index.html")));
        assert_eq!(
            resolve_path("/intro/?x=1", &root),
            Some(root_c.join("intro/index.html"))
        );
        assert_eq!(
            resolve_path("/intro/index.html#top", &root),
            Some(root_c.join("intro/index.html"))
        );
        assert_eq!(
            resolve_path("/intro/a%20b.png", &root),
            Some(root_c.join("intro/a b.png"))
        );
        assert_eq!(resolve_path("/empty/", &root), None);
        assert_eq!(resolve_path("/missing.html", &root), None);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let tmp = site();
        let root = tmp.path().join("site");

        assert_eq!(resolve_path("/../secret", &root), None);
        assert_eq!(resolve_path("/%2e%2e/secret", &root), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let tmp = site();
        let root = tmp.path().join("site");
        std::os::unix::fs::symlink(tmp.path().join("secret"), root.join("link")).unwrap();

        assert_eq!(resolve_path("/link", &root), None);
    }

    #[test]
    fn test_referer_path() {
        assert_eq!(
            referer_path("http://127.0.0.1:5280/intro/index.html?x=1#q").as_deref(),
            Some("/intro/index.html")
        );
        assert_eq!(
            referer_path("https://example.org/a%20b/").as_deref(),
            Some("/a b/")
        );
        assert_eq!(referer_path("http://example.org").as_deref(), None);
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("/_events/watch?x"), "/_events/watch");
        assert_eq!(url_path("/a/"), "/a/");
    }
}
