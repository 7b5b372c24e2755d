//! Subscription request descriptors and their content-addressed keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EventError;

/// What a client asks to watch. `name` selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Descriptor {
    /// Identifier of the build currently served.
    Build,
    /// Vote tally of poll `id` on page `origin`.
    Poll { origin: String, id: String },
    /// Solution visibility of `page`.
    Solutions { page: String },
}

/// Per-request facts used to authorize a descriptor.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Path of the page that issued the request, from `Referer`.
    pub referer_path: Option<String>,
}

/// Stable identity of an observable: hex blake3 of the canonical descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Descriptor {
    /// Parse, normalize and authorize a raw `req` object.
    pub fn from_request(req: &Value, ctx: &RequestContext) -> Result<Self, EventError> {
        let desc: Self = serde_json::from_value(req.clone())
            .map_err(|e| EventError::InvalidRequest(e.to_string()))?;
        let desc = desc.normalize();
        desc.validate(ctx)?;
        Ok(desc)
    }

    /// Canonical form: page paths with duplicate slashes collapsed and a
    /// trailing `index.html` dropped.
    pub fn normalize(self) -> Self {
        match self {
            Self::Build => Self::Build,
            Self::Poll { origin, id } => Self::Poll {
                origin: normalize_page(&origin),
                id,
            },
            Self::Solutions { page } => Self::Solutions {
                page: normalize_page(&page),
            },
        }
    }

    pub fn validate(&self, ctx: &RequestContext) -> Result<(), EventError> {
        match self {
            Self::Build => Ok(()),
            Self::Poll { origin, id } => {
                validate_page(origin)?;
                if id.is_empty()
                    || !id
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(EventError::InvalidRequest(format!("invalid poll id `{id}`")));
                }
                if let Some(referer) = &ctx.referer_path
                    && normalize_page(referer) != *origin
                {
                    return Err(EventError::Forbidden(format!(
                        "poll origin `{origin}` does not match referring page"
                    )));
                }
                Ok(())
            }
            Self::Solutions { page } => validate_page(page),
        }
    }

    pub fn key(&self) -> Key {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let canonical = canonicalize(value).to_string();
        Key(hex::encode(blake3::hash(canonical.as_bytes()).as_bytes()))
    }
}

/// Recursively sort object keys.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub fn normalize_page(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    // Only a whole `index.html` segment names the directory page
    if let Some(stripped) = out.strip_suffix("/index.html") {
        out.truncate(stripped.len() + 1);
    }
    out
}

fn validate_page(page: &str) -> Result<(), EventError> {
    if !page.starts_with('/') || page.split('/').any(|seg| seg == "..") {
        return Err(EventError::InvalidRequest(format!("invalid page path `{page}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(req: Value) -> Result<Descriptor, EventError> {
        Descriptor::from_request(&req, &RequestContext::default())
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(parse(json!({"name": "build"})).unwrap(), Descriptor::Build);
        assert_eq!(
            parse(json!({"name": "solutions", "page": "/a/"})).unwrap(),
            Descriptor::Solutions { page: "/a/".into() }
        );
        assert!(parse(json!({"name": "unknown"})).is_err());
        assert!(parse(json!({"page": "/a/"})).is_err());
    }

    #[test]
    fn test_key_ignores_field_order() {
        let a = parse(json!({"name": "poll", "origin": "/a/", "id": "p1"})).unwrap();
        let b = parse(json!({"id": "p1", "origin": "/a/", "name": "poll"})).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str().len(), 64);

        let c = parse(json!({"name": "poll", "origin": "/a/", "id": "p2"})).unwrap();
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_key_uses_normalized_page() {
        let a = parse(json!({"name": "solutions", "page": "/a//index.html"})).unwrap();
        let b = parse(json!({"name": "solutions", "page": "/a/"})).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_index_suffix_stripped_only_as_segment() {
        assert_eq!(normalize_page("/guide/index.html"), "/guide/");
        assert_eq!(normalize_page("/index.html"), "/");
        assert_eq!(normalize_page("/guide/myindex.html"), "/guide/myindex.html");

        let a = parse(json!({"name": "solutions", "page": "/guide/myindex.html"})).unwrap();
        let b = parse(json!({"name": "solutions", "page": "/guide/my"})).unwrap();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_canonicalize_nested() {
        let value = canonicalize(json!({"b": {"y": 1, "x": [{"d": 1, "c": 2}]}, "a": 0}));
        assert_eq!(value.to_string(), r#"{"a":0,"b":{"x":[{"c":2,"d":1}],"y":1}}"#);
    }

    #[test]
    fn test_rejects_bad_paths_and_ids() {
        assert!(parse(json!({"name": "solutions", "page": "a/"})).is_err());
        assert!(parse(json!({"name": "solutions", "page": "/a/../b/"})).is_err());
        assert!(parse(json!({"name": "poll", "origin": "/a/", "id": "p 1"})).is_err());
        assert!(parse(json!({"name": "poll", "origin": "/a/", "id": ""})).is_err());
    }

    #[test]
    fn test_poll_same_origin() {
        let req = json!({"name": "poll", "origin": "/a/", "id": "p1"});
        let same = RequestContext {
            referer_path: Some("/a/index.html".into()),
        };
        let other = RequestContext {
            referer_path: Some("/b/".into()),
        };
        assert!(Descriptor::from_request(&req, &same).is_ok());
        assert!(matches!(
            Descriptor::from_request(&req, &other),
            Err(EventError::Forbidden(_))
        ));
    }
}
