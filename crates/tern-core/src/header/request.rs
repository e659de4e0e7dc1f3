//! Read-only request header view
//!
//! Content-Type and Content-Length are extracted once at construction; the
//! `Cookie` header is parsed lazily on first access.

use super::HeaderStore;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Parsed `Content-Type`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaType {
    /// Lower-cased `type/subtype`, or the raw value when it does not parse
    pub essence: String,
    /// Parameters with lower-cased keys and unquoted values
    pub params: HashMap<String, String>,
}

impl MediaType {
    pub fn parse(raw: &str) -> Self {
        Self::parse_strict(raw).unwrap_or_else(|| MediaType {
            essence: raw.trim().to_string(),
            params: HashMap::new(),
        })
    }

    fn parse_strict(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let essence = parts.next()?.trim();
        let (ty, subtype) = essence.split_once('/')?;
        if !super::is_valid_name(ty) || !super::is_valid_name(subtype) {
            return None;
        }

        let mut params = HashMap::new();
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            if !super::is_valid_name(key) {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            params.insert(key.to_ascii_lowercase(), value.to_string());
        }

        Some(MediaType {
            essence: essence.to_ascii_lowercase(),
            params,
        })
    }
}

/// Request headers as seen by handlers
#[derive(Debug, Default)]
pub struct RequestHeaders {
    store: HeaderStore,
    content_type: Option<MediaType>,
    content_length: Option<u64>,
    cookies: OnceLock<HashMap<String, String>>,
}

impl RequestHeaders {
    pub fn new(store: HeaderStore) -> Self {
        let content_type = store.get("Content-Type").map(MediaType::parse);
        let content_length = store.get("Content-Length").and_then(parse_content_length);
        Self {
            store,
            content_type,
            content_length,
            cookies: OnceLock::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.store.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.store.has(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.store.iter()
    }

    /// Media type without parameters, e.g. `multipart/form-data`
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_ref().map(|m| m.essence.as_str())
    }

    /// Content-Type parameter such as `boundary` or `charset`
    pub fn media_param(&self, name: &str) -> Option<&str> {
        self.content_type
            .as_ref()
            .and_then(|m| m.params.get(&name.to_ascii_lowercase()))
            .map(|s| s.as_str())
    }

    /// Declared body length; `None` when absent or unparsable
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Value of a request cookie
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(|s| s.as_str())
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies
            .get_or_init(|| self.store.get("Cookie").map(parse_cookie_header).unwrap_or_default())
    }

    pub fn store(&self) -> &HeaderStore {
        &self.store
    }
}

/// Parse a Content-Length value; only plain decimal digits are accepted
pub fn parse_content_length(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Parse a `Cookie` request header: `a=1; b=2`
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in header.split("; ") {
        if let Some((name, value)) = pair.split_once('=') {
            let (name, value) = (name.trim(), value.trim());
            if !name.is_empty() && !value.is_empty() {
                out.insert(name.to_string(), value.to_string());
            }
        }
    }
    out
}
