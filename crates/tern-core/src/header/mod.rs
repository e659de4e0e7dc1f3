//! Header storage shared by the request parser and the response writer
//!
//! Names are stored in canonical Title-Case; lookups are case-insensitive.
//! Cookies travel on their own channel: `Set-Cookie` can never be assigned
//! through [`HeaderStore::set`].

pub mod cookie;
pub mod request;

pub use cookie::{Cookie, SameSite};
pub use request::{MediaType, RequestHeaders};

use crate::{Error, Result};
use smallvec::SmallVec;

pub const SET_COOKIE: &str = "Set-Cookie";

/// Canonical-case header map plus a cookie jar
///
/// One value per name: a second `set` replaces the first.
#[derive(Debug, Clone, Default)]
pub struct HeaderStore {
    headers: SmallVec<[(String, String); 16]>,
    cookies: SmallVec<[Cookie; 4]>,
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a header value (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a header, replacing any previous value
    ///
    /// Fails for `Set-Cookie` (use [`HeaderStore::set_cookie`]) and for names
    /// or values that could not be written on the wire.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let name = canonical_name(name);
        if name == SET_COOKIE {
            return Err(Error::InvalidHeader(
                "Set-Cookie must be set through set_cookie".to_string(),
            ));
        }
        if !is_valid_name(&name) {
            return Err(Error::InvalidHeader(format!("invalid header name: {:?}", name)));
        }
        let value = value.into();
        if !is_valid_value(&value) {
            return Err(Error::InvalidHeader(format!("invalid value for {}", name)));
        }
        self.insert_canonical(name, value);
        Ok(())
    }

    pub(crate) fn insert_canonical(&mut self, name: String, value: String) {
        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Append folded continuation text to an existing header
    pub(crate) fn append_folded(&mut self, name: &str, extra: &str) {
        if let Some((_, v)) = self.headers.iter_mut().find(|(k, _)| k == name) {
            if !v.is_empty() {
                v.push(' ');
            }
            v.push_str(extra);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookie(name).is_some()
    }

    /// Add a cookie to be sent as `Set-Cookie`; same name replaces
    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<()> {
        cookie.validate()?;
        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(slot) => *slot = cookie,
            None => self.cookies.push(cookie),
        }
        Ok(())
    }

    pub fn set_cookie_value(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.set_cookie(Cookie::new(name, value))
    }

    pub fn remove_cookie(&mut self, name: &str) {
        self.cookies.retain(|c| c.name != name);
    }

    /// All headers (name, value)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All cookies queued for `Set-Cookie`
    pub fn cookies(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty()
    }
}

/// Title-Case a header name: `content-type` -> `Content-Type`
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// RFC 9110 token characters
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

/// Field-value characters: visible ASCII, obs-text, SP and HTAB
pub fn is_valid_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || b == b' ' || (0x21..=0x7e).contains(&b) || b >= 0x80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(canonical_name("sec-websocket-key"), "Sec-Websocket-Key");
        assert_eq!(canonical_name("host"), "Host");
    }

    #[test]
    fn test_set_get_case_insensitive() {
        let mut h = HeaderStore::new();
        h.set("content-type", "text/plain").unwrap();
        assert_eq!(h.get("Content-Type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.iter().next(), Some(("Content-Type", "text/plain")));
    }

    #[test]
    fn test_last_write_wins() {
        let mut h = HeaderStore::new();
        h.set("X-Id", "1").unwrap();
        h.set("x-id", "2").unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("X-Id"), Some("2"));
    }

    #[test]
    fn test_set_cookie_header_refused() {
        let mut h = HeaderStore::new();
        assert!(matches!(h.set("set-cookie", "a=b"), Err(Error::InvalidHeader(_))));
        assert!(h.is_empty());
    }

    #[test]
    fn test_injection_refused() {
        let mut h = HeaderStore::new();
        assert!(h.set("X-Evil", "a\r\nSet-Cookie: x=y").is_err());
        assert!(h.set("Bad Name", "v").is_err());
    }

    #[test]
    fn test_cookie_injection_refused() {
        let mut h = HeaderStore::new();
        let err = h.set_cookie(Cookie::new("sid", "v\r\nX-Injected: 1"));
        assert!(matches!(err, Err(Error::InvalidHeader(_))));
        assert!(h.set_cookie(Cookie::new("sid", "v").path("/\r\nX-Injected: 1")).is_err());
        assert!(h.set_cookie_value("a=b", "v").is_err());
        assert_eq!(h.cookies().count(), 0);

        let mut buf = bytes::BytesMut::new();
        crate::writer::encode_head(&mut buf, true, crate::StatusCode::OK, &h);
        assert_eq!(&buf[..], b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn test_empty_cookie_name_refused() {
        let mut h = HeaderStore::new();
        assert!(h.set_cookie(Cookie::new("", "v")).is_err());
        h.set_cookie_value("session", "1").unwrap();
        h.set_cookie_value("session", "2").unwrap();
        assert_eq!(h.cookies().count(), 1);
        assert_eq!(h.cookie("session").map(|c| c.value.as_str()), Some("2"));
        h.remove_cookie("session");
        assert!(!h.has_cookie("session"));
    }

    #[test]
    fn test_remove() {
        let mut h = HeaderStore::new();
        h.set("Server", "tern").unwrap();
        h.remove("server");
        assert!(!h.has("Server"));
    }

    #[test]
    fn test_validity() {
        assert!(is_valid_name("X-Custom_1"));
        assert!(!is_valid_name("X Custom"));
        assert!(!is_valid_name("X:Custom"));
        assert!(!is_valid_name(""));
        assert!(is_valid_value("text/html; charset=utf-8"));
        assert!(is_valid_value("tab\there"));
        assert!(!is_valid_value("bad\u{0}value"));
        assert!(!is_valid_value("line\nbreak"));
    }
}
