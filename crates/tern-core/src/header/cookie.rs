//! Response cookies and their `Set-Cookie` encoding

use super::{is_valid_name, is_valid_value};
use crate::{Error, Result};
use std::time::SystemTime;

/// Cookie SameSite attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// HTTP Cookie
///
/// `max_age` wins over `expires`: the encoding never carries both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Seconds; only emitted when greater than zero
    pub max_age: Option<u64>,
    pub expires: Option<SystemTime>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            max_age: None,
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Cookie that tells the client to drop `name` (expires at the epoch)
    pub fn delete(name: impl Into<String>) -> Self {
        Self::new(name, "").expires(SystemTime::UNIX_EPOCH)
    }

    /// Check that every part can go on the wire inside one `Set-Cookie` line
    ///
    /// The name must be a token; value, domain and path may not carry
    /// control characters or `;`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidHeader("cookie name cannot be empty".to_string()));
        }
        if !is_valid_name(&self.name) {
            return Err(Error::InvalidHeader(format!("invalid cookie name: {:?}", self.name)));
        }
        let parts = [
            ("value", Some(self.value.as_str())),
            ("domain", self.domain.as_deref()),
            ("path", self.path.as_deref()),
        ];
        for (what, part) in parts {
            if let Some(part) = part {
                if !is_valid_attribute(part) {
                    return Err(Error::InvalidHeader(format!(
                        "invalid cookie {} for {}",
                        what, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to a `Set-Cookie` header value
    ///
    /// Attribute order is fixed: `Max-Age` or `Expires`, `Domain`, `Path`,
    /// `HttpOnly`, `Secure`, `SameSite`.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);

        match (self.max_age, self.expires) {
            (Some(age), _) if age > 0 => {
                out.push_str("; Max-Age=");
                out.push_str(&age.to_string());
            }
            (_, Some(at)) => {
                out.push_str("; Expires=");
                out.push_str(&httpdate::fmt_http_date(at));
            }
            _ => {}
        }
        if let Some(ref domain) = self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(ref path) = self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        out
    }
}

fn is_valid_attribute(part: &str) -> bool {
    is_valid_value(part) && !part.contains(';')
}
