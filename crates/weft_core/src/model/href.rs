//! Canonical address handling for resources and sources.
//!
//! # Responsibility
//! - Compose and parse resource/source hrefs.
//! - Resolve relative hrefs against a base href.
//!
//! # Invariants
//! - A resource href is `/{type}/{identifier}`.
//! - A source href is `/{type}/{identifier}/source/{source_type}`.
//! - Resolution never escapes the root (`..` is rejected).

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static RESOURCE_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/(?P<type>[a-z][a-z0-9-]*)/(?P<identifier>[A-Za-z0-9_.:-]+)$")
        .expect("valid resource href regex")
});
static SOURCE_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/(?P<type>[a-z][a-z0-9-]*)/(?P<identifier>[A-Za-z0-9_.:-]+)/source/(?P<source>[a-z][a-z0-9-]*)$",
    )
    .expect("valid source href regex")
});

/// Errors from href parsing and resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HrefError {
    /// Value does not match any supported href shape.
    Malformed(String),
    /// Relative href attempts to traverse above the root.
    EscapesRoot(String),
}

impl Display for HrefError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(value) => write!(f, "malformed href: `{value}`"),
            Self::EscapesRoot(value) => write!(f, "href escapes root: `{value}`"),
        }
    }
}

impl Error for HrefError {}

/// Builds the canonical href for a `(type, identifier)` pair.
pub fn resource_href(resource_type: &str, identifier: &str) -> String {
    format!("/{resource_type}/{identifier}")
}

/// Builds the canonical href for a source row.
pub fn source_href(resource_href: &str, source_type: &str) -> String {
    format!("{resource_href}/source/{source_type}")
}

/// Splits a resource href into `(type, identifier)`.
pub fn parse_resource_href(href: &str) -> Result<(String, String), HrefError> {
    let captures = RESOURCE_HREF_RE
        .captures(href)
        .ok_or_else(|| HrefError::Malformed(href.to_string()))?;
    Ok((captures["type"].to_string(), captures["identifier"].to_string()))
}

/// Splits a source href into `(resource_href, source_type)`.
pub fn parse_source_href(href: &str) -> Result<(String, String), HrefError> {
    let captures = SOURCE_HREF_RE
        .captures(href)
        .ok_or_else(|| HrefError::Malformed(href.to_string()))?;
    Ok((
        resource_href(&captures["type"], &captures["identifier"]),
        captures["source"].to_string(),
    ))
}

/// Returns whether the value parses as a resource href.
pub fn is_resource_href(href: &str) -> bool {
    RESOURCE_HREF_RE.is_match(href)
}

/// Resolves `href` against `base`.
///
/// Absolute hrefs (leading `/`) are returned normalized; relative hrefs are
/// joined onto the directory of `base` (everything up to its last `/`).
pub fn resolve(base: &str, href: &str) -> Result<String, HrefError> {
    let raw = if let Some(absolute) = href.strip_prefix('/') {
        format!("/{absolute}")
    } else {
        let dir = match base.rfind('/') {
            Some(idx) => &base[..=idx],
            None => "/",
        };
        format!("{dir}{href}")
    };

    let mut normalized: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if normalized.pop().is_none() {
                    return Err(HrefError::EscapesRoot(href.to_string()));
                }
            }
            other => normalized.push(other),
        }
    }
    if normalized.is_empty() {
        return Err(HrefError::Malformed(href.to_string()));
    }
    Ok(format!("/{}", normalized.join("/")))
}

#[cfg(test)]
mod tests {
    use super::{
        parse_resource_href, parse_source_href, resolve, resource_href, source_href, HrefError,
    };

    #[test]
    fn resource_href_roundtrip() {
        let href = resource_href("snake", "python");
        assert_eq!(href, "/snake/python");
        assert_eq!(
            parse_resource_href(&href).unwrap(),
            ("snake".to_string(), "python".to_string())
        );
    }

    #[test]
    fn source_href_roundtrip() {
        let href = source_href("/snake/python", "science");
        assert_eq!(href, "/snake/python/source/science");
        assert_eq!(
            parse_source_href(&href).unwrap(),
            ("/snake/python".to_string(), "science".to_string())
        );
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert!(matches!(
            parse_resource_href("snake/python"),
            Err(HrefError::Malformed(_))
        ));
        assert!(parse_resource_href("/snake/python/extra").is_err());
        assert!(parse_source_href("/snake/python/source/").is_err());
    }

    #[test]
    fn resolve_keeps_absolute_hrefs() {
        assert_eq!(resolve("/snake/python", "/bird/kiwi").unwrap(), "/bird/kiwi");
    }

    #[test]
    fn resolve_joins_relative_hrefs_against_base_directory() {
        assert_eq!(resolve("/snake/python", "adder").unwrap(), "/snake/adder");
        assert_eq!(resolve("/snake/", "adder").unwrap(), "/snake/adder");
        assert_eq!(
            resolve("/snake/python", "./boa").unwrap(),
            "/snake/boa"
        );
    }

    #[test]
    fn resolve_rejects_root_escape() {
        assert!(matches!(
            resolve("/snake/python", "../../../etc"),
            Err(HrefError::EscapesRoot(_))
        ));
    }
}
