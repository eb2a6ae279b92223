//! Path template matching.
//!
//! # Responsibilities
//! - Parse and normalize route patterns at registration time
//! - Match normalized request paths segment by segment
//! - Bind named and regex parameters and the wildcard remainder
//!
//! # Syntax
//! - `/people` literal segments
//! - `/people/{id}` one-segment parameter
//! - `/people/{id:[0-9]+}` one-segment parameter constrained by a regex
//! - `/static/*` or `/static/{*rest}` trailing wildcard (any remainder, also empty)
//!
//! # Design Decisions
//! - Patterns are normalized (leading slash, no trailing slash, no empty
//!   segments) so matching is purely structural
//! - Regexes are compiled once, in both case modes, so the per-server case
//!   setting needs no recompilation
//! - Regex segments never span a `/`

use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::error::ServerError;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
    Regex {
        name: String,
        sensitive: Regex,
        insensitive: Regex,
    },
}

/// A normalized, pre-compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    normalized: String,
    segments: Vec<Segment>,
    /// `Some(name)` for a trailing wildcard; the name is `*` when anonymous.
    wildcard: Option<String>,
}

/// Values bound by a successful match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    params: Vec<(String, String)>,
    wildcard: Option<String>,
}

impl RouteParams {
    /// Value of a named parameter (`{name}` or `{*name}`).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Remainder matched by a trailing wildcard, without leading slash.
    pub fn wildcard(&self) -> Option<&str> {
        self.wildcard.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.wildcard.is_none()
    }
}

/// Split a request path into its non-empty segments.
///
/// `//a//b/` and `/a/b` produce the same segments, matching how patterns are
/// normalized.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn invalid(pattern: &str, reason: impl Into<String>) -> ServerError {
    ServerError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PathTemplate {
    /// Parse and normalize a pattern.
    pub fn parse(pattern: &str) -> Result<Self, ServerError> {
        let trimmed = pattern.trim();
        let parts = path_segments(trimmed);

        let mut segments = Vec::with_capacity(parts.len());
        let mut wildcard = None;
        let mut names: Vec<&str> = Vec::new();

        for (index, part) in parts.iter().enumerate() {
            let is_last = index + 1 == parts.len();

            let wildcard_name = if *part == "*" {
                Some("*")
            } else if part.starts_with("{*") && part.ends_with('}') {
                let name = &part[2..part.len() - 1];
                if !is_valid_name(name) {
                    return Err(invalid(pattern, format!("bad wildcard name '{}'", name)));
                }
                Some(name)
            } else {
                None
            };

            if let Some(name) = wildcard_name {
                if !is_last {
                    return Err(invalid(pattern, "wildcard must be the last segment"));
                }
                wildcard = Some(name.to_string());
                continue;
            }

            if part.starts_with('{') && part.ends_with('}') {
                let inner = &part[1..part.len() - 1];
                let (name, expr) = match inner.split_once(':') {
                    Some((name, expr)) => (name, Some(expr)),
                    None => (inner, None),
                };
                if !is_valid_name(name) {
                    return Err(invalid(pattern, format!("bad parameter name '{}'", name)));
                }
                if names.contains(&name) {
                    return Err(invalid(pattern, format!("duplicate parameter '{}'", name)));
                }
                names.push(name);

                let segment = match expr {
                    None => Segment::Param(name.to_string()),
                    Some(expr) => {
                        let anchored = format!("^(?:{})$", expr);
                        let compile = |insensitive| {
                            RegexBuilder::new(&anchored)
                                .case_insensitive(insensitive)
                                .build()
                                .map_err(|e| invalid(pattern, e.to_string()))
                        };
                        Segment::Regex {
                            name: name.to_string(),
                            sensitive: compile(false)?,
                            insensitive: compile(true)?,
                        }
                    }
                };
                segments.push(segment);
                continue;
            }

            if part.contains(['{', '}', '*']) {
                return Err(invalid(pattern, format!("malformed segment '{}'", part)));
            }
            segments.push(Segment::Literal(part.to_string()));
        }

        let normalized = if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        };

        Ok(Self {
            normalized,
            segments,
            wildcard,
        })
    }

    /// The `/*` template, matching every path.
    pub fn catch_all() -> Self {
        Self {
            normalized: "/*".to_string(),
            segments: Vec::new(),
            wildcard: Some("*".to_string()),
        }
    }

    /// The normalized pattern text.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    /// Match a request path.
    pub fn matches(&self, path: &str, case_sensitive: bool) -> Option<RouteParams> {
        self.match_segments(&path_segments(path), case_sensitive)
    }

    /// Match pre-split request path segments.
    pub fn match_segments(&self, parts: &[&str], case_sensitive: bool) -> Option<RouteParams> {
        let fixed = self.segments.len();
        match self.wildcard {
            Some(_) if parts.len() < fixed => return None,
            None if parts.len() != fixed => return None,
            _ => {}
        }

        let mut params = RouteParams::default();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    let equal = if case_sensitive {
                        literal == part
                    } else {
                        literal.eq_ignore_ascii_case(part)
                    };
                    if !equal {
                        return None;
                    }
                }
                Segment::Param(name) => params.params.push((name.clone(), part.to_string())),
                Segment::Regex {
                    name,
                    sensitive,
                    insensitive,
                } => {
                    let regex = if case_sensitive { sensitive } else { insensitive };
                    if !regex.is_match(part) {
                        return None;
                    }
                    params.params.push((name.clone(), part.to_string()));
                }
            }
        }

        if let Some(name) = &self.wildcard {
            let rest = parts[fixed..].join("/");
            if name != "*" {
                params.params.push((name.clone(), rest.clone()));
            }
            params.wildcard = Some(rest);
        }

        Some(params)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl TryFrom<&str> for PathTemplate {
    type Error = ServerError;

    fn try_from(pattern: &str) -> Result<Self, Self::Error> {
        Self::parse(pattern)
    }
}
