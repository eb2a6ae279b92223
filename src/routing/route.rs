//! Route entries: verb, path template and handler.
//!
//! # Design Decisions
//! - Handlers are type-erased async closures so modules can mix them freely
//! - The handler body runs inside the returned future, so a panic in user
//!   code surfaces where the dispatcher can catch it

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::Method;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{BoxError, ServerError};
use crate::http::context::{Context, Outcome};
use crate::routing::matcher::{PathTemplate, RouteParams};

/// Future returned by a route handler.
pub type HandlerFuture = BoxFuture<'static, Result<Outcome, BoxError>>;

/// A type-erased route handler.
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, BoxError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: Context| {
        let f = Arc::clone(&f);
        let fut: HandlerFuture = Box::pin(async move { f(ctx).await });
        fut
    })
}

/// HTTP verb filter for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Any,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl Verb {
    /// Map a request method to a verb. Methods outside the set map to `None`
    /// and are only reachable through `Verb::Any` routes.
    pub fn from_method(method: &Method) -> Option<Self> {
        let verb = match *method {
            Method::GET => Verb::Get,
            Method::POST => Verb::Post,
            Method::PUT => Verb::Put,
            Method::DELETE => Verb::Delete,
            Method::HEAD => Verb::Head,
            Method::OPTIONS => Verb::Options,
            _ => return None,
        };
        Some(verb)
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            Verb::Any => true,
            verb => Self::from_method(method) == Some(*verb),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Any => "ANY",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" | "*" => Ok(Verb::Any),
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "DELETE" => Ok(Verb::Delete),
            "HEAD" => Ok(Verb::Head),
            "OPTIONS" => Ok(Verb::Options),
            other => Err(format!("unknown verb '{}'", other)),
        }
    }
}

/// One route of a module: a path template, a verb and a handler.
#[derive(Clone)]
pub struct RouteMap {
    template: PathTemplate,
    verb: Verb,
    handler: Handler,
}

impl RouteMap {
    pub fn new(pattern: &str, verb: Verb, handler: Handler) -> Result<Self, ServerError> {
        Ok(Self {
            template: PathTemplate::parse(pattern)?,
            verb,
            handler,
        })
    }

    /// A route matching every path.
    pub fn catch_all(verb: Verb, handler: Handler) -> Self {
        Self {
            template: PathTemplate::catch_all(),
            verb,
            handler,
        }
    }

    /// Normalized path pattern.
    pub fn path(&self) -> &str {
        self.template.as_str()
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Check verb and path; returns the bound parameters on a match.
    pub fn matches(
        &self,
        method: &Method,
        segments: &[&str],
        case_sensitive: bool,
    ) -> Option<RouteParams> {
        if !self.verb.matches(method) {
            return None;
        }
        self.template.match_segments(segments, case_sensitive)
    }
}

impl fmt::Debug for RouteMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMap")
            .field("path", &self.template.as_str())
            .field("verb", &self.verb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        handler(|ctx: Context| async move { Ok(ctx.not_handled()) })
    }

    #[test]
    fn any_matches_every_method() {
        for method in [Method::GET, Method::POST, Method::TRACE, Method::CONNECT] {
            assert!(Verb::Any.matches(&method));
        }
    }

    #[test]
    fn specific_verb_matches_only_itself() {
        assert!(Verb::Get.matches(&Method::GET));
        assert!(!Verb::Get.matches(&Method::HEAD));
        assert!(!Verb::Post.matches(&Method::TRACE));
        assert!(!Verb::Put.matches(&Method::PATCH));
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!("get".parse::<Verb>().unwrap(), Verb::Get);
        assert_eq!("*".parse::<Verb>().unwrap(), Verb::Any);
        assert!("brew".parse::<Verb>().is_err());
        assert!("patch".parse::<Verb>().is_err());
    }

    #[test]
    fn route_checks_verb_before_path() {
        let route = RouteMap::new("/people/{id}", Verb::Delete, noop()).unwrap();
        assert!(route.matches(&Method::GET, &["people", "1"], true).is_none());
        let params = route.matches(&Method::DELETE, &["people", "1"], true).unwrap();
        assert_eq!(params.get("id"), Some("1"));
        assert_eq!(route.path(), "/people/{id}");
    }

    #[test]
    fn invalid_pattern_fails_route_creation() {
        assert!(RouteMap::new("/a/*/b", Verb::Any, noop()).is_err());
    }
}
