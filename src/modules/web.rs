//! General-purpose module built from ad-hoc handlers.

use std::future::Future;

use crate::error::{BoxError, ServerError};
use crate::http::context::{Context, Outcome};
use crate::modules::Module;
use crate::routing::{handler, RouteMap, Verb};

/// A module whose routes are added one handler at a time.
///
/// Routes are matched in the order they were added.
#[derive(Debug)]
pub struct WebModule {
    name: String,
    routes: Vec<RouteMap>,
}

impl WebModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    /// Add a handler for `path` and `verb`.
    pub fn add_handler<F, Fut>(
        &mut self,
        path: &str,
        verb: Verb,
        f: F,
    ) -> Result<&mut Self, ServerError>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, BoxError>> + Send + 'static,
    {
        self.routes.push(RouteMap::new(path, verb, handler(f))?);
        Ok(self)
    }

    /// Builder form of [`WebModule::add_handler`].
    pub fn with_handler<F, Fut>(mut self, path: &str, verb: Verb, f: F) -> Result<Self, ServerError>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, BoxError>> + Send + 'static,
    {
        self.add_handler(path, verb, f)?;
        Ok(self)
    }

    /// Add a pre-built route.
    pub fn add_route(&mut self, route: RouteMap) -> &mut Self {
        self.routes.push(route);
        self
    }

    pub fn handlers(&self) -> &[RouteMap] {
        &self.routes
    }
}

impl Module for WebModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> &[RouteMap] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_keep_insertion_order() {
        let module = WebModule::new("web")
            .with_handler("/", Verb::Any, |ctx: Context| async move { Ok(ctx.not_handled()) })
            .unwrap()
            .with_handler("/people", Verb::Get, |ctx: Context| async move { Ok(ctx.text("[]")) })
            .unwrap();

        let paths: Vec<_> = module.handlers().iter().map(|r| (r.path(), r.verb())).collect();
        assert_eq!(paths, vec![("/", Verb::Any), ("/people", Verb::Get)]);
        assert_eq!(module.name(), "web");
    }

    #[test]
    fn bad_pattern_is_reported() {
        let mut module = WebModule::new("web");
        let result = module.add_handler("/{id", Verb::Get, |ctx: Context| async move {
            Ok(ctx.not_handled())
        });
        assert!(result.is_err());
        assert!(module.handlers().is_empty());
    }
}
