//! Request dispatch across registered modules.
//!
//! # Responsibilities
//! - Walk the registry snapshot in registration order
//! - Within a module, run the first route whose verb and path match
//! - Fall through to the next module when a handler declines
//! - Turn handler errors and panics into a 500 without touching the server
//!
//! # Design Decisions
//! - One snapshot per request: a concurrent (un)registration is either
//!   fully visible or not at all
//! - Only the first matching route of a module runs; ordering inside a
//!   module is the module author's precedence
//! - A module unregistered while the request is in flight is skipped from
//!   then on, even though the snapshot still lists it
//! - Dispatch never fails; every path ends in a response

use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::response::Response;
use futures_util::FutureExt;

use crate::error::{BoxError, ServerError};
use crate::http::context::{Context, Outcome};
use crate::http::response;
use crate::modules::{ModuleRegistry, ModuleState};
use crate::observability::metrics;
use crate::routing::matcher::path_segments;

/// Routes requests to modules.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ModuleRegistry,
    case_sensitive: bool,
}

impl Dispatcher {
    pub fn new(registry: ModuleRegistry, case_sensitive: bool) -> Self {
        Self {
            registry,
            case_sensitive,
        }
    }

    /// Produce the response for one request.
    pub async fn dispatch(&self, ctx: Context) -> Response {
        let snapshot = self.registry.snapshot();
        let method = ctx.method().clone();
        let path = ctx.path().to_string();
        let segments = path_segments(&path);
        let request_id = ctx.request_id().to_string();

        let mut ctx = ctx;
        for entry in snapshot.iter() {
            // Unregistered after this request took its snapshot.
            if entry.state() != ModuleState::Active {
                continue;
            }
            let matched = entry.module().routes().iter().find_map(|route| {
                route
                    .matches(&method, &segments, self.case_sensitive)
                    .map(|params| (route, params))
            });
            let Some((route, params)) = matched else {
                continue;
            };

            tracing::trace!(
                request_id = %request_id,
                module = entry.name(),
                route = route.path(),
                "Route matched"
            );

            ctx.set_params(params);
            let running = (route.handler())(ctx);
            match AssertUnwindSafe(running).catch_unwind().await {
                Ok(Ok(Outcome::Handled(response))) => return response,
                Ok(Ok(Outcome::NotHandled(returned))) => ctx = returned,
                Ok(Err(error)) => return handler_failed(entry.name(), &request_id, error),
                Err(panic) => return handler_panicked(entry.name(), &request_id, panic),
            }
        }

        tracing::debug!(request_id = %request_id, method = %method, path = %path, "No module handled request");
        ctx.finish(response::not_found())
    }
}

fn handler_failed(module: &str, request_id: &str, error: BoxError) -> Response {
    if let Some(err) = error.downcast_ref::<ServerError>() {
        if err.is_timeout() {
            tracing::warn!(request_id = %request_id, module, error = %err, "Request timed out");
            return response::timeout();
        }
    }

    metrics::record_dispatch_fault(module);
    let fault = ServerError::RouteHandlerFault {
        module: module.to_string(),
        message: error.to_string(),
    };
    tracing::error!(request_id = %request_id, error = %fault, "Route handler failed");
    response::fault()
}

fn handler_panicked(module: &str, request_id: &str, panic: Box<dyn Any + Send>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };

    metrics::record_dispatch_fault(module);
    let fault = ServerError::RouteHandlerFault {
        module: module.to_string(),
        message: format!("panicked: {}", message),
    };
    tracing::error!(request_id = %request_id, error = %fault, "Route handler panicked");
    response::fault()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::context::ServerContext;
    use crate::modules::WebModule;
    use crate::routing::Verb;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::sync::Arc;

    async fn call(dispatcher: &Dispatcher, method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let ctx = Context::new(request, ServerContext::detached(ServerConfig::default()));
        let response = dispatcher.dispatch(ctx).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn text_module(name: &str, path: &str, verb: Verb, body: &'static str) -> Arc<WebModule> {
        let mut module = WebModule::new(name);
        module
            .add_handler(path, verb, move |ctx: Context| async move { Ok(ctx.text(body)) })
            .unwrap();
        Arc::new(module)
    }

    #[tokio::test]
    async fn first_matching_module_wins() {
        let registry = ModuleRegistry::new();
        registry.register(text_module("a", "/x", Verb::Any, "from a")).unwrap();
        registry.register(text_module("b", "/x", Verb::Any, "from b")).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/x").await, (StatusCode::OK, "from a".into()));
    }

    #[tokio::test]
    async fn declined_requests_fall_through() {
        let registry = ModuleRegistry::new();
        let mut decline = WebModule::new("decline");
        decline
            .add_handler("/*", Verb::Any, |ctx: Context| async move { Ok(ctx.not_handled()) })
            .unwrap();
        registry.register(Arc::new(decline)).unwrap();
        registry.register(text_module("ok", "/", Verb::Get, "ok")).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/").await, (StatusCode::OK, "ok".into()));
        assert_eq!(
            call(&dispatcher, Method::GET, "/missing").await,
            (StatusCode::NOT_FOUND, "Not Found".into())
        );
    }

    #[tokio::test]
    async fn only_first_matching_route_of_a_module_runs() {
        let mut module = WebModule::new("web");
        module
            .add_handler("/*", Verb::Any, |ctx: Context| async move { Ok(ctx.not_handled()) })
            .unwrap()
            .add_handler("/x", Verb::Any, |ctx: Context| async move { Ok(ctx.text("shadowed")) })
            .unwrap();
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(module)).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/x").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn modules_unregistered_mid_request_are_skipped() {
        let registry = ModuleRegistry::new();
        let mut remover = WebModule::new("remover");
        let handle = registry.clone();
        remover
            .add_handler("/*", Verb::Any, move |ctx: Context| {
                let handle = handle.clone();
                async move {
                    handle.unregister("target").ok();
                    Ok(ctx.not_handled())
                }
            })
            .unwrap();
        registry.register(Arc::new(remover)).unwrap();
        registry.register(text_module("target", "/x", Verb::Get, "stale")).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/x").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn verb_mismatch_is_not_a_match() {
        let registry = ModuleRegistry::new();
        registry.register(text_module("post", "/items", Verb::Post, "created")).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/items").await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&dispatcher, Method::POST, "/items").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn case_insensitive_dispatch() {
        let registry = ModuleRegistry::new();
        registry.register(text_module("web", "/Api/People", Verb::Get, "people")).unwrap();

        let insensitive = Dispatcher::new(registry.clone(), false);
        assert_eq!(call(&insensitive, Method::GET, "/api/people").await.0, StatusCode::OK);

        let sensitive = Dispatcher::new(registry, true);
        assert_eq!(call(&sensitive, Method::GET, "/api/people").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_500() {
        let mut module = WebModule::new("faulty");
        module
            .add_handler("/error", Verb::Any, |_ctx: Context| async move {
                Err::<Outcome, BoxError>("broken".into())
            })
            .unwrap()
            .add_handler("/panic", Verb::Any, |_ctx: Context| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok::<Outcome, BoxError>(_ctx.not_handled())
            })
            .unwrap();
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(module)).unwrap();
        registry.register(text_module("after", "/*", Verb::Any, "unreached")).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        for uri in ["/error", "/panic"] {
            assert_eq!(
                call(&dispatcher, Method::GET, uri).await,
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".into())
            );
        }
    }

    #[tokio::test]
    async fn timeout_errors_become_408() {
        let mut module = WebModule::new("slow");
        module
            .add_handler("/", Verb::Any, |_ctx: Context| async move {
                let err = ServerError::timeout("body read", std::time::Duration::from_millis(1));
                Err::<Outcome, BoxError>(err.into())
            })
            .unwrap();
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(module)).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/").await.0, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn route_parameters_reach_the_handler() {
        let mut module = WebModule::new("people");
        module
            .add_handler("/people/{id:[0-9]+}", Verb::Get, |ctx: Context| async move {
                let id = ctx.param("id").unwrap_or_default().to_string();
                Ok(ctx.text(id))
            })
            .unwrap();
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(module)).unwrap();
        let dispatcher = Dispatcher::new(registry, true);

        assert_eq!(call(&dispatcher, Method::GET, "/people/12").await, (StatusCode::OK, "12".into()));
        assert_eq!(call(&dispatcher, Method::GET, "/people/x").await.0, StatusCode::NOT_FOUND);
    }
}
