//! Static file serving.
//!
//! # Responsibilities
//! - Map the request path below a root directory
//! - Serve a default document for directories
//! - Pick the content type through a pluggable extension table
//!
//! # Design Decisions
//! - Only GET and HEAD are answered; anything missing is declined so later
//!   modules (or the 404 fallback) take over
//! - Paths containing `..` or platform separators never reach the file
//!   system

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, Response};

use crate::error::BoxError;
use crate::http::context::{Context, Outcome};
use crate::modules::Module;
use crate::routing::{handler, RouteMap, Verb};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Maps a lowercase file extension (without dot) to a content type.
pub trait MimeLookup: Send + Sync + 'static {
    fn content_type(&self, extension: &str) -> Option<&str>;
}

/// A small built-in extension table.
#[derive(Debug, Clone)]
pub struct DefaultMimeTypes {
    table: HashMap<String, String>,
}

impl DefaultMimeTypes {
    pub fn new() -> Self {
        let table = [
            ("html", "text/html; charset=utf-8"),
            ("htm", "text/html; charset=utf-8"),
            ("css", "text/css; charset=utf-8"),
            ("js", "application/javascript; charset=utf-8"),
            ("json", "application/json"),
            ("txt", "text/plain; charset=utf-8"),
            ("svg", "image/svg+xml"),
            ("png", "image/png"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("gif", "image/gif"),
            ("ico", "image/x-icon"),
            ("woff", "font/woff"),
            ("woff2", "font/woff2"),
            ("wasm", "application/wasm"),
        ]
        .into_iter()
        .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
        .collect();
        Self { table }
    }

    /// Add or replace a mapping.
    pub fn insert(&mut self, extension: &str, content_type: &str) {
        self.table
            .insert(extension.to_ascii_lowercase(), content_type.to_string());
    }
}

impl Default for DefaultMimeTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl MimeLookup for DefaultMimeTypes {
    fn content_type(&self, extension: &str) -> Option<&str> {
        self.table.get(extension).map(String::as_str)
    }
}

struct StaticShared {
    root: PathBuf,
    default_document: String,
    mime: Arc<dyn MimeLookup>,
}

impl StaticShared {
    /// Join `relative` onto the root, refusing anything that could escape it.
    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." || segment.contains('\\') || segment.contains(':') {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }

    fn content_type(&self, path: &Path) -> String {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.mime.content_type(&ext.to_ascii_lowercase()).map(str::to_owned))
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
    }

    async fn serve(&self, ctx: Context) -> Result<Outcome, BoxError> {
        let relative = ctx.params().wildcard().unwrap_or_default();
        let Some(mut path) = self.resolve(relative) else {
            tracing::warn!(request_id = %ctx.request_id(), path = %ctx.path(), "Rejected path outside the static root");
            return Ok(ctx.not_handled());
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => path.push(&self.default_document),
            Ok(_) => {}
            Err(_) => return Ok(ctx.not_handled()),
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ctx.not_handled()),
            Err(e) => return Err(e.into()),
        };

        let length = contents.len();
        let body = if ctx.method() == Method::HEAD {
            Body::empty()
        } else {
            Body::from(contents)
        };
        let response = Response::builder()
            .header(CONTENT_TYPE, self.content_type(&path))
            .header(CONTENT_LENGTH, length)
            .body(body)?;

        Ok(ctx.respond(response))
    }
}

/// Serves files below a root directory.
pub struct StaticFilesModule {
    name: String,
    shared: Arc<StaticShared>,
    routes: Vec<RouteMap>,
}

impl StaticFilesModule {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::build(
            "static".to_string(),
            StaticShared {
                root: root.into(),
                default_document: "index.html".to_string(),
                mime: Arc::new(DefaultMimeTypes::new()),
            },
        )
    }

    fn build(name: String, shared: StaticShared) -> Self {
        let shared = Arc::new(shared);
        let serve = {
            let shared = Arc::clone(&shared);
            handler(move |ctx: Context| {
                let shared = Arc::clone(&shared);
                async move { shared.serve(ctx).await }
            })
        };
        Self {
            name,
            shared,
            routes: vec![
                RouteMap::catch_all(Verb::Get, serve.clone()),
                RouteMap::catch_all(Verb::Head, serve),
            ],
        }
    }

    fn rebuild(self, change: impl FnOnce(&mut StaticShared)) -> Self {
        let mut shared = StaticShared {
            root: self.shared.root.clone(),
            default_document: self.shared.default_document.clone(),
            mime: Arc::clone(&self.shared.mime),
        };
        change(&mut shared);
        Self::build(self.name, shared)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_document(self, document: impl Into<String>) -> Self {
        let document = document.into();
        self.rebuild(|shared| shared.default_document = document)
    }

    pub fn with_mime_lookup(self, mime: impl MimeLookup) -> Self {
        self.rebuild(|shared| shared.mime = Arc::new(mime))
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }
}

impl Module for StaticFilesModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> &[RouteMap] {
        &self.routes
    }
}
