//! End-to-end dispatch through a running server.

use std::sync::Arc;

use axum::http::header::HeaderName;
use axum::http::{HeaderValue, StatusCode};
use switchyard::{BoxError, Context, Outcome, Server, Verb, WebModule};

mod common;

fn answering(name: &str, path: &str, body: &'static str) -> WebModule {
    WebModule::new(name)
        .with_handler(path, Verb::Get, move |ctx: Context| async move { Ok(ctx.text(body)) })
        .unwrap()
}

#[tokio::test]
async fn first_registered_module_wins() {
    let server = Server::new(common::test_config());
    server.register_module(Arc::new(answering("first", "/shared", "first"))).unwrap();
    server.register_module(Arc::new(answering("second", "/shared", "second"))).unwrap();
    let running = common::start(server).await;
    let client = common::client();

    let body = client.get(running.url("/shared")).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "first");

    running.server.unregister_module("first").unwrap();
    let body = client.get(running.url("/shared")).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "second");

    running.stop().await;
}

#[tokio::test]
async fn earlier_catch_all_shadows_later_specific_route() {
    let server = Server::new(common::test_config());
    server.register_module(Arc::new(answering("everything", "*", "catch-all"))).unwrap();
    server.register_module(Arc::new(answering("people", "/people", "people"))).unwrap();
    let running = common::start(server).await;

    let body = common::client()
        .get(running.url("/people"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "catch-all");

    running.stop().await;
}

#[tokio::test]
async fn unmatched_request_gets_404() {
    let server = Server::new(common::test_config());
    server.register_module(Arc::new(answering("web", "/here", "here"))).unwrap();
    let running = common::start(server).await;
    let client = common::client();

    let response = client.get(running.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "Not Found");

    let response = client.post(running.url("/here")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    running.stop().await;
}

#[tokio::test]
async fn declining_module_passes_headers_on() {
    let marker = HeaderName::from_static("x-seen-by");
    let tagger = WebModule::new("tagger")
        .with_handler("/*", Verb::Any, move |mut ctx: Context| {
            let marker = marker.clone();
            async move {
                ctx.append_response_header(marker, HeaderValue::from_static("tagger"));
                Ok(ctx.not_handled())
            }
        })
        .unwrap();

    let server = Server::new(common::test_config());
    server.register_module(Arc::new(tagger)).unwrap();
    server.register_module(Arc::new(answering("web", "/page", "page"))).unwrap();
    let running = common::start(server).await;
    let client = common::client();

    let response = client.get(running.url("/page")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-seen-by"], "tagger");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "page");

    let response = client.get(running.url("/missing")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-seen-by"], "tagger");

    running.stop().await;
}

async fn fail(_ctx: Context) -> Result<Outcome, BoxError> {
    Err("boom".into())
}

async fn explode(ctx: Context) -> Result<Outcome, BoxError> {
    if ctx.path() == "/panic" {
        panic!("handler exploded");
    }
    Ok(ctx.not_handled())
}

#[tokio::test]
async fn failing_handlers_become_500_and_the_server_keeps_serving() {
    let module = WebModule::new("faulty")
        .with_handler("/error", Verb::Get, fail)
        .unwrap()
        .with_handler("/panic", Verb::Get, explode)
        .unwrap()
        .with_handler("/ok", Verb::Get, |ctx: Context| async move { Ok(ctx.text("ok")) })
        .unwrap();

    let server = Server::new(common::test_config());
    server.register_module(Arc::new(module)).unwrap();
    let running = common::start(server).await;
    let client = common::client();

    for path in ["/error", "/panic"] {
        let response = client.get(running.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "{}", path);
        assert_eq!(response.text().await.unwrap(), "Internal Server Error");
    }

    let response = client.get(running.url("/ok")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    running.stop().await;
}

#[tokio::test]
async fn route_parameters_reach_the_handler() {
    let module = WebModule::new("people")
        .with_handler("/people/{id:[0-9]+}", Verb::Get, |ctx: Context| async move {
            let id = ctx.param("id").unwrap_or_default().to_string();
            Ok(ctx.text(id))
        })
        .unwrap()
        .with_handler("/files/*", Verb::Get, |ctx: Context| async move {
            let rest = ctx.params().wildcard().unwrap_or_default().to_string();
            Ok(ctx.text(rest))
        })
        .unwrap();

    let server = Server::new(common::test_config());
    server.register_module(Arc::new(module)).unwrap();
    let running = common::start(server).await;
    let client = common::client();

    let response = client.get(running.url("/people/42")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "42");

    let response = client.get(running.url("/people/abc")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.get(running.url("/files/a/b.txt")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "a/b.txt");

    running.stop().await;
}

#[tokio::test]
async fn modules_registered_while_running_are_served() {
    let server = Server::new(common::test_config());
    let running = common::start(server).await;
    let client = common::client();

    let response = client.get(running.url("/late")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    running.server.register_module(Arc::new(answering("late", "/late", "late"))).unwrap();
    let response = client.get(running.url("/late")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "late");

    running.stop().await;
}
