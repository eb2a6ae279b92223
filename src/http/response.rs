//! Canned responses produced by the server itself.
//!
//! # Design Decisions
//! - Fault details go to the log, never to the client
//! - A timed-out request also closes its connection

use axum::http::header::CONNECTION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const NOT_FOUND_BODY: &str = "Not Found";
pub const FAULT_BODY: &str = "Internal Server Error";
pub const TIMEOUT_BODY: &str = "Request Timeout";

/// Answer for a request no module handled.
pub fn not_found() -> Response {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
}

/// Answer for a handler that failed or panicked.
pub fn fault() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, FAULT_BODY).into_response()
}

/// Answer for a handler that ran out of time reading or producing data.
pub fn timeout() -> Response {
    let mut response = (StatusCode::REQUEST_TIMEOUT, TIMEOUT_BODY).into_response();
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
