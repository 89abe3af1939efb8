//! Routes return a Result, so the error side needs to implement IntoResponse,
//! AND it needs a From<T> for every intermediate error type a route might
//! `?` on. Every error type we care about implements [IntoHandlerError],
//! which says what status code it deserves, and that feeds one blanket From.
//!
//! The error page can't come from a template, because template fetch+render
//! is fallible and this is the last line of defense. So it's a duplicated
//! partial page skeleton and a `format!()` call.

use crate::db::DbError;
use crate::util::IntoHandlerError;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use std::error::Error;
use tracing::error;

/// An IntoResponse type that any handler error can be converted to, for
/// displaying HTML error pages from a route.
#[derive(Debug)]
pub struct WebError {
    /// Already-escaped html fragment.
    pub message: String,
    pub status: StatusCode,
}

/// A convenience type for returning probably an Ok(IntoResponse), or maybe
/// an error page, from a route.
pub type WebResult<T> = Result<T, WebError>;

impl WebError {
    /// Takes a plain-text message and escapes it.
    pub fn new(status: StatusCode, message: &str) -> Self {
        let mut escaped = String::from("<p>");
        html_escape::encode_safe_to_string(message, &mut escaped);
        escaped.push_str("</p>");
        Self {
            message: escaped,
            status,
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Nothing here.")
    }
}

/// Build an html-fragment description of an error, including all of its
/// nested source errors.
pub fn error_chain_html(value: &dyn Error) -> String {
    let mut message = String::new();
    let mut err: &dyn Error = value;
    loop {
        message.push_str("<p>");
        html_escape::encode_safe_to_string(err.to_string(), &mut message);
        message.push_str("</p>");
        if let Some(next) = err.source() {
            err = next;
        } else {
            break;
        }
    }
    message
}

impl<E: IntoHandlerError> From<E> for WebError {
    fn from(value: E) -> Self {
        let (status, message) = value.status_and_message();
        if status.is_server_error() {
            error!(%status, "{}", message);
        }
        Self { message, status }
    }
}

// Storage and template failures are always on us, so: 500, with the whole chain.
impl IntoHandlerError for DbError {
    fn status_and_message(self) -> (StatusCode, String) {
        (StatusCode::INTERNAL_SERVER_ERROR, error_chain_html(&self))
    }
}

impl IntoHandlerError for minijinja::Error {
    fn status_and_message(self) -> (StatusCode, String) {
        (StatusCode::INTERNAL_SERVER_ERROR, error_chain_html(&self))
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let page = format!(include_str!("../../templates/_error.html"), &self.message);
        (self.status, Html(page)).into_response()
    }
}
