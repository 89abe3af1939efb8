use http::StatusCode;
use thiserror::Error;

/// A conversion helper trait for error types that can get "?"-propagated out
/// of handler fns. Anything implementing it converts into a `WebError`.
pub trait IntoHandlerError {
    /// Consume self and return an http::StatusCode and an owned String message.
    /// The message ends up in an html page as-is, so escape anything that
    /// came from outside.
    fn status_and_message(self) -> (StatusCode, String);
}

/// Errors that are the visitor's fault, or at least that they can do
/// something about (usually: try logging in again).
#[derive(Debug, Error)]
pub enum UserError {
    #[error("{provider} login isn't enabled on this site")]
    ProviderDisabled { provider: &'static str },

    #[error("That login attempt expired or was already used. Go back and try logging in again.")]
    LoginStateInvalid,

    #[error("The login callback was missing its authorization code.")]
    MissingCode,

    #[error("The login provider turned you away: {reason}")]
    LoginDenied { reason: String },
}

impl IntoHandlerError for UserError {
    fn status_and_message(self) -> (StatusCode, String) {
        let status = match &self {
            UserError::ProviderDisabled { .. } => StatusCode::NOT_FOUND,
            UserError::LoginStateInvalid => StatusCode::BAD_REQUEST,
            UserError::MissingCode => StatusCode::BAD_REQUEST,
            UserError::LoginDenied { .. } => StatusCode::BAD_REQUEST,
        };
        let message = format!("<p>{}</p>", html_escape::encode_safe(&self.to_string()));
        (status, message)
    }
}
