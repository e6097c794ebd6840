//! Error types for the loopauth crate.
//!
//! All operations surface errors through [`AuthError`], which is the single
//! error type for this crate. Each variant carries enough context for callers
//! to decide how to handle the failure; nothing is recovered internally
//! except listener-side handler failures, which become HTTP error responses.

/// Error codes an authorization server may attach to the redirect back to
/// the client (RFC 6749 §4.1.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationErrorCode {
    /// The request is missing a parameter or is otherwise malformed.
    InvalidRequest,
    /// The client is not authorized to use this flow.
    UnauthorizedClient,
    /// The resource owner or the server denied the request.
    AccessDenied,
    /// The server does not support obtaining a code this way.
    UnsupportedResponseType,
    /// The requested scope is invalid or malformed.
    InvalidScope,
    /// Internal server error.
    ServerError,
    /// The server is temporarily overloaded or down.
    TemporarilyUnavailable,
    /// Any code this library does not recognize.
    Unknown,
}

impl AuthorizationErrorCode {
    /// Map the wire identifier to a code, collapsing anything unrecognized
    /// to [`AuthorizationErrorCode::Unknown`].
    pub fn from_wire(code: &str) -> Self {
        match code {
            "invalid_request" => Self::InvalidRequest,
            "unauthorized_client" => Self::UnauthorizedClient,
            "access_denied" => Self::AccessDenied,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "invalid_scope" => Self::InvalidScope,
            "server_error" => Self::ServerError,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            _ => Self::Unknown,
        }
    }

    /// The RFC 6749 identifier for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::Unknown => "unknown",
        }
    }
}

/// Error codes a token endpoint may return in an HTTP 400 body
/// (RFC 6749 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorCode {
    /// The request is missing a parameter or is otherwise malformed.
    InvalidRequest,
    /// Client authentication failed.
    InvalidClient,
    /// The grant (code, refresh token) is invalid, expired, or revoked.
    InvalidGrant,
    /// The client is not authorized to use this grant type.
    UnauthorizedClient,
    /// The grant type is not supported by the server.
    UnsupportedGrantType,
    /// The requested scope is invalid or exceeds the granted scope.
    InvalidScope,
    /// Any code this library does not recognize.
    Unknown,
}

impl TokenErrorCode {
    /// Map the wire identifier to a code, collapsing anything unrecognized
    /// to [`TokenErrorCode::Unknown`].
    pub fn from_wire(code: &str) -> Self {
        match code {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "unauthorized_client" => Self::UnauthorizedClient,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_scope" => Self::InvalidScope,
            _ => Self::Unknown,
        }
    }

    /// The RFC 6749 identifier for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::Unknown => "unknown",
        }
    }
}

/// The kind of failure the embedded JSON parser hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonErrorKind {
    /// Content remained after the top-level value.
    TrailingData,
    /// The input at this position is not any JSON value.
    UnknownValue,
    /// A `,` or `:` separator was expected and missing.
    MissingSeparator,
    /// An array or object was not closed before the input ended.
    MissingClosingBracket,
    /// An object contained the same key twice.
    DuplicateKey,
    /// An unquoted object key contained a non-identifier character.
    InvalidIdentifier,
}

/// Join an AS-reported error code with its optional description and URI.
///
/// RFC 6749 lets the server attach a human-readable description and a
/// documentation URI; when present they are joined with newlines so the
/// whole message can be surfaced to the user verbatim.
fn join_server_error(code: &str, description: Option<&str>, uri: Option<&str>) -> String {
    let mut message = code.to_string();
    if let Some(description) = description {
        message.push('\n');
        message.push_str(description);
    }
    if let Some(uri) = uri {
        message.push('\n');
        message.push_str(uri);
    }
    message
}

/// Unified error type for loopauth.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A required response or JSON field was not present.
    #[error("parameter missing: {name}")]
    ParameterMissing {
        /// The name of the missing field.
        name: String,
    },

    /// A field was present but had the wrong JSON type.
    #[error("parameter {name} has type {got}, expected {expected}")]
    ParameterType {
        /// The name of the offending field.
        name: String,
        /// The type the field was required to have.
        expected: &'static str,
        /// The type the field actually had.
        got: &'static str,
    },

    /// The `state` echoed on the redirect did not match the grant's state.
    #[error("authorization response state mismatch")]
    InvalidState,

    /// The authorization server reported an error on the redirect.
    #[error("authorization failed: {}", join_server_error(.code.as_str(), .description.as_deref(), .uri.as_deref()))]
    AuthorizationGrant {
        /// The mapped RFC 6749 §4.1.2.1 error code.
        code: AuthorizationErrorCode,
        /// Human-readable explanation from the server, if any.
        description: Option<String>,
        /// Documentation URI from the server, if any.
        uri: Option<String>,
    },

    /// The token endpoint rejected the request with an HTTP 400 error body.
    #[error("token request failed: {}", join_server_error(.code.as_str(), .description.as_deref(), .uri.as_deref()))]
    AccessToken {
        /// The mapped RFC 6749 §5.2 error code.
        code: TokenErrorCode,
        /// Human-readable explanation from the server, if any.
        description: Option<String>,
        /// Documentation URI from the server, if any.
        uri: Option<String>,
    },

    /// The token response carried a `token_type` other than "bearer".
    #[error("unsupported token type: {name}")]
    UnsupportedTokenType {
        /// The token type the server returned.
        name: String,
    },

    /// A network or HTTP failure that is not an AS-reported error.
    #[error("transport error{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        /// HTTP status, when a response was received at all.
        status: Option<u16>,
        /// Response body, captured best-effort.
        body: Option<String>,
        /// The underlying HTTP client failure, if any.
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The embedded lenient JSON parser rejected the input.
    #[error("json parse error: {message} near \"{near}\"")]
    JsonParse {
        /// What category of failure this is.
        kind: JsonErrorKind,
        /// Description of the failure.
        message: String,
        /// A truncated window of the input at the failure site.
        near: String,
    },

    /// Listener-side HTTP protocol failure (400, 404, 405, 500).
    #[error("http {code}: {message}")]
    Http {
        /// The HTTP status code the listener responds with.
        code: u16,
        /// What went wrong.
        message: String,
    },

    /// A caller-provided cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// base64url decoding failed (bad length or non-alphabet input).
    #[error("base64url decode error: {reason}")]
    Base64Decode {
        /// Why the input was rejected.
        reason: String,
    },

    /// The at-rest token blob could not be produced.
    #[error("token serialization failed: {reason}")]
    AtRestEncode {
        /// Why sealing failed.
        reason: String,
    },

    /// The at-rest token blob could not be read back.
    #[error("token deserialization failed: {reason}")]
    AtRestDecode {
        /// Why opening failed.
        reason: String,
    },

    /// I/O error (e.g. from the callback TCP listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    /// The HTTP status the listener should respond with for this failure.
    ///
    /// [`AuthError::Http`] carries its own code; everything else maps to 500.
    pub fn http_code(&self) -> u16 {
        match self {
            Self::Http { code, .. } => *code,
            _ => 500,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
