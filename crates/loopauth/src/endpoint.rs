//! Token endpoint client.
//!
//! Issues the two token-endpoint requests this library needs, the
//! authorization-code exchange (built by the grant) and the refresh grant,
//! and maps responses into [`AccessToken`]s or the error variants.
//!
//! Responses are decoded with the embedded lenient JSON parser. HTTP 400
//! bodies are parsed as RFC 6749 §5.2 error responses; every other
//! non-success status surfaces as a transport failure with the body
//! captured best-effort. Nothing is retried here: retry policy belongs to
//! the caller.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AuthError, Result, TokenErrorCode};
use crate::json;
use crate::secret::SecretString;
use crate::token::AccessToken;

/// `User-Agent` sent on every token request.
pub(crate) const USER_AGENT: &str = concat!("loopauth/", env!("CARGO_PKG_VERSION"));

/// A client for one token endpoint URL.
///
/// Holds a connection-reusing HTTP client configured to never follow
/// redirects (a token endpoint that redirects is misbehaving, and following
/// it could leak credentials).
pub struct TokenEndpoint {
    url: Url,
    credentials: Option<(String, SecretString)>,
    client: reqwest::Client,
}

impl TokenEndpoint {
    /// Create a client for the token endpoint at `url`.
    ///
    /// # Errors
    ///
    /// [`AuthError::Transport`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::Transport {
                status: None,
                body: None,
                source: Some(e),
            })?;

        Ok(Self {
            url,
            credentials: None,
            client,
        })
    }

    /// Attach client credentials.
    ///
    /// When set, requests carry pre-authenticated HTTP Basic auth: the
    /// credentials are sent on the first request rather than waiting for a
    /// 401 challenge.
    pub fn with_client_credentials(mut self, client_id: &str, client_secret: SecretString) -> Self {
        self.credentials = Some((client_id.to_string(), client_secret));
        self
    }

    /// Exchange a request body already built by the authorization grant.
    ///
    /// When the response omits `scope` and the caller supplied
    /// `expected_scope`, the expected set is adopted (RFC 6749 §5.1 lets
    /// the server grant the requested scope implicitly).
    pub async fn exchange(
        &self,
        form: &[(&str, &str)],
        expected_scope: Option<&BTreeSet<String>>,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        tracing::debug!(url = %self.url, "requesting token");
        let body = self.post_form(form, cancel).await?;

        let mut token = parse_token_response(&body)?;
        token.adopt_scope_if_absent(expected_scope);
        tracing::debug!("token request successful");
        Ok(token)
    }

    /// Refresh `token` (RFC 6749 §6).
    ///
    /// The request scope repeats the token's scope for continuity. If the
    /// server does not rotate the refresh token, the old refresh material
    /// is carried forward on the returned token.
    ///
    /// # Errors
    ///
    /// [`AuthError::ParameterMissing`] when `token` has no refresh
    /// material; otherwise the same failures as [`TokenEndpoint::exchange`].
    pub async fn refresh(
        &self,
        token: &AccessToken,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let refresh = token.refresh().ok_or_else(|| AuthError::ParameterMissing {
            name: "refresh_token".to_string(),
        })?;

        let scope = token.scope().map(join_scope);
        let refresh_value = refresh.reveal_str(str::to_string);

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_value),
        ];
        if let Some(ref scope) = scope {
            form.push(("scope", scope));
        }

        tracing::debug!(url = %self.url, "refreshing access token");
        let body = self.post_form(&form, cancel).await?;

        let mut new_token = parse_token_response(&body)?;
        new_token.adopt_scope_if_absent(token.scope());
        new_token.inherit_from(token);
        tracing::info!("access token refreshed");
        Ok(new_token)
    }

    /// POST a form body and return the response body on HTTP success.
    ///
    /// The cancellation token is honored at the request send and at the
    /// body read; a fired token yields [`AuthError::Cancelled`] without
    /// leaving token material behind.
    async fn post_form(&self, form: &[(&str, &str)], cancel: &CancellationToken) -> Result<String> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form);

        if let Some((client_id, client_secret)) = &self.credentials {
            request = client_secret
                .reveal_str(|secret| request.basic_auth(client_id, Some(secret)));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            result = request.send() => result.map_err(|e| AuthError::Transport {
                status: None,
                body: None,
                source: Some(e),
            })?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            body = response.text() => body,
        };

        if status.is_success() {
            return body.map_err(|e| AuthError::Transport {
                status: Some(status.as_u16()),
                body: None,
                source: Some(e),
            });
        }

        // The body on an error status is best-effort context.
        let body = body.ok();

        if status == reqwest::StatusCode::BAD_REQUEST
            && let Some(body) = &body
            && let Some(error) = token_error_from_body(body)
        {
            return Err(error);
        }

        Err(AuthError::Transport {
            status: Some(status.as_u16()),
            body,
            source: None,
        })
    }
}

impl std::fmt::Debug for TokenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpoint")
            .field("url", &self.url.as_str())
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

/// Space-join a scope set for transmission, in stable sorted order.
pub(crate) fn join_scope(scope: &BTreeSet<String>) -> String {
    scope
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a successful token response body.
fn parse_token_response(body: &str) -> Result<AccessToken> {
    let value = json::parse(body)?;
    if value.as_object().is_none() {
        return Err(AuthError::ParameterType {
            name: "response".to_string(),
            expected: "object",
            got: value.type_name(),
        });
    }
    AccessToken::from_response_object(&value)
}

/// Try to interpret an HTTP 400 body as an RFC 6749 §5.2 error response.
fn token_error_from_body(body: &str) -> Option<AuthError> {
    let value = json::parse(body).ok()?;
    let code = value.get("error")?.as_str()?;
    Some(AuthError::AccessToken {
        code: TokenErrorCode::from_wire(code),
        description: value
            .get("error_description")
            .and_then(|v| v.as_str())
            .map(String::from),
        uri: value
            .get("error_uri")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
