//! OAuth 2.0 authorization code grant with PKCE.
//!
//! A grant owns the per-authorization secrets: the anti-CSRF `state` and
//! the PKCE `code_verifier`. Both are derived from the system CSPRNG
//! exactly once at construction and never change. The grant is consumed by
//! value on exchange, so a verifier or state can never be used twice.
//!
//! # Flow Overview
//!
//! 1. Construct the grant; state and verifier are generated.
//! 2. Open [`AuthorizationGrant::authorization_url`] in the user's browser.
//! 3. Receive the redirect via the loopback listener.
//! 4. Hand the redirect's query parameters to
//!    [`AuthorizationGrant::exchange`], which validates them and trades the
//!    code for an [`AccessToken`].

use std::collections::{BTreeSet, HashMap};

use ring::constant_time;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::base64url;
use crate::endpoint::TokenEndpoint;
use crate::error::{AuthError, AuthorizationErrorCode, Result};
use crate::secret::SecretString;
use crate::token::AccessToken;

/// Bytes of CSPRNG entropy behind the state and the code verifier.
const GRANT_ENTROPY_BYTES: usize = 32;

/// Query parameters the grant owns on the authorization URL. Pre-existing
/// endpoint parameters with other names are preserved.
const GRANT_QUERY_PARAMS: &[&str] = &[
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "state",
    "code_challenge",
    "code_challenge_method",
];

/// PKCE transform applied to the code verifier (RFC 7636 §4.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeChallengeMethod {
    /// No PKCE. Only for servers that cannot handle the parameters.
    None,
    /// `code_challenge` is the verifier itself.
    Plain,
    /// `code_challenge = base64url(SHA-256(ASCII(verifier)))`.
    #[default]
    S256,
}

/// Configuration for an authorization code grant.
///
/// Endpoints are kept as strings and parsed at use, so a config can be
/// loaded before the network stack is up. `redirect_endpoint` is echoed
/// bit-exact in both the authorization URL and the token request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantConfig {
    /// The authorization endpoint URL. Existing query parameters survive.
    pub authorization_endpoint: String,

    /// The token endpoint URL.
    pub token_endpoint: String,

    /// The redirect URI the listener receives (loopback http URL or a
    /// registered custom scheme).
    pub redirect_endpoint: String,

    /// The OAuth client ID.
    pub client_id: String,

    /// The OAuth client secret (confidential clients only). When present,
    /// the token request carries pre-authenticated HTTP Basic auth.
    pub client_secret: Option<String>,

    /// The scopes to request, in transmission order. `None` omits the
    /// `scope` parameter entirely.
    pub scope: Option<Vec<String>>,

    /// The PKCE transform; S256 unless the server forces otherwise.
    #[serde(default)]
    pub challenge_method: CodeChallengeMethod,
}

/// An in-flight authorization code grant.
///
/// Single-use: [`AuthorizationGrant::exchange`] takes the grant by value,
/// and dropping an unconsumed grant (user canceled, server error) wipes the
/// state and verifier with it.
#[derive(Debug)]
pub struct AuthorizationGrant {
    config: GrantConfig,
    state: SecretString,
    code_verifier: SecretString,
}

impl AuthorizationGrant {
    /// Create a grant, generating fresh state and PKCE verifier.
    ///
    /// # Errors
    ///
    /// [`AuthError::UrlParse`] if an endpoint URL is malformed,
    /// [`AuthError::Io`] if the system CSPRNG fails.
    pub fn new(config: GrantConfig) -> Result<Self> {
        Self::with_state_prefix(config, &[])
    }

    /// Create a grant whose `state` carries a caller-supplied prefix.
    ///
    /// The prefix lets a host multiplex several pending authorizations over
    /// one listener; the state still carries the full 32 bytes of entropy
    /// after it.
    pub fn with_state_prefix(config: GrantConfig, prefix: &[u8]) -> Result<Self> {
        // Both endpoints have to parse; catching that here beats failing
        // after the user already authorized in the browser.
        Url::parse(&config.authorization_endpoint)?;
        Url::parse(&config.token_endpoint)?;

        let mut state_bytes = Vec::with_capacity(prefix.len() + GRANT_ENTROPY_BYTES);
        state_bytes.extend_from_slice(prefix);
        state_bytes.extend_from_slice(&random_entropy()?);
        let state = SecretString::from_string(base64url::encode(&state_bytes));

        let code_verifier = SecretString::from_string(base64url::encode(&random_entropy()?));

        tracing::debug!(client_id = %config.client_id, "authorization grant created");

        Ok(Self {
            config,
            state,
            code_verifier,
        })
    }

    /// The grant's configuration.
    pub fn config(&self) -> &GrantConfig {
        &self.config
    }

    /// The anti-CSRF state, as sent in the authorization URL.
    pub fn state(&self) -> &SecretString {
        &self.state
    }

    /// The PKCE code verifier.
    pub fn code_verifier(&self) -> &SecretString {
        &self.code_verifier
    }

    /// Build the URL to open in the user's browser.
    ///
    /// Grant-owned query parameters overwrite any same-named ones already
    /// on the endpoint; everything else the endpoint carries is preserved.
    pub fn authorization_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.config.authorization_endpoint)?;

        let preserved: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !GRANT_QUERY_PARAMS.contains(&key.as_ref()))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);

        {
            let mut params = url.query_pairs_mut();
            for (key, value) in &preserved {
                params.append_pair(key, value);
            }

            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_endpoint);
            if let Some(ref scope) = self.config.scope {
                params.append_pair("scope", &scope.join(" "));
            }
            self.state.reveal_str(|state| {
                params.append_pair("state", state);
            });

            match self.config.challenge_method {
                CodeChallengeMethod::None => {}
                CodeChallengeMethod::Plain => {
                    self.code_verifier.reveal_str(|verifier| {
                        params.append_pair("code_challenge_method", "plain");
                        params.append_pair("code_challenge", verifier);
                    });
                }
                CodeChallengeMethod::S256 => {
                    let challenge = self.code_challenge_s256();
                    params.append_pair("code_challenge_method", "S256");
                    params.append_pair("code_challenge", &challenge);
                }
            }
        }

        Ok(url)
    }

    /// `base64url(SHA-256(ASCII(verifier)))` per RFC 7636 §4.2.
    fn code_challenge_s256(&self) -> String {
        self.code_verifier.reveal(|verifier| {
            let hash = digest::digest(&digest::SHA256, verifier);
            base64url::encode(hash.as_ref())
        })
    }

    /// Validate the query parameters of the redirect response and return
    /// the authorization code.
    ///
    /// Checks run in a fixed order: `state` present, `state` matches
    /// (constant-time over the decoded bytes), no server-reported `error`,
    /// `code` present.
    ///
    /// # Errors
    ///
    /// [`AuthError::ParameterMissing`], [`AuthError::InvalidState`], or
    /// [`AuthError::AuthorizationGrant`] per the failed check.
    pub fn validate_response(&self, params: &HashMap<String, String>) -> Result<String> {
        let state = params.get("state").ok_or_else(|| AuthError::ParameterMissing {
            name: "state".to_string(),
        })?;

        // A state that does not even decode cannot match.
        let received = base64url::decode(state).map_err(|_| AuthError::InvalidState)?;
        let expected = self
            .state
            .reveal_str(base64url::decode)
            .expect("grant state is base64url by construction");
        constant_time::verify_slices_are_equal(&expected, &received)
            .map_err(|_| AuthError::InvalidState)?;

        if let Some(error) = params.get("error") {
            return Err(AuthError::AuthorizationGrant {
                code: AuthorizationErrorCode::from_wire(error),
                description: params.get("error_description").cloned(),
                uri: params.get("error_uri").cloned(),
            });
        }

        let code = params.get("code").ok_or_else(|| AuthError::ParameterMissing {
            name: "code".to_string(),
        })?;
        Ok(code.clone())
    }

    /// Validate and exchange the redirect response for an access token,
    /// consuming the grant.
    ///
    /// Validation happens before anything touches the network; an invalid
    /// state never produces a token request. The grant's scope list is
    /// passed as the expected scope, so a response that omits `scope` still
    /// yields a token carrying what was requested.
    pub async fn exchange(
        self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let code = self.validate_response(params)?;

        let token_url = Url::parse(&self.config.token_endpoint)?;
        let mut endpoint = TokenEndpoint::new(token_url)?;
        if let Some(ref secret) = self.config.client_secret {
            endpoint = endpoint
                .with_client_credentials(&self.config.client_id, SecretString::new(secret));
        }

        let verifier_binding;
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", &self.config.redirect_endpoint),
            ("client_id", &self.config.client_id),
        ];
        if self.config.challenge_method != CodeChallengeMethod::None {
            verifier_binding = self.code_verifier.reveal_str(str::to_string);
            form.push(("code_verifier", &verifier_binding));
        }

        let expected_scope: Option<BTreeSet<String>> = self
            .config
            .scope
            .as_ref()
            .map(|scope| scope.iter().cloned().collect());

        tracing::info!(client_id = %self.config.client_id, "exchanging authorization code");
        endpoint
            .exchange(&form, expected_scope.as_ref(), cancel)
            .await
    }

    /// Extract the query parameters of a redirect URI into the mapping
    /// [`AuthorizationGrant::validate_response`] consumes.
    ///
    /// Later duplicates of a parameter overwrite earlier ones.
    pub fn redirect_params(redirect: &Url) -> HashMap<String, String> {
        redirect
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }
}

/// 32 bytes from the system CSPRNG.
fn random_entropy() -> Result<[u8; GRANT_ENTROPY_BYTES]> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; GRANT_ENTROPY_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| AuthError::Io(std::io::Error::other("system CSPRNG failure")))?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
