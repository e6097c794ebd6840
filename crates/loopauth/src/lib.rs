//! Client-side OAuth 2.0 for native desktop applications.
//!
//! loopauth implements the authorization code grant with PKCE (RFC 6749
//! §4.1 + RFC 7636) the way a desktop app has to run it: the authorization
//! URL opens in the user's browser, the redirect lands on a loopback HTTP
//! listener this crate provides, and the code is exchanged for an RFC 6750
//! bearer token that can be refreshed and persisted encrypted at rest.
//!
//! # Flow
//!
//! ```no_run
//! use loopauth::{AuthorizationGrant, CallbackListener, CancellationToken, GrantConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> loopauth::Result<()> {
//! let mut listener =
//!     CallbackListener::bind("127.0.0.1".parse().unwrap(), 0).await?;
//!
//! let grant = AuthorizationGrant::new(GrantConfig {
//!     authorization_endpoint: "https://as.example.org/authorize".into(),
//!     token_endpoint: "https://as.example.org/token".into(),
//!     redirect_endpoint: listener.redirect_endpoint(),
//!     client_id: "org.example.app".into(),
//!     client_secret: None,
//!     scope: Some(vec!["profile".into()]),
//!     challenge_method: Default::default(),
//! })?;
//!
//! listener.start()?;
//! let url = grant.authorization_url()?;
//! // Open `url` in the user's browser, then:
//! let redirect = listener
//!     .wait_for_callback(Duration::from_secs(300))
//!     .await
//!     .expect("user did not finish authorizing");
//! let params = AuthorizationGrant::redirect_params(&redirect);
//! let token = grant.exchange(&params, &CancellationToken::new()).await?;
//! listener.stop().await;
//!
//! // Attach `token.authorization_header()` to API requests; persist with
//! // `loopauth::store::encode_blob(&token)`.
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`grant`]: PKCE and state generation, authorization URL construction,
//!   redirect validation, code exchange.
//! - [`listener`]: the loopback redirect listener with its embedded help
//!   pages.
//! - [`endpoint`]: the token endpoint client, including refresh.
//! - [`token`]: the access token record and bearer-header injection.
//! - [`store`]: encrypted at-rest blobs and the plaintext JSON envelope.
//! - [`json`]: the lenient JSON parser token responses are decoded with.
//! - [`secret`], [`base64url`], [`error`]: supporting pieces.

pub mod base64url;
pub mod endpoint;
pub mod error;
pub mod grant;
pub mod json;
pub mod listener;
pub mod secret;
pub mod store;
pub mod token;

pub use endpoint::TokenEndpoint;
pub use error::{AuthError, AuthorizationErrorCode, JsonErrorKind, Result, TokenErrorCode};
pub use grant::{AuthorizationGrant, CodeChallengeMethod, GrantConfig};
pub use listener::{CallbackListener, RequestEvent};
pub use secret::SecretString;
pub use token::{AccessToken, TokenKind};

// Cancellation is part of every suspending API; re-exported so callers do
// not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
