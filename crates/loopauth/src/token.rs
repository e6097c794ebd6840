//! Access token record and bearer-header injection.
//!
//! An [`AccessToken`] is immutable after construction. It owns its bearer
//! material (and optional refresh material) as [`SecretString`]s, so nothing
//! here can leak through logging or `Debug`, and both are wiped on drop.
//!
//! Tokens are created from a parsed token-endpoint response (see the
//! endpoint module) or recovered from the at-rest codec (see the store
//! module); there is no public constructor by design.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, Utc};

use crate::error::{AuthError, Result};
use crate::json::Value;
use crate::secret::SecretString;

/// How many seconds before the nominal expiry a token is already treated as
/// expired, so a token is never used that would lapse mid-request.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The token scheme, as a tagged variant so further RFC 6750 successors
/// (MAC, DPoP) can slot in without changing the token record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// RFC 6750 bearer token.
    Bearer,
}

impl TokenKind {
    /// Dispatch on the wire `token_type`, case-insensitively.
    ///
    /// Anything other than "bearer" fails with
    /// [`AuthError::UnsupportedTokenType`].
    pub fn from_wire(token_type: &str) -> Result<Self> {
        if token_type.eq_ignore_ascii_case("bearer") {
            Ok(Self::Bearer)
        } else {
            Err(AuthError::UnsupportedTokenType {
                name: token_type.to_string(),
            })
        }
    }

    /// The scheme name as it appears in the `Authorization` header.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
        }
    }
}

/// An access token issued by the authorization server.
///
/// Equality and hashing consider only the token material; the timestamps
/// and scope are metadata. Material comparison is constant-time.
#[derive(Debug)]
pub struct AccessToken {
    kind: TokenKind,
    material: SecretString,
    refresh: Option<SecretString>,
    authorized_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    scope: Option<BTreeSet<String>>,
}

impl AccessToken {
    /// Sentinel for "the authorization time is unknown".
    pub const UNKNOWN_AUTHORIZED: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

    /// Sentinel for "the token never expires".
    pub const NO_EXPIRY: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

    /// Build a token from a parsed token-endpoint response object.
    ///
    /// Extraction order: `token_type` dispatch, then `access_token`,
    /// `expires_in`, `refresh_token`, `scope`. An `expires_in` too large to
    /// represent clamps to [`AccessToken::NO_EXPIRY`] rather than
    /// overflowing.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnsupportedTokenType`] for any non-bearer `token_type`,
    /// [`AuthError::ParameterMissing`] / [`AuthError::ParameterType`] for
    /// absent or mistyped fields.
    pub(crate) fn from_response_object(object: &Value) -> Result<Self> {
        let token_type = require_str(object, "token_type")?;
        let kind = TokenKind::from_wire(token_type)?;

        let material = require_str(object, "access_token")?;
        if material.is_empty() {
            return Err(AuthError::ParameterMissing {
                name: "access_token".to_string(),
            });
        }
        let material = SecretString::new(material);

        let now = Utc::now();
        let expires_at = match object.get("expires_in") {
            None => Self::NO_EXPIRY,
            Some(value) => expiry_from_seconds(value, now)?,
        };

        let refresh = match object.get("refresh_token") {
            None => None,
            Some(value) => {
                let refresh = value.as_str().ok_or_else(|| AuthError::ParameterType {
                    name: "refresh_token".to_string(),
                    expected: "string",
                    got: value.type_name(),
                })?;
                Some(SecretString::new(refresh))
            }
        };

        let scope = match object.get("scope") {
            None => None,
            Some(value) => {
                let scope = value.as_str().ok_or_else(|| AuthError::ParameterType {
                    name: "scope".to_string(),
                    expected: "string",
                    got: value.type_name(),
                })?;
                Some(split_scope(scope))
            }
        };

        Ok(Self {
            kind,
            material,
            refresh,
            authorized_at: now,
            expires_at,
            scope,
        })
    }

    /// Rebuild a token from persisted parts (at-rest codec, JSON envelope).
    pub(crate) fn from_parts(
        material: SecretString,
        refresh: Option<SecretString>,
        authorized_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
        scope: Option<BTreeSet<String>>,
    ) -> Result<Self> {
        if material.is_empty() {
            return Err(AuthError::ParameterMissing {
                name: "access_token".to_string(),
            });
        }
        let authorized_at = authorized_at.unwrap_or(Self::UNKNOWN_AUTHORIZED);
        let expires_at = expires_at.unwrap_or(Self::NO_EXPIRY);
        if expires_at < authorized_at {
            return Err(AuthError::AtRestDecode {
                reason: "expiry precedes authorization time".to_string(),
            });
        }
        Ok(Self {
            kind: TokenKind::Bearer,
            material,
            refresh,
            authorized_at,
            expires_at,
            scope,
        })
    }

    /// The token scheme.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The raw bearer material.
    pub fn material(&self) -> &SecretString {
        &self.material
    }

    /// The refresh material, when the server issued one.
    pub fn refresh(&self) -> Option<&SecretString> {
        self.refresh.as_ref()
    }

    /// When the user initially authorized this token.
    ///
    /// [`AccessToken::UNKNOWN_AUTHORIZED`] when the time was not recorded.
    pub fn authorized_at(&self) -> DateTime<Utc> {
        self.authorized_at
    }

    /// When the token expires; [`AccessToken::NO_EXPIRY`] when it never does.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The granted scope set, if the server communicated one.
    pub fn scope(&self) -> Option<&BTreeSet<String>> {
        self.scope.as_ref()
    }

    /// Whether a refresh grant can be issued for this token.
    pub fn is_refreshable(&self) -> bool {
        self.refresh.is_some()
    }

    /// Whether the token is expired, with a 60-second safety margin so a
    /// token is never presented that lapses mid-request.
    pub fn is_expired(&self) -> bool {
        if self.expires_at == Self::NO_EXPIRY {
            return false;
        }
        Utc::now() >= self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
    }

    /// The `Authorization` header value for this token.
    pub fn authorization_header(&self) -> String {
        self.material
            .reveal_str(|material| format!("{} {}", self.kind.scheme(), material))
    }

    /// Attach this token's authorization to an outgoing request.
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, self.authorization_header())
    }

    /// Adopt `expected` as the granted scope when the response did not
    /// carry one; the server granting the requested scope implicitly is
    /// permitted by RFC 6749 §5.1.
    pub(crate) fn adopt_scope_if_absent(&mut self, expected: Option<&BTreeSet<String>>) {
        if self.scope.is_none()
            && let Some(expected) = expected
        {
            self.scope = Some(expected.clone());
        }
    }

    /// Carry refresh material and the original authorization time forward
    /// from the token being refreshed. Refresh tokens are not required to
    /// rotate (RFC 6749 §6).
    pub(crate) fn inherit_from(&mut self, previous: &AccessToken) {
        if self.refresh.is_none() {
            self.refresh = previous.refresh.as_ref().map(SecretString::duplicate);
        }
        if previous.authorized_at != Self::UNKNOWN_AUTHORIZED {
            self.authorized_at = previous.authorized_at;
        }
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.material == other.material
    }
}

impl Eq for AccessToken {}

impl Hash for AccessToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.material.hash(state);
    }
}

/// Split a whitespace-separated scope string into a set.
pub(crate) fn split_scope(scope: &str) -> BTreeSet<String> {
    scope.split_ascii_whitespace().map(String::from).collect()
}

/// Resolve `expires_in` seconds against `now`, clamping anything too large
/// to represent (including integers that degraded to floats in the lenient
/// parser) to the no-expiry sentinel.
fn expiry_from_seconds(value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let seconds = match value {
        Value::Int(secs) => *secs,
        Value::Float(secs) if secs.is_finite() && *secs >= 0.0 => {
            if *secs >= i64::MAX as f64 {
                return Ok(AccessToken::NO_EXPIRY);
            }
            *secs as i64
        }
        other => {
            return Err(AuthError::ParameterType {
                name: "expires_in".to_string(),
                expected: "non-negative integer",
                got: other.type_name(),
            });
        }
    };
    if seconds < 0 {
        return Err(AuthError::ParameterType {
            name: "expires_in".to_string(),
            expected: "non-negative integer",
            got: "integer",
        });
    }
    let duration = match Duration::try_seconds(seconds) {
        Some(duration) => duration,
        None => return Ok(AccessToken::NO_EXPIRY),
    };
    Ok(now
        .checked_add_signed(duration)
        .unwrap_or(AccessToken::NO_EXPIRY))
}

/// Extract a required string field from a response object.
fn require_str<'a>(object: &'a Value, name: &str) -> Result<&'a str> {
    let value = object.get(name).ok_or_else(|| AuthError::ParameterMissing {
        name: name.to_string(),
    })?;
    value.as_str().ok_or_else(|| AuthError::ParameterType {
        name: name.to_string(),
        expected: "string",
        got: value.type_name(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json;

    fn parse_token(body: &str) -> Result<AccessToken> {
        AccessToken::from_response_object(&json::parse(body).unwrap())
    }

    #[test]
    fn minimal_response() {
        let token = parse_token(r#"{"access_token": "tok_1", "token_type": "bearer"}"#).unwrap();

        token.material().reveal_str(|m| assert_eq!(m, "tok_1"));
        assert!(!token.is_refreshable());
        assert_eq!(token.expires_at(), AccessToken::NO_EXPIRY);
        assert!(!token.is_expired());
        assert!(token.scope().is_none());
    }

    #[test]
    fn full_response() {
        let token = parse_token(
            r#"{
                "access_token": "tok_2",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "ref_2",
                "scope": "read  write\tread"
            }"#,
        )
        .unwrap();

        assert!(token.is_refreshable());
        token
            .refresh()
            .unwrap()
            .reveal_str(|r| assert_eq!(r, "ref_2"));

        let until_expiry = token.expires_at() - Utc::now();
        assert!(until_expiry.num_seconds() > 3500 && until_expiry.num_seconds() <= 3600);

        let scope = token.scope().unwrap();
        assert_eq!(scope.len(), 2);
        assert!(scope.contains("read"));
        assert!(scope.contains("write"));
    }

    #[test]
    fn token_type_case_insensitive() {
        for token_type in ["bearer", "Bearer", "BEARER", "bEaReR"] {
            let body = format!(r#"{{"access_token": "t", "token_type": "{token_type}"}}"#);
            assert_eq!(parse_token(&body).unwrap().kind(), TokenKind::Bearer);
        }
    }

    #[test]
    fn unsupported_token_type() {
        let result = parse_token(r#"{"access_token": "t", "token_type": "mac"}"#);
        match result {
            Err(AuthError::UnsupportedTokenType { name }) => assert_eq!(name, "mac"),
            other => panic!("expected UnsupportedTokenType, got {other:?}"),
        }
    }

    #[test]
    fn missing_access_token() {
        let result = parse_token(r#"{"token_type": "bearer"}"#);
        assert!(matches!(
            result,
            Err(AuthError::ParameterMissing { name }) if name == "access_token"
        ));
    }

    #[test]
    fn empty_access_token_rejected() {
        let result = parse_token(r#"{"access_token": "", "token_type": "bearer"}"#);
        assert!(matches!(result, Err(AuthError::ParameterMissing { .. })));
    }

    #[test]
    fn missing_token_type() {
        let result = parse_token(r#"{"access_token": "t"}"#);
        assert!(matches!(
            result,
            Err(AuthError::ParameterMissing { name }) if name == "token_type"
        ));
    }

    #[test]
    fn mistyped_access_token() {
        let result = parse_token(r#"{"access_token": 42, "token_type": "bearer"}"#);
        match result {
            Err(AuthError::ParameterType { name, expected, got }) => {
                assert_eq!(name, "access_token");
                assert_eq!(expected, "string");
                assert_eq!(got, "integer");
            }
            other => panic!("expected ParameterType, got {other:?}"),
        }
    }

    #[test]
    fn negative_expires_in_rejected() {
        let result =
            parse_token(r#"{"access_token": "t", "token_type": "bearer", "expires_in": -5}"#);
        assert!(matches!(result, Err(AuthError::ParameterType { .. })));
    }

    #[test]
    fn overflowing_expires_in_clamps_to_no_expiry() {
        // 10^20 seconds does not fit an i64 path through chrono; the lenient
        // parser hands it over as a float.
        let token = parse_token(
            r#"{"access_token": "t", "token_type": "bearer", "expires_in": 100000000000000000000}"#,
        )
        .unwrap();
        assert_eq!(token.expires_at(), AccessToken::NO_EXPIRY);
        assert!(!token.is_expired());
    }

    #[test]
    fn large_but_representable_expires_in_clamps_not_errors() {
        let token = parse_token(
            r#"{"access_token": "t", "token_type": "bearer", "expires_in": 9223372036854775807}"#,
        )
        .unwrap();
        assert_eq!(token.expires_at(), AccessToken::NO_EXPIRY);
    }

    #[test]
    fn equality_is_material_only() {
        let a = parse_token(
            r#"{"access_token": "same", "token_type": "bearer", "expires_in": 100}"#,
        )
        .unwrap();
        let b = parse_token(r#"{"access_token": "same", "token_type": "bearer", "scope": "x"}"#)
            .unwrap();
        let c = parse_token(r#"{"access_token": "other", "token_type": "bearer"}"#).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn authorization_header_value() {
        let token = parse_token(r#"{"access_token": "abc123", "token_type": "bearer"}"#).unwrap();
        assert_eq!(token.authorization_header(), "Bearer abc123");
    }

    #[test]
    fn is_expired_within_margin() {
        let token = parse_token(
            r#"{"access_token": "t", "token_type": "bearer", "expires_in": 30}"#,
        )
        .unwrap();
        // 30 seconds out is within the 60-second safety margin.
        assert!(token.is_expired());

        let token = parse_token(
            r#"{"access_token": "t", "token_type": "bearer", "expires_in": 3600}"#,
        )
        .unwrap();
        assert!(!token.is_expired());
    }

    #[test]
    fn adopt_scope_only_when_absent() {
        let expected: BTreeSet<String> = ["config".to_string()].into();

        let mut token = parse_token(r#"{"access_token": "t", "token_type": "bearer"}"#).unwrap();
        token.adopt_scope_if_absent(Some(&expected));
        assert_eq!(token.scope(), Some(&expected));

        let mut token = parse_token(
            r#"{"access_token": "t", "token_type": "bearer", "scope": "granted"}"#,
        )
        .unwrap();
        token.adopt_scope_if_absent(Some(&expected));
        assert!(token.scope().unwrap().contains("granted"));
        assert!(!token.scope().unwrap().contains("config"));
    }

    #[test]
    fn inherit_carries_refresh_forward() {
        let old = parse_token(
            r#"{"access_token": "old", "token_type": "bearer", "refresh_token": "keep_me"}"#,
        )
        .unwrap();

        let mut new = parse_token(r#"{"access_token": "new", "token_type": "bearer"}"#).unwrap();
        new.inherit_from(&old);
        assert!(new.is_refreshable());
        new.refresh().unwrap().reveal_str(|r| assert_eq!(r, "keep_me"));
        assert_eq!(new.authorized_at(), old.authorized_at());
    }

    #[test]
    fn inherit_prefers_rotated_refresh() {
        let old = parse_token(
            r#"{"access_token": "old", "token_type": "bearer", "refresh_token": "stale"}"#,
        )
        .unwrap();

        let mut new = parse_token(
            r#"{"access_token": "new", "token_type": "bearer", "refresh_token": "rotated"}"#,
        )
        .unwrap();
        new.inherit_from(&old);
        new.refresh().unwrap().reveal_str(|r| assert_eq!(r, "rotated"));
    }

    #[test]
    fn from_parts_validates_ordering() {
        let result = AccessToken::from_parts(
            SecretString::new("t"),
            None,
            Some(Utc::now()),
            Some(Utc::now() - Duration::seconds(10)),
            None,
        );
        assert!(matches!(result, Err(AuthError::AtRestDecode { .. })));
    }

    #[test]
    fn from_parts_defaults_sentinels() {
        let token =
            AccessToken::from_parts(SecretString::new("t"), None, None, None, None).unwrap();
        assert_eq!(token.authorized_at(), AccessToken::UNKNOWN_AUTHORIZED);
        assert_eq!(token.expires_at(), AccessToken::NO_EXPIRY);
    }

    #[test]
    fn split_scope_deduplicates() {
        let scope = split_scope("a b a\t c\nb");
        assert_eq!(scope.len(), 3);
    }

    #[test]
    fn token_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AccessToken>();
    }
}
