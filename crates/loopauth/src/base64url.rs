//! base64url (RFC 4648 §5) codec without padding.
//!
//! PKCE verifiers, challenges, the anti-CSRF state, and the at-rest token
//! blob all travel as base64url text with the trailing `=` stripped. This
//! module wraps the `base64` crate's `URL_SAFE_NO_PAD` engine behind the
//! crate's own error type.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{AuthError, Result};

/// Encode `bytes` as base64url without padding.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url text without padding.
///
/// Input length mod 4 may be 0, 2, or 3; a remainder of 1 cannot encode a
/// whole number of bytes and fails, as does any character outside the
/// `-`/`_` alphabet.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| AuthError::Base64Decode {
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
