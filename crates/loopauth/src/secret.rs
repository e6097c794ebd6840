//! Confidential string storage for token material, PKCE verifiers, and
//! anti-CSRF state.
//!
//! [`SecretString`] owns its bytes exclusively and wipes them on drop. The
//! content never appears in `Debug` output and is only reachable through a
//! scoped reveal, so accidental logging or formatting cannot leak it. Copies
//! are explicit: there is no `Clone` impl, use [`SecretString::duplicate`].
//!
//! Equality is constant-time so the holder can be used for values an
//! attacker may probe byte-by-byte (the redirect `state` in particular).

use std::hash::{Hash, Hasher};

use ring::constant_time;
use zeroize::Zeroize;

/// An immutable secret string that zeroizes its storage on drop.
///
/// Internally the value is always valid UTF-8; everything this library
/// protects (bearer material, refresh material, PKCE verifier, state) is
/// text on the wire.
pub struct SecretString {
    value: String,
}

impl SecretString {
    /// Copy `value` into protected storage.
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }

    /// Take ownership of an already-built `String` without another copy.
    ///
    /// The caller must not retain other copies of the material.
    pub fn from_string(value: String) -> Self {
        Self { value }
    }

    /// Reveal the secret bytes to the closure.
    ///
    /// The borrow is scoped to the call: no copy of the material is made,
    /// so there is nothing extra to wipe when the closure returns.
    pub fn reveal<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.value.as_bytes())
    }

    /// Reveal the secret as `&str` to the closure.
    pub fn reveal_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.value)
    }

    /// Length of the secret in bytes.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Explicitly copy the secret.
    ///
    /// Deliberately not `Clone`: duplicating secret material should be
    /// visible at the call site.
    pub fn duplicate(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }

    /// Constant-time comparison against raw bytes.
    ///
    /// Returns `false` for length mismatches without inspecting content
    /// byte-by-byte (length is not treated as confidential).
    pub fn ct_eq_bytes(&self, other: &[u8]) -> bool {
        constant_time::verify_slices_are_equal(self.value.as_bytes(), other).is_ok()
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq_bytes(other.value.as_bytes())
    }
}

impl Eq for SecretString {}

impl Hash for SecretString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.as_bytes().hash(state);
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
