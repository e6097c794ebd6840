//! At-rest serialization for access tokens.
//!
//! Two wire forms:
//!
//! - **Protected blob**: a versioned binary framing in which the bearer and
//!   refresh material are sealed with AES-256-GCM under a per-user key, the
//!   whole frame then base64-encoded for transport. This is the default
//!   persistence form.
//! - **JSON envelope**: a plaintext `{"access_token", "refresh_token",
//!   "expires_in"}` object for interop with a sibling runtime. Note that
//!   `expires_in` in the envelope is an absolute unix timestamp, not a
//!   duration. Only emitted on explicit request.
//!
//! # Data protection
//!
//! Platforms with DPAPI would use it directly; this implementation
//! substitutes the equivalent user-scoped primitive: a key derived with
//! PBKDF2-HMAC-SHA256 from the machine hostname and username, salted with a
//! fixed library-defined 64-byte entropy constant, encrypting with
//! AES-256-GCM. Blobs are therefore only readable by the same user on the
//! same machine; cross-platform reads of foreign blobs are not supported.
//!
//! The sealed payloads contain the UTF-16LE bytes of the material, which
//! keeps the ciphertext layout compatible with the DPAPI-based form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

use crate::error::{AuthError, Result};
use crate::json::{self, Value};
use crate::secret::SecretString;
use crate::token::AccessToken;

/// Library-defined entropy mixed into the per-user key derivation. Changing
/// this invalidates every previously written blob.
static ATREST_ENTROPY: [u8; 64] = [
    0x83, 0xb3, 0x15, 0xa2, 0x81, 0x57, 0x01, 0x0d, 0x8c, 0x21, 0x04, 0xd9, 0x11, 0xb3, 0xa7,
    0x32, 0xba, 0xb9, 0x8c, 0x15, 0x7b, 0x64, 0x32, 0x2b, 0x2f, 0x5f, 0x0e, 0x0d, 0xe5, 0x0a,
    0x91, 0xc4, 0x46, 0x81, 0xae, 0x72, 0xf6, 0xa7, 0x01, 0x67, 0x01, 0x91, 0x66, 0x1b, 0x5e,
    0x5a, 0x51, 0xaa, 0xbe, 0xf3, 0x23, 0x2a, 0x01, 0xc5, 0x8d, 0x01, 0x24, 0x56, 0x9b, 0xbd,
    0xa6, 0xa3, 0x87, 0x87,
];

/// Blob frame magic + version.
const BLOB_MAGIC: &[u8; 4] = b"LATB";
const BLOB_VERSION: u8 = 1;

/// Field tags inside the frame. Unknown tags are skipped on read.
const TAG_TOKEN: u8 = 1;
const TAG_REFRESH: u8 = 2;
const TAG_AUTHORIZED: u8 = 3;
const TAG_EXPIRES: u8 = 4;
const TAG_SCOPE: u8 = 5;

/// AES-256-GCM key length.
const KEY_LEN: usize = 32;

/// PBKDF2 iteration count for the per-user key (OWASP 2023 for HMAC-SHA256).
const PBKDF2_ITERATIONS: u32 = 600_000;

// ---------------------------------------------------------------------------
// Per-user key
// ---------------------------------------------------------------------------

/// The per-user sealing key, derived once per process.
fn user_key() -> &'static [u8; KEY_LEN] {
    static KEY: std::sync::OnceLock<[u8; KEY_LEN]> = std::sync::OnceLock::new();
    KEY.get_or_init(|| {
        let hostname = hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material = Vec::with_capacity(hostname.len() + username.len());
        material.extend_from_slice(hostname.as_bytes());
        material.extend_from_slice(username.as_bytes());

        let iterations =
            std::num::NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &ATREST_ENTROPY,
            &material,
            &mut key,
        );
        material.zeroize();

        tracing::debug!("derived at-rest token protection key");
        key
    })
}

/// System hostname, falling back to environment variables.
fn hostname() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}

// ---------------------------------------------------------------------------
// Sealing primitives
// ---------------------------------------------------------------------------

/// A single-use nonce sequence: `ring` wants a [`NonceSequence`] per bound
/// key, and each key here is used for exactly one seal or open.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

/// Seal `plaintext`, returning `nonce || ciphertext+tag`.
fn seal(plaintext: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| AuthError::AtRestEncode {
        reason: "failed to generate random nonce".into(),
    })?;

    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, user_key()).map_err(|_| AuthError::AtRestEncode {
            reason: "failed to create sealing key".into(),
        })?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| AuthError::AtRestEncode {
            reason: "seal_in_place failed".into(),
        })?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Open a `nonce || ciphertext+tag` payload produced by [`seal`].
fn open(data: &[u8]) -> Result<Vec<u8>> {
    // Minimum: nonce (12) + tag (16).
    if data.len() < NONCE_LEN + 16 {
        return Err(AuthError::AtRestDecode {
            reason: "sealed field is too short".into(),
        });
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);

    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, user_key()).map_err(|_| AuthError::AtRestDecode {
            reason: "failed to create opening key".into(),
        })?;
    let mut opening_key = OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| AuthError::AtRestDecode {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?;
    let result = plaintext.to_vec();
    in_out.zeroize();
    Ok(result)
}

/// UTF-16LE bytes of a secret, the layout DPAPI-based blobs use.
fn secret_utf16le(secret: &SecretString) -> Vec<u8> {
    secret.reveal_str(|s| {
        s.encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect()
    })
}

/// Inverse of [`secret_utf16le`].
fn secret_from_utf16le(bytes: &[u8]) -> Result<SecretString> {
    if bytes.len() % 2 != 0 {
        return Err(AuthError::AtRestDecode {
            reason: "sealed material has odd length".into(),
        });
    }
    let mut units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let decoded = String::from_utf16(&units).map_err(|_| AuthError::AtRestDecode {
        reason: "sealed material is not valid UTF-16".into(),
    });
    units.zeroize();
    decoded.map(SecretString::from_string)
}

// ---------------------------------------------------------------------------
// Protected blob
// ---------------------------------------------------------------------------

/// Serialize `token` to the protected blob form (base64 text).
///
/// # Errors
///
/// [`AuthError::AtRestEncode`] if sealing fails or a timestamp is outside
/// the representable range.
pub fn encode_blob(token: &AccessToken) -> Result<String> {
    let mut frame = Vec::new();
    frame.extend_from_slice(BLOB_MAGIC);
    frame.push(BLOB_VERSION);

    let mut material = secret_utf16le(token.material());
    let sealed = seal(&material);
    material.zeroize();
    put_field(&mut frame, TAG_TOKEN, &sealed?);

    if let Some(refresh) = token.refresh() {
        let mut refresh = secret_utf16le(refresh);
        let sealed = seal(&refresh);
        refresh.zeroize();
        put_field(&mut frame, TAG_REFRESH, &sealed?);
    }

    if token.authorized_at() != AccessToken::UNKNOWN_AUTHORIZED {
        put_field(
            &mut frame,
            TAG_AUTHORIZED,
            &timestamp_nanos(token.authorized_at())?.to_le_bytes(),
        );
    }

    if token.expires_at() != AccessToken::NO_EXPIRY {
        put_field(
            &mut frame,
            TAG_EXPIRES,
            &timestamp_nanos(token.expires_at())?.to_le_bytes(),
        );
    }

    if let Some(scope) = token.scope() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(scope.len() as u32).to_le_bytes());
        // BTreeSet iteration gives the stable sorted order.
        for entry in scope {
            payload.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            payload.extend_from_slice(entry.as_bytes());
        }
        put_field(&mut frame, TAG_SCOPE, &payload);
    }

    Ok(STANDARD.encode(&frame))
}

/// Recover a token from a protected blob produced by [`encode_blob`].
///
/// # Errors
///
/// [`AuthError::AtRestDecode`] for malformed framing, tampered ciphertext,
/// or a blob written by another user or machine.
pub fn decode_blob(blob: &str) -> Result<AccessToken> {
    let frame = STANDARD.decode(blob).map_err(|e| AuthError::AtRestDecode {
        reason: format!("blob is not valid base64: {e}"),
    })?;

    let mut reader = Reader::new(&frame);
    let magic = reader.take(BLOB_MAGIC.len())?;
    if magic != BLOB_MAGIC {
        return Err(AuthError::AtRestDecode {
            reason: "bad blob magic".into(),
        });
    }
    let version = reader.take(1)?[0];
    if version != BLOB_VERSION {
        return Err(AuthError::AtRestDecode {
            reason: format!("unsupported blob version {version}"),
        });
    }

    let mut material: Option<SecretString> = None;
    let mut refresh: Option<SecretString> = None;
    let mut authorized_at: Option<DateTime<Utc>> = None;
    let mut expires_at: Option<DateTime<Utc>> = None;
    let mut scope: Option<std::collections::BTreeSet<String>> = None;

    while !reader.is_empty() {
        let tag = reader.take(1)?[0];
        let len = reader.take_u32()? as usize;
        let payload = reader.take(len)?;

        match tag {
            TAG_TOKEN => {
                let mut plaintext = open(payload)?;
                let decoded = secret_from_utf16le(&plaintext);
                plaintext.zeroize();
                material = Some(decoded?);
            }
            TAG_REFRESH => {
                let mut plaintext = open(payload)?;
                let decoded = secret_from_utf16le(&plaintext);
                plaintext.zeroize();
                refresh = Some(decoded?);
            }
            TAG_AUTHORIZED => authorized_at = Some(timestamp_from_nanos(payload)?),
            TAG_EXPIRES => expires_at = Some(timestamp_from_nanos(payload)?),
            TAG_SCOPE => {
                let mut entries = std::collections::BTreeSet::new();
                let mut inner = Reader::new(payload);
                let count = inner.take_u32()?;
                for _ in 0..count {
                    let len = inner.take_u32()? as usize;
                    let bytes = inner.take(len)?;
                    let entry =
                        std::str::from_utf8(bytes).map_err(|_| AuthError::AtRestDecode {
                            reason: "scope entry is not valid UTF-8".into(),
                        })?;
                    entries.insert(entry.to_string());
                }
                scope = Some(entries);
            }
            // Unknown fields from a newer writer are skipped.
            _ => {}
        }
    }

    let material = material.ok_or_else(|| AuthError::AtRestDecode {
        reason: "blob has no token field".into(),
    })?;

    AccessToken::from_parts(material, refresh, authorized_at, expires_at, scope)
}

fn put_field(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

fn timestamp_nanos(at: DateTime<Utc>) -> Result<i64> {
    at.timestamp_nanos_opt().ok_or_else(|| AuthError::AtRestEncode {
        reason: "timestamp is outside the representable range".into(),
    })
}

fn timestamp_from_nanos(payload: &[u8]) -> Result<DateTime<Utc>> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| AuthError::AtRestDecode {
        reason: "timestamp field has wrong length".into(),
    })?;
    Ok(DateTime::from_timestamp_nanos(i64::from_le_bytes(bytes)))
}

/// Bounds-checked little-endian reader over a frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(AuthError::AtRestDecode {
                reason: "blob is truncated".into(),
            }),
        }
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

// ---------------------------------------------------------------------------
// JSON envelope
// ---------------------------------------------------------------------------

/// Emit the unencrypted JSON envelope form.
///
/// `expires_in` carries the absolute unix timestamp of `expires_at` (not a
/// duration); this matches the sibling runtime's reader. Fields whose value
/// is unknown are omitted.
pub fn encode_envelope(token: &AccessToken) -> String {
    let mut entries = vec![(
        "access_token".to_string(),
        Value::Str(token.material().reveal_str(str::to_string)),
    )];
    if let Some(refresh) = token.refresh() {
        entries.push((
            "refresh_token".to_string(),
            Value::Str(refresh.reveal_str(str::to_string)),
        ));
    }
    if token.expires_at() != AccessToken::NO_EXPIRY {
        entries.push((
            "expires_in".to_string(),
            Value::Int(token.expires_at().timestamp()),
        ));
    }
    Value::Object(entries).to_json_string()
}

/// Read a token back from the JSON envelope form.
///
/// # Errors
///
/// [`AuthError::JsonParse`] for malformed JSON,
/// [`AuthError::ParameterMissing`] / [`AuthError::ParameterType`] for a
/// missing or mistyped `access_token`, [`AuthError::AtRestDecode`] for an
/// unrepresentable `expires_in`.
pub fn decode_envelope(text: &str) -> Result<AccessToken> {
    let value = json::parse(text)?;

    let material = value
        .get("access_token")
        .ok_or_else(|| AuthError::ParameterMissing {
            name: "access_token".to_string(),
        })?;
    let material = material.as_str().ok_or_else(|| AuthError::ParameterType {
        name: "access_token".to_string(),
        expected: "string",
        got: material.type_name(),
    })?;

    let refresh = match value.get("refresh_token") {
        None => None,
        Some(refresh) => {
            let refresh = refresh.as_str().ok_or_else(|| AuthError::ParameterType {
                name: "refresh_token".to_string(),
                expected: "string",
                got: refresh.type_name(),
            })?;
            Some(SecretString::new(refresh))
        }
    };

    let expires_at = match value.get("expires_in") {
        None => None,
        Some(expires) => {
            let seconds = expires.as_i64().ok_or_else(|| AuthError::ParameterType {
                name: "expires_in".to_string(),
                expected: "integer",
                got: expires.type_name(),
            })?;
            Some(
                DateTime::from_timestamp(seconds, 0).ok_or_else(|| AuthError::AtRestDecode {
                    reason: "expires_in is outside the representable range".into(),
                })?,
            )
        }
    };

    AccessToken::from_parts(SecretString::new(material), refresh, None, expires_at, None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
