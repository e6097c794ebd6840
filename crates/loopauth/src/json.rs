//! Embedded lenient JSON value parser.
//!
//! Token responses (and anything else the library reads off the wire) are
//! decoded with this parser rather than a strict RFC 8259 one, because some
//! authorization servers and persisted configurations take liberties the
//! library has to keep accepting:
//!
//! - `//` line and `/* */` block comments wherever whitespace is allowed.
//! - `true` / `false` / `null` matched case-insensitively, as long as the
//!   keyword is terminated by a non-identifier character.
//! - Unquoted object keys made of letters, digits, and underscores.
//! - Numbers with a leading `+`.
//! - `\uXXXX` escapes with 1–4 hex digits (the escape ends at the first
//!   non-hex character); unknown escapes collapse to a literal backslash
//!   followed by the character; raw control characters pass through.
//!
//! The leniency can be switched off with [`parse_strict`] for callers that
//! want RFC 8259 behavior. Duplicate object keys fail in both modes, and
//! trailing content after the top-level value is always an error.

use crate::error::{AuthError, JsonErrorKind, Result};

/// A parsed JSON value.
///
/// Objects preserve insertion order; numbers without a fractional or
/// exponent part that fit a signed 64-bit integer become [`Value::Int`],
/// everything else numeric becomes [`Value::Float`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// JSON `true` / `false`.
    Bool(bool),
    /// Integer number.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// String.
    Str(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Insertion-order-preserving map. Duplicate keys are rejected at parse
    /// time, so lookups can stop at the first match.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// A short name for the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// The boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The numeric payload widened to `f64`, if this is any number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The elements, if this is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// The entries, if this is an object.
    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up `key` in an object value.
    ///
    /// Returns `None` for non-objects and missing keys alike.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Emit the value as normalized (strict) JSON text.
    ///
    /// The output contains no comments, quoting is canonical, and all
    /// control characters are escaped, so re-parsing the output is
    /// idempotent. Non-finite floats have no JSON representation and are
    /// emitted as `null`.
    pub fn to_json_string(&self) -> String {
        let mut out = String::new();
        self.write_json(&mut out);
        out
    }

    fn write_json(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(true) => out.push_str("true"),
            Value::Bool(false) => out.push_str("false"),
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::Float(f) if f.is_finite() => out.push_str(&f.to_string()),
            Value::Float(_) => out.push_str("null"),
            Value::Str(s) => write_json_string(s, out),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_json(out);
                }
                out.push(']');
            }
            Value::Object(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_json_string(key, out);
                    out.push(':');
                    value.write_json(out);
                }
                out.push('}');
            }
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Parse a single top-level JSON value with the lenient grammar.
pub fn parse(input: &str) -> Result<Value> {
    Parser::new(input, true).parse_document()
}

/// Parse a single top-level JSON value with strict RFC 8259 rules.
///
/// Comments, unquoted keys, case-folded keywords, and leading `+` all
/// become errors in this mode.
pub fn parse_strict(input: &str) -> Result<Value> {
    Parser::new(input, false).parse_document()
}

/// How many characters of the input to quote in error messages.
const ERROR_WINDOW_CHARS: usize = 20;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    lenient: bool,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, lenient: bool) -> Self {
        Self {
            input,
            pos: 0,
            lenient,
        }
    }

    fn parse_document(mut self) -> Result<Value> {
        self.skip_whitespace();
        let value = self.parse_value()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.fail(JsonErrorKind::TrailingData, "trailing data after value"));
        }
        Ok(value)
    }

    // -- Input primitives ---------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Build a parse error with a truncated window of the remaining input.
    fn fail(&self, kind: JsonErrorKind, message: &str) -> AuthError {
        let rest = &self.input[self.pos..];
        let mut near: String = rest.chars().take(ERROR_WINDOW_CHARS).collect();
        if rest.chars().nth(ERROR_WINDOW_CHARS).is_some() {
            near.push('…');
        }
        AuthError::JsonParse {
            kind,
            message: message.to_string(),
            near,
        }
    }

    /// Skip whitespace and, in lenient mode, comments.
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.lenient => {
                    let rest = &self.input[self.pos..];
                    if rest.starts_with("//") {
                        self.pos += 2;
                        while let Some(c) = self.peek() {
                            self.bump();
                            if c == '\n' {
                                break;
                            }
                        }
                    } else if rest.starts_with("/*") {
                        self.pos += 2;
                        match rest[2..].find("*/") {
                            Some(end) => self.pos += end + 2,
                            // Unterminated block comment swallows the rest;
                            // whatever was expected next reports the error.
                            None => self.pos = self.input.len(),
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    // -- Values -------------------------------------------------------------

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek() {
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"') => self.parse_string().map(Value::Str),
            Some('-') => self.parse_number(),
            Some('+') if self.lenient => self.parse_number(),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some(c) if is_identifier_char(c) => self.parse_keyword(),
            _ => Err(self.fail(JsonErrorKind::UnknownValue, "expected a value")),
        }
    }

    fn parse_keyword(&mut self) -> Result<Value> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_identifier_char(c) {
                self.bump();
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];

        let matched = if self.lenient {
            if word.eq_ignore_ascii_case("true") {
                Some(Value::Bool(true))
            } else if word.eq_ignore_ascii_case("false") {
                Some(Value::Bool(false))
            } else if word.eq_ignore_ascii_case("null") {
                Some(Value::Null)
            } else {
                None
            }
        } else {
            match word {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                "null" => Some(Value::Null),
                _ => None,
            }
        };

        match matched {
            Some(value) => Ok(value),
            None => {
                self.pos = start;
                Err(self.fail(JsonErrorKind::UnknownValue, "expected a value"))
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;

        if matches!(self.peek(), Some('+') | Some('-')) {
            self.bump();
        }

        if self.take_digits() == 0 {
            self.pos = start;
            return Err(self.fail(JsonErrorKind::UnknownValue, "malformed number"));
        }

        let mut is_float = false;

        if self.peek() == Some('.') {
            self.bump();
            if self.take_digits() == 0 {
                self.pos = start;
                return Err(self.fail(JsonErrorKind::UnknownValue, "empty fraction in number"));
            }
            is_float = true;
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            if self.take_digits() == 0 {
                self.pos = start;
                return Err(self.fail(JsonErrorKind::UnknownValue, "empty exponent in number"));
            }
            is_float = true;
        }

        let text = &self.input[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => {
                    self.pos = start;
                    Err(self.fail(JsonErrorKind::UnknownValue, "malformed number"))
                }
            }
        } else {
            // Integers that overflow i64 degrade to floating point rather
            // than failing; the token layer clamps them.
            match text.parse::<i64>() {
                Ok(n) => Ok(Value::Int(n)),
                Err(_) => match text.parse::<f64>() {
                    Ok(f) => Ok(Value::Float(f)),
                    Err(_) => {
                        self.pos = start;
                        Err(self.fail(JsonErrorKind::UnknownValue, "malformed number"))
                    }
                },
            }
        }
    }

    fn take_digits(&mut self) -> usize {
        let mut count = 0;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    fn parse_string(&mut self) -> Result<String> {
        debug_assert_eq!(self.peek(), Some('"'));
        self.bump();

        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => self.parse_escape(&mut out)?,
                // Raw control characters are accepted verbatim.
                Some(c) => out.push(c),
                None => {
                    return Err(
                        self.fail(JsonErrorKind::MissingClosingBracket, "unterminated string")
                    );
                }
            }
        }
    }

    fn parse_escape(&mut self, out: &mut String) -> Result<()> {
        match self.bump() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let unit = self.parse_hex_unit();
                self.push_utf16_unit(unit, out);
            }
            // Any other escape collapses to a literal backslash followed by
            // the character.
            Some(c) => {
                out.push('\\');
                out.push(c);
            }
            None => {
                return Err(self.fail(
                    JsonErrorKind::MissingClosingBracket,
                    "unterminated string escape",
                ));
            }
        }
        Ok(())
    }

    /// Read 1–4 hex digits after `\u`; the escape ends at the first non-hex
    /// character. Zero digits yield U+0000.
    fn parse_hex_unit(&mut self) -> u16 {
        let mut unit: u16 = 0;
        for _ in 0..4 {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    self.bump();
                    unit = unit << 4 | d as u16;
                }
                None => break,
            }
        }
        unit
    }

    /// Append a UTF-16 code unit, pairing surrogates when the input provides
    /// both halves and substituting U+FFFD for lone ones.
    fn push_utf16_unit(&mut self, unit: u16, out: &mut String) {
        if (0xD800..=0xDBFF).contains(&unit) {
            // High surrogate: only meaningful if a low surrogate escape
            // follows directly.
            let rest = &self.input[self.pos..];
            if rest.starts_with("\\u") {
                let saved = self.pos;
                self.pos += 2;
                let low = self.parse_hex_unit();
                if (0xDC00..=0xDFFF).contains(&low) {
                    let combined =
                        0x10000 + ((unit as u32 - 0xD800) << 10) + (low as u32 - 0xDC00);
                    out.push(char::from_u32(combined).unwrap_or('\u{FFFD}'));
                    return;
                }
                self.pos = saved;
            }
            out.push('\u{FFFD}');
        } else if (0xDC00..=0xDFFF).contains(&unit) {
            out.push('\u{FFFD}');
        } else {
            out.push(char::from_u32(unit as u32).unwrap_or('\u{FFFD}'));
        }
    }

    // -- Compound values ----------------------------------------------------

    fn parse_array(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek(), Some('['));
        self.bump();

        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.bump();
            return Ok(Value::Array(items));
        }

        loop {
            self.skip_whitespace();
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                None => {
                    return Err(
                        self.fail(JsonErrorKind::MissingClosingBracket, "unterminated array")
                    );
                }
                Some(_) => {
                    return Err(self.fail(
                        JsonErrorKind::MissingSeparator,
                        "expected ',' or ']' in array",
                    ));
                }
            }
        }
    }

    fn parse_object(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek(), Some('{'));
        self.bump();

        let mut entries: Vec<(String, Value)> = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(Value::Object(entries));
        }

        loop {
            self.skip_whitespace();
            let key = self.parse_key()?;
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(self.fail(JsonErrorKind::DuplicateKey, "duplicate object key"));
            }

            self.skip_whitespace();
            if self.peek() != Some(':') {
                return Err(self.fail(
                    JsonErrorKind::MissingSeparator,
                    "expected ':' after object key",
                ));
            }
            self.bump();

            self.skip_whitespace();
            let value = self.parse_value()?;
            entries.push((key, value));

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    return Ok(Value::Object(entries));
                }
                None => {
                    return Err(
                        self.fail(JsonErrorKind::MissingClosingBracket, "unterminated object")
                    );
                }
                Some(_) => {
                    return Err(self.fail(
                        JsonErrorKind::MissingSeparator,
                        "expected ',' or '}' in object",
                    ));
                }
            }
        }
    }

    /// Object keys are quoted strings, or (lenient mode) bare identifiers.
    fn parse_key(&mut self) -> Result<String> {
        match self.peek() {
            Some('"') => self.parse_string(),
            Some(c) if self.lenient && is_identifier_char(c) => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if is_identifier_char(c) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                Ok(self.input[start..self.pos].to_string())
            }
            _ => Err(self.fail(
                JsonErrorKind::InvalidIdentifier,
                "expected an object key",
            )),
        }
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
