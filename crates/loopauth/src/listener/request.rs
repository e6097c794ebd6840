//! HTTP request reading and parsing for the callback listener.
//!
//! The listener speaks just enough HTTP to receive a browser redirect:
//! read the header block, tokenize the request line, fold and join headers,
//! and drain a declared body without inspecting it. Anything beyond that is
//! deliberately out of scope.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{AuthError, Result};

/// Upper bound on the header block. Redirect requests are tiny; anything
/// larger is garbage or an attack.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    /// The request method, uppercased.
    pub method: String,
    /// The raw request target (second token of the request line).
    pub target: String,
    /// Header name/value pairs; duplicate names are already joined.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// The declared `Content-Length`, when present and parseable as a
    /// non-negative integer.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
    }
}

/// Read bytes one at a time until the CRLF-CRLF terminator.
///
/// A 4-byte rolling window spots the terminator, so the accumulated buffer
/// never needs rescanning.
///
/// # Errors
///
/// [`AuthError::Http`] 400 when the peer closes early or the block exceeds
/// [`MAX_HEADER_BYTES`].
pub(crate) async fn read_header_block<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut block = Vec::with_capacity(512);
    let mut tail = [0u8; 4];

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(AuthError::Http {
                    code: 400,
                    message: "connection closed before the headers finished".to_string(),
                });
            }
            Err(e) => return Err(AuthError::Io(e)),
        };

        block.push(byte);
        tail = [tail[1], tail[2], tail[3], byte];
        if tail == *b"\r\n\r\n" {
            return Ok(block);
        }
        if block.len() > MAX_HEADER_BYTES {
            return Err(AuthError::Http {
                code: 400,
                message: "request headers too large".to_string(),
            });
        }
    }
}

/// Discard exactly `length` body bytes.
///
/// The body of a redirect request carries nothing the listener needs, but
/// leaving it unread can make the peer see a reset before it reads our
/// response.
pub(crate) async fn drain_body<R>(reader: &mut R, length: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = length;
    let mut scratch = [0u8; 1024];
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let got = reader.read(&mut scratch[..want]).await?;
        if got == 0 {
            // Peer closed early; nothing more to drain.
            return Ok(());
        }
        remaining -= got as u64;
    }
    Ok(())
}

/// Parse an accumulated header block into a [`RequestHead`].
///
/// # Errors
///
/// [`AuthError::Http`] 400 for a malformed request line, 405 for any
/// method other than GET or POST.
pub(crate) fn parse_head(block: &[u8]) -> Result<RequestHead> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(AuthError::Http {
            code: 400,
            message: format!("malformed request line: {request_line}"),
        });
    }

    let method = parts[0].to_ascii_uppercase();
    if method != "GET" && method != "POST" {
        return Err(AuthError::Http {
            code: 405,
            message: format!("method {method} not allowed"),
        });
    }

    let target = parts[1].to_string();

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation: append to the previous header with a
            // single leading space.
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            // A header line with no colon is ignored rather than fatal.
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        match headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => headers.push((name.to_string(), value.to_string())),
        }
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_block(input: &str) -> Result<Vec<u8>> {
        let mut reader = input.as_bytes();
        read_header_block(&mut reader).await
    }

    #[tokio::test]
    async fn reads_until_crlf_crlf() {
        let block = read_block("GET / HTTP/1.1\r\nHost: x\r\n\r\nbody bytes")
            .await
            .unwrap();
        assert_eq!(block, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[tokio::test]
    async fn early_close_is_bad_request() {
        let result = read_block("GET / HTTP/1.1\r\nHost:").await;
        assert!(matches!(
            result,
            Err(AuthError::Http { code: 400, .. })
        ));
    }

    #[tokio::test]
    async fn oversized_headers_rejected() {
        let huge = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(32 * 1024));
        let result = read_block(&huge).await;
        assert!(matches!(
            result,
            Err(AuthError::Http { code: 400, .. })
        ));
    }

    #[tokio::test]
    async fn drain_discards_exact_length() {
        let mut reader: &[u8] = b"0123456789tail";
        drain_body(&mut reader, 10).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"tail");
    }

    #[tokio::test]
    async fn drain_tolerates_early_close() {
        let mut reader: &[u8] = b"abc";
        drain_body(&mut reader, 100).await.unwrap();
    }

    #[test]
    fn parses_request_line_and_headers() {
        let head = parse_head(
            b"get /callback?code=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nAccept: text/html\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/callback?code=1");
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0], ("Host".to_string(), "127.0.0.1".to_string()));
    }

    #[test]
    fn method_is_uppercased_and_restricted() {
        assert_eq!(
            parse_head(b"post / HTTP/1.0\r\n\r\n").unwrap().method,
            "POST"
        );
        let result = parse_head(b"DELETE / HTTP/1.1\r\n\r\n");
        assert!(matches!(
            result,
            Err(AuthError::Http { code: 405, .. })
        ));
    }

    #[test]
    fn short_request_line_rejected() {
        assert!(matches!(
            parse_head(b"GET /\r\n\r\n"),
            Err(AuthError::Http { code: 400, .. })
        ));
        assert!(matches!(
            parse_head(b"NOTHTTP\r\n\r\n"),
            Err(AuthError::Http { code: 400, .. })
        ));
    }

    #[test]
    fn folded_header_appends_with_single_space() {
        let head = parse_head(
            b"GET / HTTP/1.1\r\nX-Long: first part\r\n    second part\r\n\tthird\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            head.headers[0],
            (
                "X-Long".to_string(),
                "first part second part third".to_string()
            )
        );
    }

    #[test]
    fn duplicate_headers_joined_with_comma() {
        let head =
            parse_head(b"GET / HTTP/1.1\r\nAccept: a\r\naccept: b\r\n\r\n").unwrap();
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].1, "a,b");
    }

    #[test]
    fn content_length_parsing() {
        let head =
            parse_head(b"POST / HTTP/1.1\r\nContent-Length: 23\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Some(23));

        let head =
            parse_head(b"POST / HTTP/1.1\r\ncontent-length: nope\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), None);

        let head = parse_head(b"POST / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), None);
    }

    #[test]
    fn header_without_colon_is_skipped() {
        let head = parse_head(b"GET / HTTP/1.1\r\ngarbage line\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0, "Host");
    }
}
