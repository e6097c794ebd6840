//! Embedded pages and static assets served by the callback listener.
//!
//! The browser lands here right after the authorization redirect, so the
//! pages carry no external references: everything they need ships embedded
//! in the binary and is served from the loopback listener itself.

/// MIME for the HTML pages.
pub(crate) const MIME_HTML: &str = "text/html; charset=UTF-8";

/// MIME for `/script.js`.
pub(crate) const MIME_JS: &str = "text/javascript";

/// MIME for `/style.css`.
pub(crate) const MIME_CSS: &str = "text/css";

/// MIME for `/favicon.ico`.
pub(crate) const MIME_ICO: &str = "image/x-icon";

/// The page the browser is redirected to after a successful callback.
///
/// `/callback` answers with a 301 to `/finished` specifically so the URL
/// bar stops showing the authorization code and a refresh cannot replay
/// the callback; this page is the landing spot.
pub(crate) const FINISHED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Authorization complete</title>
    <link rel="stylesheet" href="style.css">
    <script src="script.js" defer></script>
</head>
<body>
    <div class="card">
        <h1>Authorization complete</h1>
        <p>You can close this tab and return to the application.</p>
    </div>
</body>
</html>"#;

/// Stylesheet shared by the finished and error pages.
pub(crate) const STYLE_CSS: &str = r#"body {
    font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
    display: flex;
    justify-content: center;
    align-items: center;
    height: 100vh;
    margin: 0;
    background: #f5f5f5;
    color: #333;
}
.card {
    text-align: center;
    padding: 3rem;
    background: white;
    border-radius: 12px;
    box-shadow: 0 2px 10px rgba(0,0,0,0.08);
    max-width: 32rem;
}
h1 { color: #22c55e; margin-bottom: 0.5rem; }
.card.error h1 { color: #ef4444; }
p { color: #666; white-space: pre-line; }
"#;

/// Small helper script on the finished page. Closing is best-effort; most
/// browsers only let scripts close tabs they opened.
pub(crate) const SCRIPT_JS: &str = r#"setTimeout(function () {
    try { window.close(); } catch (e) { /* leave the tab open */ }
}, 3000);
"#;

/// Embedded favicon so the browser's automatic request does not 404.
pub(crate) const FAVICON_ICO: &[u8] = include_bytes!("assets/favicon.ico");

/// Render the error page for a failed request.
///
/// The message is interpolated as text, never as markup.
pub(crate) fn error_page(code: u16, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Error {code}</title>
    <link rel="stylesheet" href="style.css">
</head>
<body>
    <div class="card error">
        <h1>Error {code}</h1>
        <p>{}</p>
    </div>
</body>
</html>"#,
        escape_html(message)
    )
}

/// Minimal HTML text escaping for error messages.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
