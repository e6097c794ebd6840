//! Loopback HTTP callback listener.
//!
//! When the authorization server redirects the browser back to the client,
//! the redirect has to land somewhere on the user's machine. This module
//! provides that somewhere: a minimal HTTP server bound to a loopback
//! address that accepts the one redirect, raises a callback event with the
//! absolute request URI, and serves a small embedded help surface so the
//! browser tab the user is left with looks finished rather than broken.
//!
//! The listener runs an accept loop on its own task and handles each
//! connection on another, so a stalled or malicious connection never blocks
//! the redirect. All request handling failures are converted to HTTP error
//! responses; nothing a peer sends can take the listener down.
//!
//! Plaintext on loopback is intentional: the traffic never leaves the
//! device, and native apps have no workable way to provision a TLS
//! certificate the browser would accept.

mod pages;
mod request;

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AuthError, Result};

/// How long a single connection may take from accept to response.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A callback subscriber. Receives the absolute redirect URI.
type CallbackHandler = Arc<dyn Fn(&Url) + Send + Sync>;

/// A request subscriber; may populate the event to override routing.
type RequestHandler = Arc<dyn Fn(&mut RequestEvent) + Send + Sync>;

/// A request the host may answer before default routing applies.
///
/// Handlers that want the request populate a response; the first populated
/// response wins. An untouched event falls through to the built-in routes.
pub struct RequestEvent {
    uri: Url,
    response: Option<(String, Vec<u8>)>,
}

impl RequestEvent {
    /// The absolute URI of the request.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Answer the request with `mime` content.
    pub fn respond(&mut self, mime: &str, body: impl Into<Vec<u8>>) {
        self.response = Some((mime.to_string(), body.into()));
    }

    /// Whether a handler has populated a response.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }
}

/// Subscriber lists, shared read-only with every connection task.
///
/// Locks are held only long enough to push or snapshot; handlers always run
/// outside any lock.
#[derive(Default)]
struct EventHandlers {
    callback: RwLock<Vec<CallbackHandler>>,
    request: RwLock<Vec<RequestHandler>>,
}

/// The loopback redirect listener.
///
/// Bind, subscribe, `start`, open the authorization URL, and wait for the
/// callback event. `stop` (or drop) closes the socket and ends the accept
/// loop; in-flight connections finish or hit their timeout.
pub struct CallbackListener {
    local_addr: SocketAddr,
    socket: Option<TcpListener>,
    handlers: Arc<EventHandlers>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind to `(address, port)`. Port 0 asks the OS for a free port; the
    /// actual endpoint is available from [`CallbackListener::local_addr`].
    ///
    /// # Errors
    ///
    /// [`AuthError::Io`] if `address` is not a loopback address or the bind
    /// fails.
    pub async fn bind(address: IpAddr, port: u16) -> Result<Self> {
        if !address.is_loopback() {
            return Err(AuthError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "callback listener must bind to a loopback address",
            )));
        }

        let socket = TcpListener::bind((address, port)).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "callback listener bound");

        Ok(Self {
            local_addr,
            socket: Some(socket),
            handlers: Arc::new(EventHandlers::default()),
            shutdown: CancellationToken::new(),
            accept_task: None,
        })
    }

    /// The endpoint the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The URI a grant should use as its redirect endpoint.
    pub fn redirect_endpoint(&self) -> String {
        format!("http://{}/callback", self.local_addr)
    }

    /// Subscribe to callback events. Every `/callback` request raises one
    /// event carrying the absolute request URI; distinguishing stale
    /// redirects from the live one is the grant's state check.
    pub fn on_callback(&self, handler: impl Fn(&Url) + Send + Sync + 'static) {
        write_lock(&self.handlers.callback).push(Arc::new(handler));
    }

    /// Subscribe to request events for paths the built-in routing does not
    /// own, or to pre-empt the built-in `/finished` page.
    pub fn on_request(&self, handler: impl Fn(&mut RequestEvent) + Send + Sync + 'static) {
        write_lock(&self.handlers.request).push(Arc::new(handler));
    }

    /// Start the accept loop on a background task.
    ///
    /// # Errors
    ///
    /// [`AuthError::Io`] if the listener was already started.
    pub fn start(&mut self) -> Result<()> {
        let socket = self.socket.take().ok_or_else(|| {
            AuthError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "listener already started",
            ))
        })?;

        let handlers = Arc::clone(&self.handlers);
        let shutdown = self.shutdown.clone();
        let local_addr = self.local_addr;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    accepted = socket.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    },
                };

                tracing::debug!(peer = %peer, "accepted connection");
                let handlers = Arc::clone(&handlers);
                tokio::spawn(async move {
                    let handled = tokio::time::timeout(
                        CONNECTION_TIMEOUT,
                        handle_connection(stream, local_addr, handlers),
                    )
                    .await;
                    if handled.is_err() {
                        tracing::debug!(peer = %peer, "connection timed out");
                    }
                });
            }
            // Dropping the socket here closes it.
            tracing::debug!("accept loop stopped");
        }));

        tracing::info!(addr = %self.local_addr, "callback listener started");
        Ok(())
    }

    /// Stop the accept loop and close the socket.
    ///
    /// In-flight connection handlers finish on their own or hit the
    /// connection timeout; they are not interrupted.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        self.socket = None;
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.local_addr, "callback listener stopped");
    }

    /// Wait for the next callback event, up to `timeout`.
    ///
    /// Returns the absolute redirect URI, or `None` if no callback arrived
    /// in time.
    pub async fn wait_for_callback(&self, timeout: Duration) -> Option<Url> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.on_callback(move |uri| {
            let _ = tx.send(uri.clone());
        });
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        // Stops the accept loop; the task drops the socket.
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackListener")
            .field("local_addr", &self.local_addr)
            .field("started", &self.accept_task.is_some())
            .finish()
    }
}

/// Lock helper that shrugs off poisoning; these locks only ever guard
/// push/snapshot, never user code.
fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

/// Handle one accepted connection end to end.
///
/// Failures become HTTP error responses whose status comes from the error
/// (500 unless the error carries its own code); writing the error response
/// is best-effort.
async fn handle_connection(stream: TcpStream, local_addr: SocketAddr, handlers: Arc<EventHandlers>) {
    let mut reader = BufReader::new(stream);
    if let Err(error) = serve_request(&mut reader, local_addr, &handlers).await {
        let code = error.http_code();
        tracing::debug!(code, error = %error, "request failed");
        let body = pages::error_page(code, &error.to_string());
        let _ = write_response(
            reader.get_mut(),
            code,
            &[("Content-Type", pages::MIME_HTML)],
            body.as_bytes(),
        )
        .await;
    }
}

/// Read, parse, and route a single request.
async fn serve_request(
    reader: &mut BufReader<TcpStream>,
    local_addr: SocketAddr,
    handlers: &EventHandlers,
) -> Result<()> {
    let block = request::read_header_block(reader).await?;
    let head = request::parse_head(&block)?;

    // The body is never inspected, only drained so the peer can read our
    // response cleanly.
    if let Some(length) = head.content_length() {
        request::drain_body(reader, length).await?;
    }

    let base = Url::parse(&format!("http://{local_addr}/"))?;
    let uri = base.join(&head.target).map_err(|_| AuthError::Http {
        code: 400,
        message: format!("bad request target: {}", head.target),
    })?;

    tracing::debug!(method = %head.method, uri = %uri, "routing request");
    route(reader.get_mut(), local_addr, handlers, uri).await
}

/// Dispatch a request URI to the callback event, the host's request
/// handlers, or the built-in routes. Paths match case-insensitively.
async fn route(
    stream: &mut TcpStream,
    local_addr: SocketAddr,
    handlers: &EventHandlers,
    uri: Url,
) -> Result<()> {
    let path = uri.path().to_ascii_lowercase();

    if path == "/callback" {
        // Snapshot under a short read lock, notify outside of it.
        for handler in read_snapshot(&handlers.callback) {
            handler(&uri);
        }
        tracing::info!("authorization callback received");

        // Redirect so the URL bar stops showing the authorization code and
        // a refresh cannot replay the callback.
        let location = format!("http://{local_addr}/finished");
        return write_response(
            stream,
            301,
            &[("Location", &location), ("Content-Type", pages::MIME_HTML)],
            b"",
        )
        .await;
    }

    let mut event = RequestEvent {
        uri,
        response: None,
    };
    for handler in read_snapshot(&handlers.request) {
        handler(&mut event);
        if event.is_handled() {
            break;
        }
    }
    if let Some((mime, body)) = event.response {
        return write_response(stream, 200, &[("Content-Type", &mime)], &body).await;
    }

    match path.as_str() {
        "/finished" => {
            write_response(
                stream,
                200,
                &[("Content-Type", pages::MIME_HTML)],
                pages::FINISHED_HTML.as_bytes(),
            )
            .await
        }
        "/script.js" => {
            write_response(
                stream,
                200,
                &[("Content-Type", pages::MIME_JS)],
                pages::SCRIPT_JS.as_bytes(),
            )
            .await
        }
        "/style.css" => {
            write_response(
                stream,
                200,
                &[("Content-Type", pages::MIME_CSS)],
                pages::STYLE_CSS.as_bytes(),
            )
            .await
        }
        "/favicon.ico" => {
            write_response(
                stream,
                200,
                &[("Content-Type", pages::MIME_ICO)],
                pages::FAVICON_ICO,
            )
            .await
        }
        _ => Err(AuthError::Http {
            code: 404,
            message: format!("no such path: {path}"),
        }),
    }
}

/// Write a complete HTTP/1.0 response.
async fn write_response<W>(
    stream: &mut W,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.0 {status} {}\r\n", reason(status));
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
