//! Integration tests for the loopauth crate.
//!
//! These exercise the full authorization flow end to end: a real loopback
//! listener receives the "browser" redirect, the grant validates it, and
//! the code is exchanged against a mock authorization server.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use loopauth::{
    AuthError, AuthorizationGrant, CallbackListener, CancellationToken, CodeChallengeMethod,
    GrantConfig, TokenEndpoint, store,
};
use ring::digest;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn grant_config(token_server: &MockServer, listener: &CallbackListener) -> GrantConfig {
    GrantConfig {
        authorization_endpoint: "https://as.example.org/authorize?tenant=42".to_string(),
        token_endpoint: format!("{}/token", token_server.uri()),
        redirect_endpoint: listener.redirect_endpoint(),
        client_id: "org.example.app".to_string(),
        client_secret: None,
        scope: Some(vec!["scope1".to_string(), "scope2".to_string()]),
        challenge_method: CodeChallengeMethod::S256,
    }
}

/// Simulate the browser hitting the redirect URI the AS would send it to.
async fn browser_redirect(listener: &CallbackListener, query: &str) -> Url {
    let addr = listener.local_addr();
    let wait = listener.wait_for_callback(Duration::from_secs(5));

    let request = format!("GET /callback?{query} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    let send = async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.0 301"));
    };

    let (uri, ()) = tokio::join!(wait, send);
    uri.expect("callback event not raised")
}

fn form_params(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Full authorization flow
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn authorization_code_flow_end_to_end() {
    let token_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{
                "access_token": "issued_access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "issued_refresh"
            }"#,
        ))
        .expect(1)
        .mount(&token_server)
        .await;

    let mut listener = CallbackListener::bind(LOOPBACK, 0).await.unwrap();
    listener.start().unwrap();
    let redirect_endpoint = listener.redirect_endpoint();

    let grant = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();
    let auth_url = grant.authorization_url().unwrap();

    // What the grant sends to the browser.
    let auth_params: HashMap<String, String> = auth_url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert_eq!(auth_params.get("tenant").unwrap(), "42");
    assert_eq!(auth_params.get("response_type").unwrap(), "code");
    assert_eq!(
        auth_params.get("redirect_uri").unwrap(),
        &listener.redirect_endpoint()
    );

    // The S256 challenge really is the hash of the verifier the exchange
    // will later present.
    let expected_challenge = grant.code_verifier().reveal(|verifier| {
        loopauth::base64url::encode(digest::digest(&digest::SHA256, verifier).as_ref())
    });
    assert_eq!(auth_params.get("code_challenge").unwrap(), &expected_challenge);

    // The AS redirects the browser back with code and state.
    let state = grant.state().reveal_str(str::to_string);
    let redirect = browser_redirect(
        &listener,
        &format!("code=authcode_7&state={state}"),
    )
    .await;

    let params = AuthorizationGrant::redirect_params(&redirect);
    let verifier = grant.code_verifier().reveal_str(str::to_string);
    let token = grant
        .exchange(&params, &CancellationToken::new())
        .await
        .unwrap();
    listener.stop().await;

    // The token request carried the grant's exact parameters.
    let requests = token_server.received_requests().await.unwrap();
    let form = form_params(&requests[0].body);
    assert_eq!(form.get("grant_type").unwrap(), "authorization_code");
    assert_eq!(form.get("code").unwrap(), "authcode_7");
    assert_eq!(form.get("client_id").unwrap(), "org.example.app");
    // Bit-exact echo of the redirect endpoint.
    assert_eq!(form.get("redirect_uri").unwrap(), &redirect_endpoint);
    assert_eq!(form.get("code_verifier").unwrap(), &verifier);

    // The response omitted scope, so the requested scope was adopted.
    let scope = token.scope().unwrap();
    assert!(scope.contains("scope1") && scope.contains("scope2"));
    assert_eq!(token.authorization_header(), "Bearer issued_access");
    assert!(token.is_refreshable());
}

// ═══════════════════════════════════════════════════════════════════════
//  Denied authorization
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn denied_authorization_surfaces_server_error() {
    let token_server = MockServer::start().await;
    let mut listener = CallbackListener::bind(LOOPBACK, 0).await.unwrap();
    listener.start().unwrap();

    let grant = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();
    let state = grant.state().reveal_str(str::to_string);

    let redirect = browser_redirect(
        &listener,
        &format!("error=access_denied&error_description=user%20declined&state={state}"),
    )
    .await;
    listener.stop().await;

    let params = AuthorizationGrant::redirect_params(&redirect);
    let result = grant.exchange(&params, &CancellationToken::new()).await;
    match result {
        Err(AuthError::AuthorizationGrant {
            code, description, ..
        }) => {
            assert_eq!(code, loopauth::AuthorizationErrorCode::AccessDenied);
            assert_eq!(description.as_deref(), Some("user declined"));
        }
        other => panic!("expected AuthorizationGrant error, got {other:?}"),
    }

    // Nothing reached the token endpoint.
    assert!(token_server.received_requests().await.unwrap().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Stale redirect
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn redirect_for_another_grant_is_rejected() {
    let token_server = MockServer::start().await;
    let mut listener = CallbackListener::bind(LOOPBACK, 0).await.unwrap();
    listener.start().unwrap();

    let live = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();
    let stale = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();

    // A redirect carrying the stale grant's state must not satisfy the
    // live grant.
    let state = stale.state().reveal_str(str::to_string);
    let redirect = browser_redirect(&listener, &format!("code=abc&state={state}")).await;
    listener.stop().await;

    let params = AuthorizationGrant::redirect_params(&redirect);
    let result = live.exchange(&params, &CancellationToken::new()).await;
    assert!(matches!(result, Err(AuthError::InvalidState)));
    assert!(token_server.received_requests().await.unwrap().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence and refresh
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn exchanged_token_round_trips_through_blob_and_refreshes() {
    let token_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{
                "access_token": "first_access",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "first_refresh",
                "scope": "config"
            }"#,
        ))
        .expect(1)
        .mount(&token_server)
        .await;

    let mut listener = CallbackListener::bind(LOOPBACK, 0).await.unwrap();
    listener.start().unwrap();
    let grant = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();
    let state = grant.state().reveal_str(str::to_string);
    let redirect = browser_redirect(&listener, &format!("code=c&state={state}")).await;
    listener.stop().await;

    let token = grant
        .exchange(
            &AuthorizationGrant::redirect_params(&redirect),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Persist and recover.
    let blob = store::encode_blob(&token).unwrap();
    let restored = store::decode_blob(&blob).unwrap();
    assert_eq!(restored, token);
    assert_eq!(restored.expires_at(), token.expires_at());
    assert_eq!(restored.scope(), token.scope());
    assert_eq!(restored.is_refreshable(), token.is_refreshable());

    // Refresh the recovered token; the server does not rotate the refresh
    // token, so the old material carries forward.
    token_server.reset().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"access_token": "second_access", "token_type": "bearer", "expires_in": 3600}"#,
        ))
        .expect(1)
        .mount(&token_server)
        .await;

    let endpoint =
        TokenEndpoint::new(Url::parse(&format!("{}/token", token_server.uri())).unwrap()).unwrap();
    let refreshed = endpoint
        .refresh(&restored, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(refreshed.authorization_header(), "Bearer second_access");
    refreshed
        .refresh()
        .unwrap()
        .reveal_str(|r| assert_eq!(r, "first_refresh"));
    assert_eq!(refreshed.scope(), restored.scope());

    let requests = token_server.received_requests().await.unwrap();
    let form = form_params(&requests[0].body);
    assert_eq!(form.get("grant_type").unwrap(), "refresh_token");
    assert_eq!(form.get("refresh_token").unwrap(), "first_refresh");
    assert_eq!(form.get("scope").unwrap(), "config");
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancelled_exchange_returns_cancelled() {
    let token_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"access_token": "a", "token_type": "bearer"}"#)
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&token_server)
        .await;

    let mut listener = CallbackListener::bind(LOOPBACK, 0).await.unwrap();
    listener.start().unwrap();
    let grant = AuthorizationGrant::new(grant_config(&token_server, &listener)).unwrap();
    let state = grant.state().reveal_str(str::to_string);
    let redirect = browser_redirect(&listener, &format!("code=c&state={state}")).await;
    listener.stop().await;

    let cancel = CancellationToken::new();
    let redirect_params = AuthorizationGrant::redirect_params(&redirect);
    let exchange = grant.exchange(&redirect_params, &cancel);
    let cancel_soon = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };

    let (result, ()) = tokio::join!(exchange, cancel_soon);
    assert!(matches!(result, Err(AuthError::Cancelled)));
}
