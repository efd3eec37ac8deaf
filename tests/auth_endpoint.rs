//! End-to-end coverage of `GET /auth` over a real router, exercising the
//! credential-extraction precedence and scope enforcement without going
//! through an actual HTTP listener.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gafaelfawr::config::{AuthConfig, GafaelfawrConfig, IssuerConfig, ProviderConfig, ServerConfig, SessionConfig};
use gafaelfawr::issuer::{self, ClaimSet};
use gafaelfawr::providers::github::GithubProvider;
use gafaelfawr::signing::{self, DynSigner};
use gafaelfawr::state::{AppState, Provider};
use gafaelfawr::store::Store;
use tower::ServiceExt;

fn test_config() -> GafaelfawrConfig {
    GafaelfawrConfig {
        issuer: IssuerConfig {
            iss: "https://gafaelfawr.example.com/".to_string(),
            aud_default: "https://example.com/".to_string(),
            aud_internal: "https://internal.example.com/".to_string(),
            signing_key_path: String::new(),
            signing_cert_path: None,
        },
        session: SessionConfig {
            session_ttl_seconds: 3600,
            user_token_ttl_seconds: 3600,
            session_secret: gafaelfawr::crypto::generate_session_secret(),
        },
        provider: ProviderConfig::Github { client_id: "id".to_string(), client_secret: "secret".to_string() },
        auth: AuthConfig { trusted_issuers: vec!["https://gafaelfawr.example.com/".to_string()], ..Default::default() },
        server: ServerConfig { bind_address: "127.0.0.1:0".to_string(), tls_cert: None, tls_key: None },
    }
}

async fn build_state(db_path: &std::path::Path) -> (Arc<AppState>, DynSigner) {
    let config = test_config();
    let pem = signing::generate_keypair_pem().expect("generate test keypair");
    let signer: DynSigner = Arc::new(signing::PemSigner::from_pem(pem.as_bytes(), None).expect("pem signer"));
    let store = Store::with_path(db_path).expect("open store");
    let provider = Provider::Github(GithubProvider::new("id".to_string(), "secret".to_string()));
    let state = Arc::new(AppState::new(config, signer.clone(), store, provider));
    (state, signer)
}

fn sign_token(signer: &DynSigner, iss: &str, aud: &str, scope: &str) -> String {
    let now = 1_700_000_000;
    let claims = ClaimSet {
        sub: "someuser".to_string(),
        iss: iss.to_string(),
        aud: aud.to_string(),
        jti: "test-jti".to_string(),
        scope: scope.to_string(),
        iat: now,
        exp: now + 3600,
        email: Some("someuser@example.com".to_string()),
        uid: Some("someuser".to_string()),
        uid_number: Some("1000".to_string()),
        name: Some("Some User".to_string()),
        is_member_of: None,
        act: None,
        act_nested: None,
    };
    issuer::issue(signer, &claims).expect("sign test token")
}

#[tokio::test]
async fn bearer_token_with_sufficient_scope_returns_200() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("gafaelfawr.db");
    let (state, signer) = build_state(&db_path).await;
    let token = sign_token(&signer, "https://gafaelfawr.example.com/", "https://example.com/", "read:all");

    let router = gafaelfawr::server::service::build_router(state);
    let request = Request::builder()
        .uri("/auth?scope=read:all")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("X-Auth-Request-User").unwrap(), "someuser");
    assert_eq!(headers.get("X-Auth-Request-Email").unwrap(), "someuser@example.com");
    assert_eq!(headers.get("X-Auth-Request-Scopes-Satisfy").unwrap(), "all");
}

#[tokio::test]
async fn missing_credential_returns_401_with_www_authenticate() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("gafaelfawr.db");
    let (state, _signer) = build_state(&db_path).await;

    let router = gafaelfawr::server::service::build_router(state);
    let request = Request::builder().uri("/auth?scope=read:all").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let www_auth = response.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
    assert!(www_auth.starts_with("Bearer realm=\"gafaelfawr\""));
}

#[tokio::test]
async fn insufficient_scope_returns_403_with_scope_headers() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("gafaelfawr.db");
    let (state, signer) = build_state(&db_path).await;
    let token = sign_token(&signer, "https://gafaelfawr.example.com/", "https://example.com/", "read:none");

    let router = gafaelfawr::server::service::build_router(state);
    let request = Request::builder()
        .uri("/auth?scope=exec:admin")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers().get("X-Auth-Request-Token-Scopes").unwrap(), "read:none");
    assert_eq!(response.headers().get("X-Auth-Request-Scopes-Accepted").unwrap(), "exec:admin");
}

#[tokio::test]
async fn repeated_scope_query_parameters_are_unioned() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("gafaelfawr.db");
    let (state, signer) = build_state(&db_path).await;
    let token = sign_token(&signer, "https://gafaelfawr.example.com/", "https://example.com/", "read:all,exec:admin");

    let router = gafaelfawr::server::service::build_router(state);
    let request = Request::builder()
        .uri("/auth?scope=read:all&scope=exec:admin&satisfy=any")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let accepted = response.headers().get("X-Auth-Request-Scopes-Accepted").unwrap().to_str().unwrap();
    assert!(accepted.contains("read:all") && accepted.contains("exec:admin"));
}

#[tokio::test]
async fn untrusted_issuer_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("gafaelfawr.db");
    let (state, signer) = build_state(&db_path).await;
    let token = sign_token(&signer, "https://not-trusted.example.com/", "https://example.com/", "read:all");

    let router = gafaelfawr::server::service::build_router(state);
    let request = Request::builder()
        .uri("/auth?scope=read:all")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
