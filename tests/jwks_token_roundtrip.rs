//! Round-trips a token through signing, the well-known JWKS document, and
//! verification, matching the path a real deployment takes when a token it
//! minted comes back in as a bearer credential.

use std::sync::Arc;

use gafaelfawr::issuer::{self, ClaimSet};
use gafaelfawr::signing::{self, DynSigner};
use gafaelfawr::verifier::{self, JwksCache};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_claims(iss: &str, aud: &str, scope: &str) -> ClaimSet {
    ClaimSet {
        sub: "someuser".to_string(),
        iss: iss.to_string(),
        aud: aud.to_string(),
        jti: "test-jti".to_string(),
        scope: scope.to_string(),
        iat: 1_700_000_000,
        exp: 1_700_003_600,
        email: Some("someuser@example.com".to_string()),
        uid: Some("someuser".to_string()),
        uid_number: Some("1000".to_string()),
        name: Some("Some User".to_string()),
        is_member_of: None,
        act: None,
        act_nested: None,
    }
}

#[tokio::test]
async fn signed_token_verifies_against_issuer_jwks() {
    let pem = signing::generate_keypair_pem().expect("generate keypair");
    let signer: DynSigner = Arc::new(signing::PemSigner::from_pem(pem.as_bytes(), None).expect("pem signer"));

    let mock_server = MockServer::start().await;
    let jwks = signer.jwks();
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(&mock_server)
        .await;

    let claims = test_claims(&mock_server.uri(), "https://example.com/", "read:all");
    let token = issuer::issue(&signer, &claims).expect("sign token");

    let cache = JwksCache::new(reqwest::Client::new());
    let verified = verifier::verify(&cache, &token, &[mock_server.uri()], "https://example.com/")
        .await
        .expect("verify token");

    assert_eq!(verified.get("sub").and_then(|v| v.as_str()), Some("someuser"));
    assert_eq!(verified.get("scope").and_then(|v| v.as_str()), Some("read:all"));
}

#[tokio::test]
async fn verification_rejects_untrusted_issuer() {
    let pem = signing::generate_keypair_pem().expect("generate keypair");
    let signer: DynSigner = Arc::new(signing::PemSigner::from_pem(pem.as_bytes(), None).expect("pem signer"));
    let claims = test_claims("https://rogue-idp.example.com/", "https://example.com/", "read:all");
    let token = issuer::issue(&signer, &claims).expect("sign token");

    let cache = JwksCache::new(reqwest::Client::new());
    let result = verifier::verify(&cache, &token, &["https://trusted.example.com/".to_string()], "https://example.com/").await;

    assert!(matches!(result, Err(verifier::VerifyError::UnknownIssuer(_))));
}

#[tokio::test]
async fn verification_rejects_audience_mismatch() {
    let pem = signing::generate_keypair_pem().expect("generate keypair");
    let signer: DynSigner = Arc::new(signing::PemSigner::from_pem(pem.as_bytes(), None).expect("pem signer"));

    let mock_server = MockServer::start().await;
    let jwks = signer.jwks();
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(&mock_server)
        .await;

    let claims = test_claims(&mock_server.uri(), "https://wrong-audience.example.com/", "read:all");
    let token = issuer::issue(&signer, &claims).expect("sign token");

    let cache = JwksCache::new(reqwest::Client::new());
    let result = verifier::verify(&cache, &token, &[mock_server.uri()], "https://example.com/").await;

    assert!(matches!(result, Err(verifier::VerifyError::AudienceMismatch)));
}
