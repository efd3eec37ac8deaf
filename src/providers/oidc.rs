//! Generic OpenID Connect provider: the PKCE login branch.

use anyhow::{Context, Result, anyhow};
use openidconnect::core::{CoreClient, CoreProviderMetadata, CoreResponseType};
use openidconnect::reqwest::async_http_client;
use openidconnect::{
    AuthenticationFlow, AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce,
    OAuth2TokenResponse, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
};

use super::UpstreamIdentity;

#[derive(Clone)]
pub struct OidcProvider {
    client: CoreClient,
}

/// State that must survive the redirect round trip: the PKCE verifier and
/// the nonce used to bind the returned ID token to this specific request.
pub struct PendingAuthorization {
    pub url: String,
    pub csrf_state: String,
    pub pkce_verifier: String,
    pub nonce: String,
}

impl OidcProvider {
    pub async fn discover(
        issuer_url: &str,
        client_id: String,
        client_secret: String,
        redirect_url: String,
    ) -> Result<Self> {
        let issuer = IssuerUrl::new(issuer_url.to_string()).context("invalid issuer URL")?;
        let metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|e| anyhow!("OIDC discovery failed for {issuer_url}: {e}"))?;

        let client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_url).context("invalid redirect URL")?);

        Ok(OidcProvider { client })
    }

    /// Build the authorization URL with PKCE, returning the verifier/nonce
    /// the caller must persist (in login transient state) until the
    /// callback arrives.
    pub fn authorize(&self) -> PendingAuthorization {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (url, csrf_state, nonce) = self
            .client
            .authorize_url(
                AuthenticationFlow::<CoreResponseType>::AuthorizationCode,
                CsrfToken::new_random,
                Nonce::new_random,
            )
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        PendingAuthorization {
            url: url.to_string(),
            csrf_state: csrf_state.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
            nonce: nonce.secret().clone(),
        }
    }

    /// Exchange the authorization code for tokens and resolve the ID
    /// token's claims into an identity.
    pub async fn exchange_and_resolve(&self, code: String, pkce_verifier: String) -> Result<UpstreamIdentity> {
        let token_response = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
            .request_async(async_http_client)
            .await
            .map_err(|e| anyhow!("OIDC code exchange failed: {e}"))?;

        let id_token = token_response
            .extra_fields()
            .id_token()
            .ok_or_else(|| anyhow!("OIDC provider did not return an id_token"))?;

        let verifier = self.client.id_token_verifier();
        let claims = id_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| anyhow!("ID token claims verification failed: {e}"))?;

        Ok(UpstreamIdentity {
            subject: claims.subject().as_str().to_string(),
            email: claims.email().map(|e| e.as_str().to_string()),
            name: claims
                .name()
                .and_then(|n| n.get(None))
                .map(|n| n.as_str().to_string()),
            uid: Some(claims.subject().as_str().to_string()),
            uid_number: None,
            groups: Vec::new(),
        })
    }
}
