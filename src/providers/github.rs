//! GitHub OAuth provider, grounded on the `/login` GitHub round trip and the
//! `isMemberOf` fixture in `login_github_test.py`: after the code exchange,
//! the user's teams are fetched and rendered as `org-team` group names.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::{GroupMembership, UpstreamIdentity, normalize_group_name};

pub const SCOPES: &[&str] = &["read:user", "user:email", "read:org"];

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone)]
pub struct GithubProvider {
    pub client_id: String,
    pub client_secret: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
    id: i64,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct GithubTeam {
    slug: String,
    id: i64,
    organization: GithubOrg,
}

#[derive(Deserialize)]
struct GithubOrg {
    login: String,
}

impl GithubProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        GithubProvider {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }

    /// Build the redirect URL that sends the browser to GitHub's consent
    /// screen.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&scope={}&state={}",
            AUTHORIZE_URL,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&SCOPES.join(" ")),
            urlencoding::encode(state),
        )
    }

    /// Exchange the authorization code for an access token, then resolve
    /// the user's identity and team memberships.
    pub async fn exchange_and_resolve(&self, code: &str) -> Result<UpstreamIdentity> {
        let token_resp: AccessTokenResponse = self
            .http
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .context("exchanging GitHub authorization code")?
            .json()
            .await
            .context("parsing GitHub access token response")?;

        self.resolve(&token_resp.access_token).await
    }

    async fn resolve(&self, access_token: &str) -> Result<UpstreamIdentity> {
        let user: GithubUser = self
            .api_get(access_token, "/user")
            .await
            .context("fetching GitHub user profile")?;

        let teams: Vec<GithubTeam> = self
            .api_get(access_token, "/user/teams")
            .await
            .unwrap_or_default();

        let groups = teams
            .into_iter()
            .map(|t| GroupMembership {
                name: normalize_group_name(&format!("{}-{}", t.organization.login, t.slug)),
                id: t.id,
            })
            .collect();

        Ok(UpstreamIdentity {
            subject: user.login.clone(),
            email: user.email,
            name: user.name,
            uid: Some(user.login),
            uid_number: Some(user.id.to_string()),
            groups,
        })
    }

    async fn api_get<T: for<'de> Deserialize<'de>>(&self, access_token: &str, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{API_BASE}{path}"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("User-Agent", "gafaelfawr")
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("GitHub API {} returned {}", path, resp.status());
        }
        Ok(resp.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_includes_scopes_and_state() {
        let provider = GithubProvider::new("client-id".into(), "secret".into());
        let url = provider.authorization_url("state-xyz");
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("client_id=client-id"));
        assert!(url.contains("state=state-xyz"));
        assert!(url.contains("read%3Auser"));
    }
}
