use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_AUTHORIZE_URL: &str = "https://www.dropbox.com";
const DEFAULT_TOKEN_URL: &str = "https://api.dropboxapi.com";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    authorize_base: Url,
    token_base: Url,
    app_key: String,
    app_secret: String,
}

impl OAuthClient {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_urls(DEFAULT_AUTHORIZE_URL, DEFAULT_TOKEN_URL, app_key, app_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_urls(base_url, base_url, app_key, app_secret)
    }

    pub fn with_base_urls(
        authorize_base: &str,
        token_base: &str,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            authorize_base: Url::parse(authorize_base)?,
            token_base: Url::parse(token_base)?,
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        })
    }

    /// Authorization URL for the no-redirect flow: the user copies the code shown by the
    /// provider and pastes it back into the client.
    pub fn authorize_url(&self, state: Option<&str>) -> Result<Url, OAuthError> {
        let mut url = self.authorize_base.join("/oauth2/authorize")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.app_key);
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthToken, OAuthError> {
        let url = self.token_base.join("/oauth2/token")?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.app_key.as_str()),
            ("client_secret", self.app_secret.as_str()),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
