use async_trait::async_trait;
use reqwest::Client;
use shared::{
    error::ApiError,
    protocol::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::Credential;

#[derive(Debug, Error)]
pub enum AuthApiError {
    #[error("authentication rejected (status {status})")]
    Rejected {
        status: u16,
        error: Option<ApiError>,
    },
    #[error("authentication request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Outcome of a refresh exchange. The backend may or may not rotate the
/// refresh token.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// The two credential-issuing endpoints of the backend.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthApiError>;
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, AuthApiError>;
}

pub struct HttpAuthApi {
    http: Client,
    api_url: String,
}

impl HttpAuthApi {
    pub fn new(http: Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

async fn rejection(response: reqwest::Response) -> AuthApiError {
    let status = response.status();
    let error = response.json::<ApiError>().await.ok();
    AuthApiError::Rejected {
        status: status.as_u16(),
        error,
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthApiError> {
        let res = self
            .http
            .post(format!("{}/auth/login", self.api_url))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        if !res.status().is_success() {
            warn!(status = res.status().as_u16(), "auth: login rejected");
            return Err(rejection(res).await);
        }
        let body: LoginResponse = res.json().await?;
        debug!("auth: login succeeded");
        Ok(Credential::new(body.access_token, body.refresh_token))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, AuthApiError> {
        let res = self
            .http
            .post(format!("{}/auth/refresh", self.api_url))
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await?;
        if !res.status().is_success() {
            warn!(status = res.status().as_u16(), "auth: refresh rejected");
            return Err(rejection(res).await);
        }
        let body: RefreshResponse = res.json().await?;
        Ok(RefreshGrant {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }
}
