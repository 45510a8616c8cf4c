use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::error::ApiError;
use tracing::{debug, warn};

use crate::{
    error::{RefreshError, SessionError},
    refresh::RefreshCoordinator,
};

/// An authenticated REST call, kept as data so it can be replayed once
/// after a credential refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Wraps every outbound API call with the current access credential and a
/// single refresh-and-replay on authorization failure.
pub struct RequestGateway {
    http: Client,
    api_url: String,
    coordinator: Arc<RefreshCoordinator>,
}

impl RequestGateway {
    pub fn new(http: Client, api_url: impl Into<String>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    /// Dispatches `request`. Non-401 responses are returned as-is; a 401
    /// triggers one refresh and one replay, and a second 401 is
    /// `AuthExpired`.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, SessionError> {
        let credential = self
            .coordinator
            .store()
            .get()
            .ok_or(SessionError::NotAuthenticated)?;

        let res = self.dispatch(request, &credential.access_token).await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        debug!(method = %request.method, path = %request.path, "gateway: authorization rejected, refreshing");
        let refreshed = match self.coordinator.ensure_fresh(&credential).await {
            Ok(refreshed) => refreshed,
            Err(RefreshError::NoCredential) => return Err(SessionError::NotAuthenticated),
            Err(RefreshError::Cancelled) => return Err(SessionError::Closed),
            Err(err) => return Err(SessionError::RefreshFailed(err)),
        };

        let retry = self.dispatch(request, &refreshed.access_token).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(method = %request.method, path = %request.path, "gateway: rejected again after refresh");
            return Err(SessionError::AuthExpired);
        }
        Ok(retry)
    }

    /// `send`, then decode a 2xx JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, SessionError> {
        let res = self.send(request).await?;
        let status = res.status();
        if !status.is_success() {
            let error = res.json::<ApiError>().await.ok();
            return Err(SessionError::Http {
                status: status.as_u16(),
                error,
            });
        }
        Ok(res.json().await?)
    }

    async fn dispatch(&self, request: &ApiRequest, access_token: &str) -> Result<Response, SessionError> {
        let mut builder = self
            .http
            .request(request.method.clone(), format!("{}{}", self.api_url, request.path))
            .bearer_auth(access_token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}
