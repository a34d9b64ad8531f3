//! HTTP client for the signin API.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::poll::PollState;
use crate::api::{
    ErrorBody, LogoutState, LogoutView, SigninPayload, SigninView, HEALTHZ_PATH, KUBECONFIG_PATH, LOGOUT_PATH,
    SIGNIN_PATH, STATUS_PATH,
};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::provisioner::ConnectionProfile;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8123";

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

fn transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::timeout("client_timeout", "server did not answer in time").with_cause(e)
    } else {
        AppError::internal("server_unreachable".to_string(), format!("request failed: {}", e)).with_cause(e)
    }
}

/// Turn a non-success response into an `AppError`, keeping the server's code.
async fn error_from(resp: Response) -> AppError {
    let status = resp.status();
    let kind = ErrorKind::from_http_status(status.as_u16());
    match resp.json::<ErrorBody>().await {
        Ok(body) => AppError::new(kind, body.code, body.message),
        Err(_) => AppError::new(kind, format!("http_{}", status.as_u16()), format!("server answered {}", status)),
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> AppResult<T> {
    resp.json::<T>()
        .await
        .map_err(|e| AppError::internal("invalid_response", "server response could not be decoded").with_cause(e))
}

impl ApiClient {
    pub fn new(server: &str, timeout: Duration) -> AppResult<Self> {
        Self::with_headers(server, timeout, HeaderMap::new())
    }

    /// Like `new`, sending `headers` on every request.
    pub fn with_headers(server: &str, timeout: Duration, headers: HeaderMap) -> AppResult<Self> {
        let base = Url::parse(server)
            .map_err(|e| AppError::user("invalid_server".to_string(), format!("server URL {:?}: {}", server, e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::internal("client_setup", "could not build HTTP client").with_cause(e))?;
        Ok(Self { http, base })
    }

    pub fn server(&self) -> &Url { &self.base }

    fn url(&self, path: &str) -> AppResult<Url> {
        self.base
            .join(path)
            .map_err(|e| AppError::user("invalid_server".to_string(), format!("cannot join {}: {}", path, e)))
    }

    /// Submit a signin. The flag is true when a new record was created.
    pub async fn signin(&self, role: Option<&str>) -> AppResult<(SigninView, bool)> {
        let payload = SigninPayload { role: role.map(str::to_string) };
        let resp = self.http.post(self.url(SIGNIN_PATH)?).json(&payload).send().await.map_err(transport_error)?;
        match resp.status() {
            StatusCode::ACCEPTED => Ok((decode(resp).await?, true)),
            StatusCode::OK => Ok((decode(resp).await?, false)),
            _ => Err(error_from(resp).await),
        }
    }

    pub async fn status(&self) -> AppResult<SigninView> {
        let resp = self.http.get(self.url(STATUS_PATH)?).send().await.map_err(transport_error)?;
        if resp.status() != StatusCode::OK {
            return Err(error_from(resp).await);
        }
        decode(resp).await
    }

    /// Fetch a profile; `Pending` while the server still provisions.
    pub async fn kubeconfig(&self) -> AppResult<PollState<ConnectionProfile>> {
        let resp = self.http.get(self.url(KUBECONFIG_PATH)?).send().await.map_err(transport_error)?;
        match resp.status() {
            StatusCode::OK => Ok(PollState::Ready(decode(resp).await?)),
            StatusCode::ACCEPTED => {
                let body: ErrorBody = decode(resp).await?;
                Ok(PollState::Pending(body.message))
            }
            _ => Err(error_from(resp).await),
        }
    }

    pub async fn signout(&self) -> AppResult<LogoutState> {
        let resp = self.http.post(self.url(LOGOUT_PATH)?).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        let view: LogoutView = decode(resp).await?;
        Ok(view.outcome)
    }

    pub async fn health(&self) -> AppResult<()> {
        let resp = self.http.get(self.url(HEALTHZ_PATH)?).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        Ok(())
    }
}
