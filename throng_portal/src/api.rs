//! Thin client of the budget portal HTTP API.
//!
//! Every call takes the metrics label of the request so that errors read
//! like `GET /api/cases/[id] returned 404 Not Found` regardless of the
//! concrete case ID in the URL, which keeps error tallies small.

use std::{sync::Arc, time::Duration};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Password shared by every seeded portal account.
pub const PASSWORD: &str = "Test1234!";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {label} returned {status}")]
    Status {
        method: Method,
        label: String,
        status: StatusCode,
    },
    #[error("{method} {label} failed")]
    Transport {
        method: Method,
        label: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {label} returned an unreadable body")]
    Decode {
        method: Method,
        label: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("login as {email} returned no token")]
    MissingToken { email: String },
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRound {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl BudgetRound {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedCase {
    pub id: String,
}

/// Cheap to clone: the connection pool and base URL are shared.
#[derive(Debug, Clone)]
pub struct PortalApi {
    client: Client,
    base: Arc<str>,
}

impl PortalApi {
    pub fn new(host: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            base: Arc::from(host.trim_end_matches('/')),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base));
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        method: Method,
        label: &str,
    ) -> Result<Response, ApiError> {
        let response = builder.send().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            label: label.to_owned(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                method,
                label: label.to_owned(),
                status,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        response: Response,
        method: Method,
        label: &str,
    ) -> Result<T, ApiError> {
        response.json().await.map_err(|source| ApiError::Decode {
            method,
            label: label.to_owned(),
            source,
        })
    }

    /// Logs in and returns the bearer token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let label = "/api/auth/login";
        let builder = self
            .request(Method::POST, label, None)
            .json(&serde_json::json!({ "email": email, "password": password }));
        let response = self.send(builder, Method::POST, label).await?;
        let login: LoginResponse = Self::decode(response, Method::POST, label).await?;
        if login.token.is_empty() {
            return Err(ApiError::MissingToken {
                email: email.to_owned(),
            });
        }
        Ok(login.token)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        token: Option<&str>,
        path: &str,
        query: &[(&str, String)],
        label: &str,
    ) -> Result<T, ApiError> {
        let builder = self.request(Method::GET, path, token).query(query);
        let response = self.send(builder, Method::GET, label).await?;
        Self::decode(response, Method::GET, label).await
    }

    /// GET whose body is not needed.
    pub async fn get(
        &self,
        token: Option<&str>,
        path: &str,
        query: &[(&str, String)],
        label: &str,
    ) -> Result<(), ApiError> {
        let builder = self.request(Method::GET, path, token).query(query);
        self.send(builder, Method::GET, label).await.map(drop)
    }

    pub async fn put_json<B>(
        &self,
        token: Option<&str>,
        path: &str,
        body: &B,
        label: &str,
    ) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let builder = self.request(Method::PUT, path, token).json(body);
        self.send(builder, Method::PUT, label).await.map(drop)
    }

    pub async fn post_json<B, T>(
        &self,
        token: Option<&str>,
        path: &str,
        body: &B,
        label: &str,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.request(Method::POST, path, token).json(body);
        let response = self.send(builder, Method::POST, label).await?;
        Self::decode(response, Method::POST, label).await
    }

    /// POST whose response body is not needed.
    pub async fn post<B>(
        &self,
        token: Option<&str>,
        path: &str,
        body: &B,
        label: &str,
    ) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let builder = self.request(Method::POST, path, token).json(body);
        self.send(builder, Method::POST, label).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_drops_trailing_slash() {
        let api = PortalApi::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://localhost:8080");
    }

    #[test]
    fn status_error_names_the_request() {
        let error = ApiError::Status {
            method: Method::GET,
            label: "/api/cases/[id]".into(),
            status: StatusCode::NOT_FOUND,
        };
        assert_eq!(error.to_string(), "GET /api/cases/[id] returned 404 Not Found");
    }

    #[test]
    fn only_active_rounds_are_active() {
        let round = |status: Option<&str>| BudgetRound {
            id: "r".into(),
            name: None,
            status: status.map(str::to_owned),
        };
        assert!(round(Some("active")).is_active());
        assert!(!round(Some("closed")).is_active());
        assert!(!round(None).is_active());
    }
}
