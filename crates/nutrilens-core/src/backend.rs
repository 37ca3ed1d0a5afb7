use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{NutriLensError, Result};
use crate::model::{FoodLogEntry, FoodLogRecord, NutritionInsights, User};

/// HTTP client for the food-log CRUD API and its auth endpoints.
///
/// Holds no credentials. Authenticated calls take the bearer token as an
/// argument so every request uses the token current at send time.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl BackendClient {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| NutriLensError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `POST /login` and return the issued bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let body = Credentials { username, password };
        let resp = self.http.post(self.url("login")).json(&body).send().await?;
        let login: LoginResponse = decode(resp, "login").await?;
        login
            .token
            .or(login.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NutriLensError::MalformedResponse("login response has no token".into()))
    }

    /// `POST /register`. A 409 means the username or email is taken.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let body = Registration {
            username,
            email,
            password,
        };
        let resp = self
            .http
            .post(self.url("register"))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(NutriLensError::UserAlreadyExists);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NutriLensError::from_status(status, text));
        }
        tracing::info!(username, "registered");
        Ok(())
    }

    pub async fn fetch_profile(&self, token: &str) -> Result<User> {
        let resp = self
            .http
            .get(self.url("user-profile"))
            .bearer_auth(token)
            .send()
            .await?;
        decode(resp, "user-profile").await
    }

    pub async fn fetch_food_logs(&self, token: &str) -> Result<Vec<FoodLogRecord>> {
        let resp = self
            .http
            .get(self.url("food-logs"))
            .bearer_auth(token)
            .send()
            .await?;
        decode(resp, "food-logs").await
    }

    pub async fn create_food_log(&self, token: &str, entry: &FoodLogEntry) -> Result<()> {
        let record = FoodLogRecord::from(entry);
        let resp = self
            .http
            .post(self.url("food-logs"))
            .bearer_auth(token)
            .json(&record)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NutriLensError::from_status(status, text));
        }
        tracing::debug!(id = %entry.id, %status, "food log persisted");
        Ok(())
    }

    pub async fn fetch_insights(&self, token: &str) -> Result<NutritionInsights> {
        let resp = self
            .http
            .get(self.url("insights"))
            .bearer_auth(token)
            .send()
            .await?;
        decode(resp, "insights").await
    }
}

/// Check status, then decode the body as `R`, keeping a preview of the body
/// on decode failures.
pub(crate) async fn decode<R: DeserializeOwned>(resp: reqwest::Response, endpoint: &str) -> Result<R> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        tracing::debug!(endpoint, %status, "request rejected");
        return Err(NutriLensError::from_status(status, body));
    }

    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        NutriLensError::MalformedResponse(format!(
            "failed to decode {endpoint} response: {e}\nBody: {preview}"
        ))
    })
}

// -- Request/Response types --

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct Registration<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let config = BackendConfig {
            base_url: "http://localhost:8080/".into(),
            ..Default::default()
        };
        let client = BackendClient::from_config(&config).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("food-logs"), "http://localhost:8080/food-logs");
        assert_eq!(client.url("/login"), "http://localhost:8080/login");
    }

    #[test]
    fn test_login_response_shapes() {
        let a: LoginResponse = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(a.token.as_deref(), Some("abc"));
        let b: LoginResponse = serde_json::from_str(r#"{"access_token":"xyz"}"#).unwrap();
        assert_eq!(b.access_token.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_debug_hides_client_internals() {
        let client = BackendClient::from_config(&BackendConfig::default()).unwrap();
        let dbg = format!("{client:?}");
        assert!(dbg.contains("localhost:8080"));
    }
}
