use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::eventsub::proto::{
    Condition, CreateSubscriptionBody, SubscriptionListMsg, TransportMsg,
};
use crate::eventsub::registry::Subscription;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const SUBSCRIPTIONS_PATH: &str = "/eventsub/subscriptions";
pub const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";
/// Twitch CLI mock server (`twitch event websocket start-server`).
pub const LOCAL_HELIX_BASE_URL: &str = "http://127.0.0.1:8080";
pub const OAUTH_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HelixDefaults;

impl HelixDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct HelixClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for HelixClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HelixDefaults::CONNECT_TIMEOUT,
            attempt_timeout: HelixDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::helix(),
        }
    }
}

/// What the application asks to be notified about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionRequest {
    pub event_type: String,
    pub version: String,
    pub condition: Condition,
}

impl SubscriptionRequest {
    pub fn new(event_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            version: version.into(),
            condition: Condition::new(),
        }
    }

    /// Adds one condition entry, e.g. `("broadcaster_user_id", "1337")`.
    pub fn condition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.condition.insert(key.into(), value.into());
        self
    }
}

/// Subscription management calls the EventSub client depends on.
///
/// Implementations must be safe to retry: the client may call
/// `create_subscription` again for the same request after a hard reconnect.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create_subscription(
        &self,
        credential: &SecretString,
        request: &SubscriptionRequest,
        session_id: &str,
    ) -> Result<Subscription, HelixError>;

    async fn delete_subscription(
        &self,
        credential: &SecretString,
        subscription_id: &str,
    ) -> Result<(), HelixError>;
}

/// Result of `GET /oauth2/validate`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TokenValidation {
    pub client_id: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Seconds until expiry; `0` for legacy apps exempt from expiration.
    pub expires_in: u64,
}

/// Minimal Helix REST client covering EventSub subscription management.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    client_id: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    local: bool,
    base_url_override: Option<String>,
    validate_url: String,
}

impl HelixClient {
    pub fn new(client_id: impl Into<String>) -> Result<Self, HelixError> {
        Self::with_options(client_id, HelixClientOptions::default())
    }

    pub fn with_options(
        client_id: impl Into<String>,
        options: HelixClientOptions,
    ) -> Result<Self, HelixError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(HelixError::Transport)?;

        Ok(Self {
            http,
            client_id: client_id.into(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            local: false,
            base_url_override: None,
            validate_url: OAUTH_VALIDATE_URL.to_string(),
        })
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit Helix base URL; takes precedence over local mode.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url_override = Some(base_url.trim_end_matches('/').to_string());
        self
    }

    /// Overrides the token validation URL.
    pub fn with_validate_url(mut self, url: impl Into<String>) -> Self {
        self.validate_url = url.into();
        self
    }

    /// Checks that `credential` is still accepted by the identity service.
    pub async fn validate_token(
        &self,
        credential: &SecretString,
    ) -> Result<TokenValidation, HelixError> {
        let body = retry_async(
            &self.retry_policy,
            |_| async move {
                let request = self
                    .http
                    .get(&self.validate_url)
                    .timeout(self.attempt_timeout)
                    .header(
                        "Authorization",
                        format!("OAuth {}", credential.expose_secret()),
                    );
                send_attempt(request).await
            },
            HelixError::is_retryable,
        )
        .await?;

        debug!(event = "helix_token_validated");
        serde_json::from_str(&body).map_err(|err| HelixError::Parse(err.to_string()))
    }

    fn subscriptions_url(&self) -> String {
        format!("{}{}", self.base_url(), SUBSCRIPTIONS_PATH)
    }

    fn base_url(&self) -> &str {
        if let Some(base_url) = self.base_url_override.as_deref() {
            return base_url;
        }
        if self.local {
            LOCAL_HELIX_BASE_URL
        } else {
            HELIX_BASE_URL
        }
    }
}

#[async_trait]
impl SubscriptionApi for HelixClient {
    async fn create_subscription(
        &self,
        credential: &SecretString,
        request: &SubscriptionRequest,
        session_id: &str,
    ) -> Result<Subscription, HelixError> {
        let url = self.subscriptions_url();
        let body = CreateSubscriptionBody {
            event_type: request.event_type.clone(),
            version: request.version.clone(),
            condition: request.condition.clone(),
            transport: TransportMsg::websocket(session_id),
        };

        debug!(
            event = "helix_create_subscription",
            subscription_type = %request.event_type,
            version = %request.version,
        );

        let response = retry_async(
            &self.retry_policy,
            |_| {
                let builder = self
                    .http
                    .post(&url)
                    .timeout(self.attempt_timeout)
                    .header("Client-Id", &self.client_id)
                    .bearer_auth(credential.expose_secret())
                    .json(&body);
                send_attempt(builder)
            },
            HelixError::is_retryable,
        )
        .await?;

        parse_created_subscription(&response)
    }

    async fn delete_subscription(
        &self,
        credential: &SecretString,
        subscription_id: &str,
    ) -> Result<(), HelixError> {
        let url = self.subscriptions_url();
        let result = retry_async(
            &self.retry_policy,
            |_| {
                let builder = self
                    .http
                    .delete(&url)
                    .query(&[("id", subscription_id)])
                    .timeout(self.attempt_timeout)
                    .header("Client-Id", &self.client_id)
                    .bearer_auth(credential.expose_secret());
                send_attempt(builder)
            },
            HelixError::is_retryable,
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            // A retried delete whose first attempt went through answers 404.
            Err(HelixError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn send_attempt(builder: reqwest::RequestBuilder) -> Result<String, HelixError> {
    let response = builder.send().await.map_err(HelixError::Transport)?;
    let status = response.status();
    let body = response.text().await.map_err(HelixError::Transport)?;

    if !status.is_success() {
        return Err(HelixError::from_status(status, &body));
    }
    Ok(body)
}

#[derive(Debug, Error)]
pub enum HelixError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("unauthorized: {body}")]
    Unauthorized { body: String },

    #[error("forbidden, missing authorization for this subscription: {body}")]
    Forbidden { body: String },

    #[error("bad request: {body}")]
    BadRequest { body: String },

    #[error("not found: {body}")]
    NotFound { body: String },

    #[error("subscription already exists: {body}")]
    Conflict { body: String },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl HelixError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let body = summarize_error_body(body);
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized { body },
            StatusCode::FORBIDDEN => Self::Forbidden { body },
            StatusCode::BAD_REQUEST => Self::BadRequest { body },
            StatusCode::NOT_FOUND => Self::NotFound { body },
            StatusCode::CONFLICT => Self::Conflict { body },
            status => Self::HttpStatus { status, body },
        }
    }
}

fn parse_created_subscription(body: &str) -> Result<Subscription, HelixError> {
    let list: SubscriptionListMsg =
        serde_json::from_str(body).map_err(|err| HelixError::Parse(err.to_string()))?;
    list.data
        .into_iter()
        .next()
        .map(Subscription::from)
        .ok_or_else(|| HelixError::Parse("subscription response has empty data".to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match (parsed.error, parsed.message) {
            (Some(error), Some(message)) if !message.is_empty() => {
                return format!("{error}: {message}")
            }
            (_, Some(message)) if !message.is_empty() => return message,
            (Some(error), _) => return error,
            _ => {}
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{
        parse_created_subscription, summarize_error_body, HelixClient, HelixError,
        SubscriptionRequest, HELIX_BASE_URL, LOCAL_HELIX_BASE_URL,
    };
    use crate::eventsub::registry::SubscriptionStatus;

    #[test]
    fn parses_first_subscription_from_create_response() {
        let body = r#"{
            "data": [{
                "id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
                "status": "enabled",
                "type": "channel.follow",
                "version": "2",
                "condition": {"broadcaster_user_id": "1337", "moderator_user_id": "1337"},
                "created_at": "2019-11-16T10:11:12.634234626Z",
                "transport": {"method": "websocket", "session_id": "S1"},
                "cost": 1
            }],
            "total": 1,
            "total_cost": 1,
            "max_total_cost": 10000
        }"#;

        let subscription = parse_created_subscription(body).expect("parse");
        assert_eq!(subscription.id, "f1c2a387-161a-49f9-a165-0f21d7a4e1c4");
        assert_eq!(subscription.status, SubscriptionStatus::Enabled);
        assert_eq!(subscription.cost, 1);
        assert_eq!(
            subscription.condition.get("broadcaster_user_id").map(String::as_str),
            Some("1337")
        );
    }

    #[test]
    fn empty_create_response_is_a_parse_error() {
        let err = parse_created_subscription(r#"{"data":[]}"#).expect_err("empty");
        assert!(matches!(err, HelixError::Parse(_)));
    }

    #[test]
    fn status_mapping_distinguishes_auth_and_retryable_failures() {
        let unauthorized = HelixError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error":"Unauthorized","status":401,"message":"Invalid OAuth token"}"#,
        );
        match &unauthorized {
            HelixError::Unauthorized { body } => {
                assert_eq!(body, "Unauthorized: Invalid OAuth token")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!unauthorized.is_retryable());

        assert!(matches!(
            HelixError::from_status(StatusCode::CONFLICT, "{}"),
            HelixError::Conflict { .. }
        ));
        assert!(HelixError::from_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(HelixError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!HelixError::from_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn error_body_snippet_is_truncated() {
        let body = "x".repeat(1000);
        assert_eq!(summarize_error_body(&body).len(), 220);
    }

    #[test]
    fn request_builder_collects_condition() {
        let request = SubscriptionRequest::new("channel.follow", "2")
            .condition("broadcaster_user_id", "1337")
            .condition("moderator_user_id", "1337");
        assert_eq!(request.condition.len(), 2);
    }

    #[test]
    fn base_url_resolution_prefers_override() {
        let client = HelixClient::new("client-id").expect("client");
        assert_eq!(client.base_url(), HELIX_BASE_URL);

        let client = client.with_local_mode(true);
        assert_eq!(client.base_url(), LOCAL_HELIX_BASE_URL);

        let client = client.with_base_url("http://127.0.0.1:9999/helix/");
        assert_eq!(
            client.subscriptions_url(),
            "http://127.0.0.1:9999/helix/eventsub/subscriptions"
        );
    }
}
