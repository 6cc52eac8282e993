//! Request/response collaborator. The engine only needs success/failure and
//! returned identifiers from it; retry policy is not its concern.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::ChannelId,
    error::{ApiError, ApiException},
    protocol::{GatewayUrlResponse, LoginRequest, LoginResponse, MessageModel, SendMessageRequest},
};

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Exchanges credentials for a token.
    async fn login(&self, email: &str, password: &str) -> Result<String>;
    async fn logout(&self) -> Result<()>;
    async fn gateway_url(&self) -> Result<String>;
    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        nonce: Option<u64>,
    ) -> Result<MessageModel>;
    fn set_token(&self, token: Option<String>);
}

/// [`ProtocolClient`] over HTTP+JSON.
pub struct HttpProtocolClient {
    http: Client,
    api_url: String,
    token: RwLock<Option<String>>,
}

impl HttpProtocolClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .context("failed to decode api response")
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(0, body.trim().to_string()));
    Err(anyhow!(ApiException::from_body(status.as_u16(), api_error)))
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn login(&self, email: &str, password: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.api_url))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("login request failed")?;
        let body: LoginResponse = Self::decode(response).await?;
        Ok(body.token)
    }

    async fn logout(&self) -> Result<()> {
        let response = self
            .authorized(self.http.post(format!("{}/auth/logout", self.api_url)))
            .send()
            .await
            .context("logout request failed")?;
        check_status(response).await?;
        Ok(())
    }

    async fn gateway_url(&self) -> Result<String> {
        let response = self
            .authorized(self.http.get(format!("{}/gateway", self.api_url)))
            .send()
            .await
            .context("gateway request failed")?;
        let body: GatewayUrlResponse = Self::decode(response).await?;
        Ok(body.url)
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        nonce: Option<u64>,
    ) -> Result<MessageModel> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/channels/{}/messages", self.api_url, channel_id.0)),
            )
            .json(&SendMessageRequest {
                content: content.to_string(),
                nonce: nonce.map(|nonce| nonce.to_string()),
            })
            .send()
            .await
            .with_context(|| format!("send message request failed for channel {}", channel_id.0))?;
        Self::decode(response).await
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
