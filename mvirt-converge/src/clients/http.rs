//! HTTP client for the machine control service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{ClientError, MachineClient};
use crate::batch::{BatchReceipt, OperationBatch};
use crate::error::{ConvergeError, Result};
use crate::model::{CommandOutput, MachineSnapshot, PowerOperation, SystemUsage};

/// How requests authenticate against the service.
#[derive(Debug, Clone)]
pub enum Credentials {
    ApiKey(String),
    Bearer(String),
}

#[derive(Serialize)]
struct PowerRequest {
    operation: PowerOperation,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
}

/// [`MachineClient`] over the service's REST API.
pub struct HttpMachineClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl HttpMachineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConvergeError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(Credentials::ApiKey(key)) => request.header("X-Api-Key", key),
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        subject: &str,
        request: RequestBuilder,
    ) -> std::result::Result<Response, ClientError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(subject = %subject, status = %status, "Request failed");
        Err(match status {
            StatusCode::NOT_FOUND => ClientError::NotFound(subject.to_string()),
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                ClientError::Unavailable(format!("{} ({})", status, body))
            }
            _ => ClientError::Rejected {
                status: status.as_u16(),
                message: body,
            },
        })
    }

    async fn json<T: DeserializeOwned + Default>(
        response: Response,
    ) -> std::result::Result<T, ClientError> {
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_decode() {
        ClientError::Decode(e.to_string())
    } else {
        ClientError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl MachineClient for HttpMachineClient {
    async fn observe(&self, id: &str) -> std::result::Result<MachineSnapshot, ClientError> {
        debug!(id = %id, "GET machine");
        let request = self.client.get(self.url(&format!("/machines/{}", id)));
        let response = self.send(id, request).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn apply_batch(
        &self,
        id: &str,
        batch: &OperationBatch,
    ) -> std::result::Result<BatchReceipt, ClientError> {
        debug!(id = %id, operations = batch.len(), "PUT machine set");
        let request = self
            .client
            .put(self.url(&format!("/machines/{}/set", id)))
            .json(batch);
        let response = self.send(id, request).await?;
        Self::json(response).await
    }

    async fn set_power(
        &self,
        id: &str,
        op: PowerOperation,
    ) -> std::result::Result<(), ClientError> {
        debug!(id = %id, operation = %op, "PUT machine status");
        let request = self
            .client
            .put(self.url(&format!("/machines/{}/status", id)))
            .json(&PowerRequest { operation: op });
        self.send(id, request).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ClientError> {
        debug!(id = %id, "DELETE machine");
        let request = self.client.delete(self.url(&format!("/machines/{}", id)));
        self.send(id, request).await?;
        Ok(())
    }

    async fn run_command(
        &self,
        id: &str,
        command: &str,
    ) -> std::result::Result<CommandOutput, ClientError> {
        debug!(id = %id, command = %command, "PUT machine execute");
        let request = self
            .client
            .put(self.url(&format!("/machines/{}/execute", id)))
            .json(&ExecuteRequest { command });
        let response = self.send(id, request).await?;
        Self::json(response).await
    }

    async fn system_usage(&self) -> std::result::Result<SystemUsage, ClientError> {
        let request = self.client.get(self.url("/config/hardware"));
        let response = self.send("config/hardware", request).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}
