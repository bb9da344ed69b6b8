//! HTTP client for the agent wire protocol.

use super::backend::{AgentChannel, EnvironmentHandle};
use crate::error::{ErrorKind, Result, SandboxError};
use crate::protocol::{
    CommandRequest, ContentResponse, ErrorBody, ExecResponse, FileRequest, PackageRequest,
    StatusResponse,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Headroom over the command timeout so the agent reports timeouts itself.
const RESPONSE_GRACE: Duration = Duration::from_secs(30);

/// Talks to `warden agent` at the handle's endpoint (`http://host:port/api/v1`).
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(command_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(command_timeout + RESPONSE_GRACE)
            .build()
            .map_err(|e| SandboxError::EnvironmentFault(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    fn url(handle: &EnvironmentHandle, op: &str) -> String {
        format!("{}/{}", handle.endpoint.trim_end_matches('/'), op)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                SandboxError::ChannelUnreachable(format!("invalid agent response: {e}"))
            });
        }

        let text = response.text().await.unwrap_or_default();
        debug!(%status, body = %text, "Agent returned error");
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => SandboxError::Remote {
                kind: body.error_kind.unwrap_or(ErrorKind::EnvironmentFault),
                message: body.detail,
            },
            Err(_) => SandboxError::Remote {
                kind: ErrorKind::EnvironmentFault,
                message: if text.is_empty() {
                    format!("agent returned {status}")
                } else {
                    format!("agent returned {status}: {text}")
                },
            },
        })
    }
}

fn transport_error(err: reqwest::Error) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Remote {
            kind: ErrorKind::Timeout,
            message: format!("agent did not answer in time: {err}"),
        }
    } else {
        SandboxError::ChannelUnreachable(err.to_string())
    }
}

#[async_trait]
impl AgentChannel for HttpAgentClient {
    async fn health(&self, handle: &EnvironmentHandle) -> Result<bool> {
        let response = self
            .http
            .get(Self::url(handle, "health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::ChannelUnreachable(format!("invalid health response: {e}")))?;
        Ok(body.status == "healthy")
    }

    async fn execute(&self, handle: &EnvironmentHandle, command: &str) -> Result<ExecResponse> {
        self.send(
            self.http
                .post(Self::url(handle, "execute"))
                .json(&CommandRequest {
                    command: command.to_string(),
                }),
        )
        .await
    }

    async fn write_file(
        &self,
        handle: &EnvironmentHandle,
        path: &str,
        content: &str,
    ) -> Result<()> {
        let _: StatusResponse = self
            .send(self.http.post(Self::url(handle, "write_file")).json(&FileRequest {
                path: path.to_string(),
                content: content.to_string(),
            }))
            .await?;
        Ok(())
    }

    async fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<String> {
        let body: ContentResponse = self
            .send(
                self.http
                    .get(Self::url(handle, "read_file"))
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(body.content)
    }

    async fn install_package(
        &self,
        handle: &EnvironmentHandle,
        name: &str,
    ) -> Result<ExecResponse> {
        self.send(
            self.http
                .post(Self::url(handle, "install"))
                .json(&PackageRequest {
                    package: name.to_string(),
                }),
        )
        .await
    }

    async fn shutdown(&self, handle: &EnvironmentHandle) -> Result<()> {
        let _: StatusResponse = self
            .send(
                self.http
                    .post(Self::url(handle, "shutdown"))
                    .timeout(HEALTH_TIMEOUT),
            )
            .await?;
        Ok(())
    }
}
