//! HTTP client of the operator API.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, Logger};

use crate::error::{Error, Result};
use crate::ops::events::AuditEvent;
use crate::ops::http::WizardInfo;
use crate::ops::operator::Operator;
use crate::ops::{
    AgentReport, Cluster, NewExpandOperation, Operation, OperationKey, OperationState,
    ProgressEntry, Server,
};
use crate::plan::{OperationPlan, PhaseState};

/// Bearer-token client of a wizard or cluster operator endpoint.
pub struct HttpOperator {
    base_url: String,
    token: String,
    client: reqwest::Client,
    logger: Logger,
}

impl HttpOperator {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, logger: Logger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| Error::internal(format!("failed to create HTTP client: {}", err)))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(HttpOperator {
            base_url,
            token: token.into(),
            client,
            logger,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(self.error_from(status, response).await)
    }

    /// Reconstructs the error kind from the JSON body, falling back to the
    /// HTTP status.
    async fn error_from(&self, status: StatusCode, response: Response) -> Error {
        let body = response.text().await.unwrap_or_default();
        if let Ok(err) = serde_json::from_str::<Error>(&body) {
            return err;
        }
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        match status {
            StatusCode::BAD_REQUEST => Error::invalid_argument(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::access_denied(message),
            StatusCode::NOT_FOUND => Error::not_found(message),
            StatusCode::CONFLICT => Error::already_exists(message),
            StatusCode::PRECONDITION_FAILED => Error::compare_failed(message),
            StatusCode::UNPROCESSABLE_ENTITY => Error::aborted(message),
            StatusCode::SERVICE_UNAVAILABLE => Error::connection_problem(message),
            _ => Error::internal(message),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(self.logger, "GET"; "url" => self.url(path));
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        debug!(self.logger, "Request"; "method" => %method, "url" => self.url(path));
        let response = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    /// Wizard discovery: the cluster under installation and its install
    /// operation.
    pub async fn wizard_info(&self) -> Result<WizardInfo> {
        self.get_json("/v1/wizard").await
    }
}

#[tonic::async_trait]
impl Operator for HttpOperator {
    async fn get_cluster(&self) -> Result<Cluster> {
        self.get_json("/v1/cluster").await
    }

    async fn get_install_operation(&self) -> Result<Operation> {
        Ok(self.wizard_info().await?.operation)
    }

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.get_json(&format!("/v1/operations/{}", key.operation_id))
            .await
    }

    async fn create_expand_operation(&self, req: NewExpandOperation) -> Result<Operation> {
        self.send_json(reqwest::Method::POST, "/v1/operations/expand", &req)
            .await
    }

    async fn set_operation_state(&self, key: &OperationKey, state: OperationState) -> Result<()> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/v1/operations/{}/state", key.operation_id),
            &serde_json::json!({ "state": state }),
        )
        .await
    }

    async fn update_expand_servers(&self, key: &OperationKey, servers: Vec<Server>) -> Result<()> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/v1/operations/{}/servers", key.operation_id),
            &servers,
        )
        .await
    }

    async fn delete_operation(&self, key: &OperationKey) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/operations/{}", key.operation_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn get_agent_report(&self, key: &OperationKey) -> Result<AgentReport> {
        self.get_json(&format!("/v1/operations/{}/report", key.operation_id))
            .await
    }

    async fn create_plan(&self, key: &OperationKey, plan: OperationPlan) -> Result<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/v1/operations/{}/plan", key.operation_id),
            &plan,
        )
        .await
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        self.get_json(&format!("/v1/operations/{}/plan", key.operation_id))
            .await
    }

    async fn get_phase_state(&self, key: &OperationKey, phase_id: &str) -> Result<PhaseState> {
        let response = self
            .client
            .get(self.url(&format!("/v1/operations/{}/phase", key.operation_id)))
            .query(&[("phase", phase_id)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn update_phase_state(&self, key: &OperationKey, state: PhaseState) -> Result<()> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/v1/operations/{}/phase", key.operation_id),
            &state,
        )
        .await
    }

    async fn list_phase_states(&self, key: &OperationKey) -> Result<Vec<PhaseState>> {
        self.get_json(&format!("/v1/operations/{}/phases", key.operation_id))
            .await
    }

    async fn create_progress_entry(&self, key: &OperationKey, entry: ProgressEntry) -> Result<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/v1/operations/{}/progress", key.operation_id),
            &entry,
        )
        .await
    }

    async fn get_progress(&self, key: &OperationKey) -> Result<ProgressEntry> {
        self.get_json(&format!("/v1/operations/{}/progress", key.operation_id))
            .await
    }

    async fn emit_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.send_json(reqwest::Method::POST, "/v1/events", &event)
            .await
    }

    async fn stream_operation_logs(&self, key: &OperationKey, data: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/v1/operations/{}/logs", key.operation_id)))
            .bearer_auth(&self.token)
            .body(data)
            .send()
            .await?;
        self.decode(response).await
    }
}
