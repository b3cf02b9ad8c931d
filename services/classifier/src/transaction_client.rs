use crate::config::Config;
use crate::documents::TransactionPayload;
use crate::error::CallFailureKind;
use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Step of the upsert a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStage {
    Login,
    Check,
    Create,
    Update,
}

impl UpsertStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertStage::Login => "login",
            UpsertStage::Check => "check",
            UpsertStage::Create => "create",
            UpsertStage::Update => "update",
        }
    }
}

impl fmt::Display for UpsertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("transaction {stage} failed: {kind}: {detail}")]
pub struct UpsertError {
    pub stage: UpsertStage,
    pub kind: CallFailureKind,
    pub detail: String,
}

impl UpsertError {
    fn transport(stage: UpsertStage, err: &reqwest::Error) -> Self {
        Self {
            stage,
            kind: CallFailureKind::from_reqwest(err),
            detail: err.to_string(),
        }
    }

    fn status(stage: UpsertStage, status: StatusCode, body: String) -> Self {
        Self {
            stage,
            kind: CallFailureKind::HttpError {
                status: status.as_u16(),
            },
            detail: body,
        }
    }

    fn invalid(stage: UpsertStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind: CallFailureKind::InvalidResponse,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
        }
    }
}

struct LoginSettings {
    url: String,
    email: String,
    password: String,
    timeout: Duration,
}

/// Create-or-update client for the transaction API.
///
/// The existence probe and the write are separate calls, so two runs for
/// the same file id can race between them.
pub struct TransactionClient {
    http: reqwest::Client,
    base_url: Url,
    call_timeout: Duration,
    login: Option<LoginSettings>,
}

impl TransactionClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.transaction_url)
            .with_context(|| format!("Invalid transaction URL: {}", config.transaction_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Transaction URL cannot be a base: {}", config.transaction_url);
        }

        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build transaction HTTP client")?;

        let login = config
            .login_credentials()
            .map(|(url, email, password)| LoginSettings {
                url: url.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                timeout: config.login_timeout(),
            });

        Ok(Self {
            http,
            base_url,
            call_timeout: config.transaction_timeout(),
            login,
        })
    }

    /// Create the record for `payload.file_id` if the API does not know it,
    /// update it otherwise.
    #[instrument(skip(self, payload), fields(file_id = %payload.file_id))]
    pub async fn upsert(&self, payload: &TransactionPayload) -> Result<UpsertOutcome, UpsertError> {
        let result = self.run(payload).await;

        let label = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(e) => e.stage.as_str(),
        };
        metrics::counter!("classifier.transactions", "result" => label).increment(1);

        if let Err(ref e) = result {
            warn!(stage = %e.stage, kind = %e.kind, error = %e.detail, "Transaction upsert failed");
        }
        result
    }

    async fn run(&self, payload: &TransactionPayload) -> Result<UpsertOutcome, UpsertError> {
        let token = match self.login {
            Some(ref login) => Some(self.authenticate(login).await?),
            None => None,
        };
        let token = token.as_deref();
        let record_url = self.record_url(&payload.file_id);

        if self.exists(&record_url, token).await? {
            debug!("Transaction exists, updating");
            let request = self.http.put(record_url).json(payload);
            self.write(request, token, UpsertStage::Update).await?;
            info!("Transaction updated");
            Ok(UpsertOutcome::Updated)
        } else {
            debug!("Transaction absent, creating");
            let request = self.http.post(self.base_url.clone()).json(payload);
            self.write(request, token, UpsertStage::Create).await?;
            info!("Transaction created");
            Ok(UpsertOutcome::Created)
        }
    }

    fn record_url(&self, file_id: &str) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base URLs
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(file_id);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        let request = request.timeout(self.call_timeout);
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn exists(&self, url: &Url, token: Option<&str>) -> Result<bool, UpsertError> {
        let response = self
            .authorize(self.http.get(url.clone()), token)
            .send()
            .await
            .map_err(|e| UpsertError::transport(UpsertStage::Check, &e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(UpsertError::status(UpsertStage::Check, status, body))
            }
        }
    }

    async fn write(
        &self,
        request: RequestBuilder,
        token: Option<&str>,
        stage: UpsertStage,
    ) -> Result<(), UpsertError> {
        let response = self
            .authorize(request, token)
            .send()
            .await
            .map_err(|e| UpsertError::transport(stage, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(UpsertError::status(stage, status, body))
    }

    async fn authenticate(&self, login: &LoginSettings) -> Result<String, UpsertError> {
        let stage = UpsertStage::Login;
        let response = self
            .http
            .post(&login.url)
            .timeout(login.timeout)
            .json(&json!({
                "emailAddress": login.email,
                "password": login.password,
            }))
            .send()
            .await
            .map_err(|e| UpsertError::transport(stage, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpsertError::status(stage, status, body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpsertError::invalid(stage, format!("login response is not JSON: {e}")))?;

        access_token(&body)
            .map(str::to_string)
            .ok_or_else(|| UpsertError::invalid(stage, "login response carries no accessToken"))
    }
}

fn access_token(body: &Value) -> Option<&str> {
    let nested = if body.get("isSuccess").and_then(Value::as_bool) == Some(true) {
        body.pointer("/data/tokens/accessToken").and_then(Value::as_str)
    } else {
        None
    };

    nested
        .or_else(|| body.get("accessToken").and_then(Value::as_str))
        .filter(|token| !token.is_empty())
}
