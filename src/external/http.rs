//! Thin `reqwest`-based implementations of the external collaborator
//! traits.
//!
//! This is the engine's only concrete network code: it speaks to a
//! content-addressable store and a ledger service over plain HTTP. It
//! does not implement those services — they remain genuinely
//! external — only the client side of the boundary named in §6.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::external::{ContentStore, LedgerClient, LedgerStatus, TypedMessage, Wallet};

const REQUEST_TIMEOUT_SECS: u64 = 30;

fn default_client() -> EngineResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {e}")))
}

/// `Wallet` backed by a remote signing service reachable over HTTP.
///
/// `address` is supplied by the caller at construction time rather
/// than fetched per call: it identifies the session's uploader and
/// does not change across signing requests.
pub struct HttpWallet {
    client: Client,
    base_url: String,
    address: String,
}

impl HttpWallet {
    pub fn new(base_url: impl Into<String>, address: impl Into<String>) -> EngineResult<Self> {
        Ok(Self {
            client: default_client()?,
            base_url: base_url.into(),
            address: address.into(),
        })
    }
}

#[derive(Serialize)]
struct SignRequest<'a> {
    message: &'a TypedMessage,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

#[async_trait::async_trait]
impl Wallet for HttpWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign(&self, message: &TypedMessage) -> EngineResult<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/sign", self.base_url))
            .json(&SignRequest { message })
            .send()
            .await?;
        let response = response.error_for_status()?;
        let parsed: SignResponse = response.json().await?;
        hex::decode(&parsed.signature).map_err(|e| EngineError::Deserialization(e.to_string()))
    }
}

/// `ContentStore` backed by a plain HTTP content-addressable service.
pub struct HttpContentStore {
    client: Client,
    base_url: String,
}

impl HttpContentStore {
    pub fn new(base_url: impl Into<String>) -> EngineResult<Self> {
        Ok(Self {
            client: default_client()?,
            base_url: base_url.into(),
        })
    }
}

#[derive(Deserialize)]
struct PutObjectResponse {
    object_id: String,
}

#[async_trait::async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, bytes: Vec<u8>, hint: Option<String>) -> EngineResult<String> {
        let mut request = self.client.post(format!("{}/objects", self.base_url)).body(bytes);
        if let Some(hint) = hint {
            request = request.header("X-Witness-Hint", hint);
        }

        let response = request.send().await?;
        let response = response.error_for_status()?;
        let parsed: PutObjectResponse = response.json().await?;
        Ok(parsed.object_id)
    }

    async fn get(&self, object_id: &str) -> EngineResult<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/objects/{object_id}", self.base_url))
            .send()
            .await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// `LedgerClient` backed by a plain HTTP ledger service.
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>) -> EngineResult<Self> {
        Ok(Self {
            client: default_client()?,
            base_url: base_url.into(),
        })
    }
}

#[derive(Serialize)]
struct SubmitUpdateRequest {
    session_id: String,
    root: String,
    manifest_ref: Option<String>,
}

#[derive(Deserialize)]
struct SubmitUpdateResponse {
    tx_id: String,
}

#[derive(Deserialize)]
struct InclusionResponse {
    status: String,
}

#[async_trait::async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit_update(
        &self,
        session_id: [u8; 16],
        root: [u8; 32],
        manifest_ref: Option<String>,
    ) -> EngineResult<String> {
        let body = SubmitUpdateRequest {
            session_id: hex::encode(session_id),
            root: hex::encode(root),
            manifest_ref,
        };

        let response = self
            .client
            .post(format!("{}/ledger/updates", self.base_url))
            .json(&body)
            .send()
            .await?;
        let response = response.error_for_status()?;
        let parsed: SubmitUpdateResponse = response.json().await?;
        Ok(parsed.tx_id)
    }

    async fn wait_for_inclusion(&self, tx_id: &str) -> EngineResult<LedgerStatus> {
        let response = self
            .client
            .get(format!("{}/ledger/updates/{tx_id}", self.base_url))
            .send()
            .await?;
        let response = response.error_for_status()?;
        let parsed: InclusionResponse = response.json().await?;

        match parsed.status.as_str() {
            "success" => Ok(LedgerStatus::Success),
            "reverted" => Ok(LedgerStatus::Reverted),
            other => Err(EngineError::Internal(format!(
                "unrecognized ledger inclusion status: {other}"
            ))),
        }
    }
}
