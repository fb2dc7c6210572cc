use crate::types::{
    Address,
    Wei,
};
use reqwest::StatusCode;
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::time;
use tracing::debug;

/// EIP-1193 "user rejected the request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("provider responded with {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Rpc(RpcError),
}

/// The `error` member of a JSON-RPC response.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn is_user_rejection(&self) -> bool {
        self.code == USER_REJECTED_CODE
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code == METHOD_NOT_FOUND_CODE
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = parse_bytes(&raw).map_err(serde::de::Error::custom)?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("transaction hash must be 32 bytes"))?;
        Ok(Self(hash))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    #[serde(default)]
    status: Option<String>,
    block_number: Option<String>,
    #[serde(default)]
    gas_used: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Receipt {
    pub succeeded: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// Call or transaction parameters for `eth_call` / `eth_sendTransaction`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub value: Option<Wei>,
    pub gas: Option<u64>,
    pub gas_price: Option<u128>,
}

impl TransactionRequest {
    pub fn to_json(&self) -> Value {
        let mut object = json!({
            "from": self.from.to_string(),
            "to": self.to.to_string(),
            "data": bytes_hex(&self.data),
        });
        if let Some(value) = self.value {
            object["value"] = Value::String(quantity(value));
        }
        if let Some(gas) = self.gas {
            object["gas"] = Value::String(quantity(u128::from(gas)));
        }
        if let Some(gas_price) = self.gas_price {
            object["gasPrice"] = Value::String(quantity(gas_price));
        }
        object
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl BlockTag {
    fn to_json(self) -> Value {
        match self {
            BlockTag::Latest => Value::String("latest".to_string()),
            BlockTag::Number(n) => Value::String(quantity(u128::from(n))),
        }
    }
}

/// JSON-RPC client for an account-managing Ethereum provider.
pub struct Provider {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").field("url", &self.url).finish()
    }
}

impl Provider {
    pub fn new(url: impl Into<String>) -> Result<Self, ProviderError> {
        let url = url.into();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| ProviderError::Transport {
                url: url.clone(),
                source,
            })?;
        Ok(Self {
            url,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(%method, id, "rpc request");
        let res = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                url: self.url.clone(),
                source,
            })?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|source| ProviderError::Transport {
            url: self.url.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        let response: RpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::InvalidResponse(format!("{method}: {e}")))?;
        if let Some(error) = response.error {
            return Err(ProviderError::Rpc(error));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| ProviderError::InvalidResponse(format!("{method}: {e}")))
    }

    /// Asks the provider for account access, falling back to `eth_accounts`
    /// on providers that do not implement `eth_requestAccounts`.
    pub async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
        match self.request("eth_requestAccounts", json!([])).await {
            Err(ProviderError::Rpc(err)) if err.is_method_not_found() => {
                debug!("eth_requestAccounts unsupported; using eth_accounts");
                self.request("eth_accounts", json!([])).await
            }
            other => other,
        }
    }

    pub async fn network_id(&self) -> Result<String, ProviderError> {
        self.request("net_version", json!([])).await
    }

    pub async fn block_timestamp(&self, block: BlockTag) -> Result<u64, ProviderError> {
        let header: Option<Value> = self
            .request("eth_getBlockByNumber", json!([block.to_json(), false]))
            .await?;
        let header =
            header.ok_or_else(|| ProviderError::InvalidResponse("block not found".to_string()))?;
        let raw = header
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("block without timestamp".to_string()))?;
        parse_u64_quantity(raw)
    }

    pub async fn balance(&self, account: Address) -> Result<Wei, ProviderError> {
        let raw: String = self
            .request("eth_getBalance", json!([account.to_string(), "latest"]))
            .await?;
        parse_quantity(&raw)
    }

    pub async fn code(&self, address: Address) -> Result<Vec<u8>, ProviderError> {
        let raw: String = self
            .request("eth_getCode", json!([address.to_string(), "latest"]))
            .await?;
        parse_bytes(&raw)
    }

    pub async fn call(
        &self,
        request: &TransactionRequest,
        block: BlockTag,
    ) -> Result<Vec<u8>, ProviderError> {
        let raw: String = self
            .request("eth_call", json!([request.to_json(), block.to_json()]))
            .await?;
        parse_bytes(&raw)
    }

    pub async fn send_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<TxHash, ProviderError> {
        self.request("eth_sendTransaction", json!([request.to_json()]))
            .await
    }

    pub async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<Receipt>, ProviderError> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let Some(block_number) = raw.block_number.as_deref() else {
            // pending
            return Ok(None);
        };
        Ok(Some(Receipt {
            // pre-Byzantium receipts carry no status; treat as success
            succeeded: raw
                .status
                .as_deref()
                .map(parse_u64_quantity)
                .transpose()?
                .is_none_or(|status| status == 1),
            block_number: parse_u64_quantity(block_number)?,
            gas_used: raw
                .gas_used
                .as_deref()
                .map(parse_u64_quantity)
                .transpose()?
                .unwrap_or_default(),
        }))
    }

    /// Polls until the transaction is mined. There is no upper bound; the
    /// provider decides when a transaction settles.
    pub async fn wait_for_receipt(
        &self,
        hash: TxHash,
        poll_interval: Duration,
    ) -> Result<Receipt, ProviderError> {
        loop {
            if let Some(receipt) = self.transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            time::sleep(poll_interval).await;
        }
    }
}

pub fn quantity(value: u128) -> String {
    format!("{value:#x}")
}

pub fn parse_quantity(raw: &str) -> Result<u128, ProviderError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| ProviderError::InvalidResponse(format!("quantity `{raw}` lacks 0x")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ProviderError::InvalidResponse(format!("quantity `{raw}`: {e}")))
}

fn parse_u64_quantity(raw: &str) -> Result<u64, ProviderError> {
    u64::try_from(parse_quantity(raw)?)
        .map_err(|_| ProviderError::InvalidResponse(format!("quantity `{raw}` exceeds u64")))
}

pub fn bytes_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn parse_bytes(raw: &str) -> Result<Vec<u8>, ProviderError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).map_err(|e| ProviderError::InvalidResponse(format!("hex data: {e}")))
}
