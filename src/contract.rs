use crate::{
    abi::{
        self,
        AbiEntry,
        AbiError,
        Decoder,
        Function,
        Token,
    },
    provider::{
        BlockTag,
        Provider,
        ProviderError,
        RpcError,
        TransactionRequest,
        TxHash,
    },
    types::{
        Address,
        ContractBalances,
        Reservation,
        Wei,
    },
};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{
    info,
    warn,
};

pub const DEFAULT_GAS_LIMIT: u64 = 6_721_975;
pub const DEFAULT_GAS_PRICE: u128 = 20_000_000_000;

/// Gas parameters attached to purchases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GasSettings {
    pub limit: u64,
    pub price: u128,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_GAS_LIMIT,
            price: DEFAULT_GAS_PRICE,
        }
    }
}

/// The slice of the store contract this client consumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    GetTickets,
    GetReservation,
    GetContractBalances,
    BookTicket,
    IsTicketAvailable,
    BuyTicket,
    CheckReservationTimeout,
    TransferBalanceToAdmin,
    ChangeAdmin,
    TransferTicket,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::GetTickets,
        Method::GetReservation,
        Method::GetContractBalances,
        Method::BookTicket,
        Method::IsTicketAvailable,
        Method::BuyTicket,
        Method::CheckReservationTimeout,
        Method::TransferBalanceToAdmin,
        Method::ChangeAdmin,
        Method::TransferTicket,
    ];

    /// Name as deployed; the misspellings are part of the contract.
    pub fn abi_name(self) -> &'static str {
        match self {
            Method::GetTickets => "getTikets",
            Method::GetReservation => "getReservation",
            Method::GetContractBalances => "getContractBalances",
            Method::BookTicket => "bookTicket",
            Method::IsTicketAvailable => "isTicketAvailable",
            Method::BuyTicket => "buyTiket",
            Method::CheckReservationTimeout => "checkReservationTimeout",
            Method::TransferBalanceToAdmin => "transferbalanceToAdmin",
            Method::ChangeAdmin => "changeAdmin",
            Method::TransferTicket => "transferTicket",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abi_name())
    }
}

/// Where an alert-worthy revert message came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevertSource {
    /// `error.data.message` supplied by the provider.
    Structured,
    /// Decoded from the revert payload or the provider's error text.
    Decoded,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevertReason {
    pub message: String,
    pub source: RevertSource,
}

impl RevertReason {
    pub fn structured(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: RevertSource::Structured,
        }
    }

    pub fn decoded(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: RevertSource::Decoded,
        }
    }

    pub fn without_reason() -> Self {
        Self::decoded("transaction reverted without a reason")
    }

    pub fn is_structured(&self) -> bool {
        self.source == RevertSource::Structured
    }

    /// Text shown to the user. Structured messages go out verbatim; decoded
    /// reasons carry their label in the same message.
    pub fn alert_text(&self) -> String {
        match self.source {
            RevertSource::Structured => self.message.clone(),
            RevertSource::Decoded => format!("Revert reason: {}", self.message),
        }
    }

    /// Prefers `error.data.message`; otherwise decodes a revert payload found
    /// in `error.data`, and finally falls back to the error's own message.
    pub fn from_rpc_error(error: &RpcError) -> Self {
        let data = error.data.as_ref();
        if let Some(message) = data.and_then(|d| d.get("message")).and_then(Value::as_str) {
            let reason = data.and_then(|d| d.get("reason")).and_then(Value::as_str);
            return match reason {
                Some(reason) if !message.contains(reason) => {
                    Self::structured(format!("{message} {reason}"))
                }
                _ => Self::structured(message),
            };
        }
        let payload = data.and_then(|d| match d {
            Value::String(raw) => Some(raw.as_str()),
            Value::Object(map) => map
                .get("data")
                .or_else(|| map.get("result"))
                .and_then(Value::as_str),
            _ => None,
        });
        if let Some(reason) = payload
            .and_then(|raw| crate::provider::parse_bytes(raw).ok())
            .and_then(|bytes| abi::decode_revert(&bytes))
        {
            return Self::decoded(reason);
        }
        Self::decoded(strip_revert_prefix(&error.message))
    }
}

fn strip_revert_prefix(message: &str) -> String {
    const PREFIXES: [&str; 3] = [
        "VM Exception while processing transaction: revert ",
        "execution reverted: ",
        "reverted with reason string ",
    ];
    PREFIXES
        .iter()
        .find_map(|prefix| message.strip_prefix(prefix))
        .unwrap_or(message)
        .trim_matches('\'')
        .to_string()
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alert_text())
    }
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{0}")]
    Reverted(RevertReason),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to decode {method} result: {source}")]
    Decode {
        method: Method,
        #[source]
        source: AbiError,
    },
}

impl ContractError {
    /// Message for the alert surface.
    pub fn alert_text(&self) -> String {
        match self {
            ContractError::Reverted(reason) => reason.alert_text(),
            other => format!("Transaction failed: {other}"),
        }
    }

    fn from_call(error: ProviderError) -> Self {
        match error {
            ProviderError::Rpc(rpc) => ContractError::Reverted(RevertReason::from_rpc_error(&rpc)),
            other => ContractError::Provider(other),
        }
    }
}

/// A mined, successful transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
}

/// Contract boundary used by the dispatcher. Every mutating method resolves
/// only once the transaction has settled.
pub trait TicketStore {
    /// Account the store signs and reads balances for.
    fn account(&self) -> Address;

    fn tickets(&self) -> impl Future<Output = Result<Vec<Address>, ContractError>> + Send;

    fn reservation(
        &self,
        index: usize,
    ) -> impl Future<Output = Result<Reservation, ContractError>> + Send;

    fn contract_balances(
        &self,
    ) -> impl Future<Output = Result<ContractBalances, ContractError>> + Send;

    fn wallet_balance(&self) -> impl Future<Output = Result<Wei, ContractError>> + Send;

    /// Timestamp of the latest block, i.e. the contract's notion of "now".
    fn block_timestamp(&self) -> impl Future<Output = Result<u64, ContractError>> + Send;

    fn is_ticket_available(
        &self,
        index: usize,
    ) -> impl Future<Output = Result<bool, ContractError>> + Send;

    fn book_ticket(
        &self,
        index: usize,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;

    fn buy_ticket(
        &self,
        index: usize,
        value: Wei,
        gas: GasSettings,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;

    fn check_reservation_timeout(
        &self,
        index: usize,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;

    fn transfer_balance_to_admin(
        &self,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;

    fn change_admin(
        &self,
        new_admin: Address,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;

    fn transfer_ticket(
        &self,
        index: usize,
        new_owner: Address,
    ) -> impl Future<Output = Result<Confirmation, ContractError>> + Send;
}

/// The consumed surface resolved against the manifest's interface descriptor.
#[derive(Clone, Debug)]
pub struct ContractInterface {
    functions: HashMap<Method, Function>,
    /// `Some(n)` when `getTikets` returns a static `address[n]`.
    tickets_len: Option<usize>,
    reserver_word: usize,
    timestamp_word: usize,
}

impl ContractInterface {
    pub fn from_abi(abi: &[AbiEntry]) -> Result<Self, AbiError> {
        let mut functions = HashMap::new();
        for method in Method::ALL {
            functions.insert(method, abi::find_function(abi, method.abi_name())?);
        }
        let tickets_len = functions[&Method::GetTickets]
            .outputs
            .first()
            .and_then(|output| abi::fixed_array_len(&output.kind));
        let reservation = &functions[&Method::GetReservation];
        let reserver_word = reservation.output_word("reserver", "address").unwrap_or(0);
        let timestamp_word = reservation.output_word("timestamp", "uint256").unwrap_or(1);
        Ok(Self {
            functions,
            tickets_len,
            reserver_word,
            timestamp_word,
        })
    }

    pub fn function(&self, method: Method) -> &Function {
        // every Method is inserted by `from_abi`
        &self.functions[&method]
    }

    fn decode_tickets(&self, data: &[u8]) -> Result<Vec<Address>, AbiError> {
        let decoder = Decoder::new(data);
        match self.tickets_len {
            Some(len) => decoder.fixed_address_array(0, len),
            None => decoder.address_array(0),
        }
    }

    fn decode_reservation(&self, index: usize, data: &[u8]) -> Result<Reservation, AbiError> {
        let decoder = Decoder::new(data);
        Ok(Reservation {
            ticket: index,
            reserver: decoder.address(self.reserver_word)?,
            timestamp: decoder.u64(self.timestamp_word)?,
        })
    }

    fn decode_balances(&self, data: &[u8]) -> Result<ContractBalances, AbiError> {
        let decoder = Decoder::new(data);
        Ok(ContractBalances {
            real_balance: decoder.uint(0)?,
            balance_wei: decoder.uint(1)?,
        })
    }
}

fn index_token(index: usize) -> Token {
    Token::Uint(index as u128)
}

/// [`TicketStore`] backed by a JSON-RPC provider that manages the signing
/// account (`eth_sendTransaction`).
#[derive(Clone, Debug)]
pub struct RpcTicketStore {
    provider: Arc<Provider>,
    contract: Address,
    account: Address,
    interface: Arc<ContractInterface>,
    poll_interval: Duration,
}

impl RpcTicketStore {
    pub fn new(
        provider: Arc<Provider>,
        contract: Address,
        account: Address,
        interface: ContractInterface,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            contract,
            account,
            interface: Arc::new(interface),
            poll_interval,
        }
    }

    fn request(&self, method: Method, args: &[Token]) -> TransactionRequest {
        TransactionRequest {
            from: self.account,
            to: self.contract,
            data: self.interface.function(method).encode(args),
            ..TransactionRequest::default()
        }
    }

    async fn call(&self, method: Method, args: &[Token]) -> Result<Vec<u8>, ContractError> {
        let request = self.request(method, args);
        self.provider
            .call(&request, BlockTag::Latest)
            .await
            .map_err(ContractError::from_call)
    }

    async fn transact(
        &self,
        method: Method,
        args: &[Token],
        value: Option<Wei>,
        gas: Option<GasSettings>,
    ) -> Result<Confirmation, ContractError> {
        let request = TransactionRequest {
            value,
            gas: gas.map(|g| g.limit),
            gas_price: gas.map(|g| g.price),
            ..self.request(method, args)
        };
        let hash = self
            .provider
            .send_transaction(&request)
            .await
            .map_err(ContractError::from_call)?;
        info!(%method, %hash, "transaction submitted");
        let receipt = self.provider.wait_for_receipt(hash, self.poll_interval).await?;
        if receipt.succeeded {
            info!(%method, %hash, block = receipt.block_number, gas_used = receipt.gas_used, "transaction confirmed");
            return Ok(Confirmation { tx_hash: hash });
        }

        // replay at the mined block to recover the revert payload
        warn!(%method, %hash, block = receipt.block_number, "transaction reverted");
        let replay = self
            .provider
            .call(&request, BlockTag::Number(receipt.block_number))
            .await;
        let reason = match replay {
            Err(ProviderError::Rpc(rpc)) => RevertReason::from_rpc_error(&rpc),
            Err(other) => {
                warn!(error = %other, "revert replay failed");
                RevertReason::without_reason()
            }
            Ok(_) => RevertReason::without_reason(),
        };
        Err(ContractError::Reverted(reason))
    }

    /// Non-view functions are sent as transactions; view ones are called.
    async fn invoke(&self, method: Method, args: &[Token]) -> Result<Confirmation, ContractError> {
        if self.interface.function(method).is_view {
            self.call(method, args).await?;
            return Ok(Confirmation {
                tx_hash: TxHash([0u8; 32]),
            });
        }
        self.transact(method, args, None, None).await
    }
}

impl TicketStore for RpcTicketStore {
    fn account(&self) -> Address {
        self.account
    }

    async fn tickets(&self) -> Result<Vec<Address>, ContractError> {
        let data = self.call(Method::GetTickets, &[]).await?;
        self.interface
            .decode_tickets(&data)
            .map_err(|source| ContractError::Decode {
                method: Method::GetTickets,
                source,
            })
    }

    async fn reservation(&self, index: usize) -> Result<Reservation, ContractError> {
        let data = self
            .call(Method::GetReservation, &[index_token(index)])
            .await?;
        self.interface
            .decode_reservation(index, &data)
            .map_err(|source| ContractError::Decode {
                method: Method::GetReservation,
                source,
            })
    }

    async fn contract_balances(&self) -> Result<ContractBalances, ContractError> {
        let data = self.call(Method::GetContractBalances, &[]).await?;
        self.interface
            .decode_balances(&data)
            .map_err(|source| ContractError::Decode {
                method: Method::GetContractBalances,
                source,
            })
    }

    async fn wallet_balance(&self) -> Result<Wei, ContractError> {
        Ok(self.provider.balance(self.account).await?)
    }

    async fn block_timestamp(&self) -> Result<u64, ContractError> {
        Ok(self.provider.block_timestamp(BlockTag::Latest).await?)
    }

    async fn is_ticket_available(&self, index: usize) -> Result<bool, ContractError> {
        let data = self
            .call(Method::IsTicketAvailable, &[index_token(index)])
            .await?;
        Decoder::new(&data)
            .bool(0)
            .map_err(|source| ContractError::Decode {
                method: Method::IsTicketAvailable,
                source,
            })
    }

    async fn book_ticket(&self, index: usize) -> Result<Confirmation, ContractError> {
        self.transact(Method::BookTicket, &[index_token(index)], None, None)
            .await
    }

    async fn buy_ticket(
        &self,
        index: usize,
        value: Wei,
        gas: GasSettings,
    ) -> Result<Confirmation, ContractError> {
        self.transact(
            Method::BuyTicket,
            &[index_token(index)],
            Some(value),
            Some(gas),
        )
        .await
    }

    async fn check_reservation_timeout(
        &self,
        index: usize,
    ) -> Result<Confirmation, ContractError> {
        self.invoke(Method::CheckReservationTimeout, &[index_token(index)])
            .await
    }

    async fn transfer_balance_to_admin(&self) -> Result<Confirmation, ContractError> {
        self.transact(Method::TransferBalanceToAdmin, &[], None, None)
            .await
    }

    async fn change_admin(&self, new_admin: Address) -> Result<Confirmation, ContractError> {
        self.transact(Method::ChangeAdmin, &[Token::Address(new_admin)], None, None)
            .await
    }

    async fn transfer_ticket(
        &self,
        index: usize,
        new_owner: Address,
    ) -> Result<Confirmation, ContractError> {
        self.transact(
            Method::TransferTicket,
            &[index_token(index), Token::Address(new_owner)],
            None,
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use serde_json::json;

    fn rpc_error(message: &str, data: Option<Value>) -> RpcError {
        RpcError {
            code: -32000,
            message: message.to_string(),
            data,
        }
    }

    fn error_string_payload(reason: &str) -> String {
        let mut data = abi::ERROR_STRING_SELECTOR.to_vec();
        data.extend(abi::encode_call([0; 4], &[Token::Uint(0x20), Token::Uint(reason.len() as u128)])[4..].to_vec());
        let mut body = reason.as_bytes().to_vec();
        body.resize(32, 0);
        data.extend(body);
        crate::provider::bytes_hex(&data)
    }

    #[test]
    fn from_rpc_error__prefers_structured_message() {
        // given
        let error = rpc_error(
            "execution reverted: Ticket already sold",
            Some(json!({ "message": "Ticket already sold", "data": error_string_payload("other") })),
        );

        // when
        let reason = RevertReason::from_rpc_error(&error);

        // then
        assert_eq!(reason, RevertReason::structured("Ticket already sold"));
        assert_eq!(reason.alert_text(), "Ticket already sold");
    }

    #[test]
    fn from_rpc_error__appends_reason_to_terse_structured_message() {
        let error = rpc_error(
            "VM Exception while processing transaction: revert Only admin",
            Some(json!({ "message": "revert", "reason": "Only admin" })),
        );
        assert_eq!(
            RevertReason::from_rpc_error(&error),
            RevertReason::structured("revert Only admin")
        );
    }

    #[test]
    fn from_rpc_error__decodes_raw_revert_payload() {
        // given
        let error = rpc_error(
            "execution reverted",
            Some(Value::String(error_string_payload("Ticket is reserved"))),
        );

        // when
        let reason = RevertReason::from_rpc_error(&error);

        // then
        assert_eq!(reason, RevertReason::decoded("Ticket is reserved"));
        assert_eq!(reason.alert_text(), "Revert reason: Ticket is reserved");
    }

    #[test]
    fn from_rpc_error__falls_back_to_provider_message() {
        let error = rpc_error("execution reverted: Only the owner can transfer", None);
        assert_eq!(
            RevertReason::from_rpc_error(&error).alert_text(),
            "Revert reason: Only the owner can transfer"
        );
    }

    #[test]
    fn contract_error__formats_non_revert_failures() {
        let err = ContractError::Provider(ProviderError::InvalidResponse("eth_call: eof".into()));
        assert_eq!(
            err.alert_text(),
            "Transaction failed: invalid provider response: eth_call: eof"
        );
    }

    #[test]
    fn contract_interface__requires_every_consumed_method() {
        // given
        let abi: Vec<AbiEntry> = serde_json::from_value(json!([
            {"type":"function","name":"getTikets","inputs":[],"outputs":[{"name":"","type":"address[]"}],"stateMutability":"view"}
        ]))
        .unwrap();

        // when
        let result = ContractInterface::from_abi(&abi);

        // then
        assert_eq!(
            result.unwrap_err(),
            AbiError::MissingFunction("getReservation".to_string())
        );
    }

    #[test]
    fn contract_interface__decodes_static_ticket_array() {
        // given
        let interface = ContractInterface::from_abi(&crate::test_helpers::store_abi()).unwrap();
        let owner = Address::new([0x44; 20]);
        let mut args = vec![Token::Address(Address::ZERO); 16];
        args[3] = Token::Address(owner);
        let data = abi::encode_call([0; 4], &args)[4..].to_vec();

        // when
        let tickets = interface.decode_tickets(&data).unwrap();

        // then
        assert_eq!(tickets.len(), 16);
        assert_eq!(tickets[3], owner);
        assert!(tickets.iter().enumerate().all(|(i, t)| i == 3 || t.is_zero()));
    }

    #[test]
    fn contract_interface__locates_reservation_fields_by_name() {
        // given
        let abi = crate::test_helpers::store_abi_with_reservation_outputs(json!([
            {"name":"timestamp","type":"uint256"},
            {"name":"reserver","type":"address"}
        ]));
        let interface = ContractInterface::from_abi(&abi).unwrap();
        let reserver = Address::new([0x33; 20]);
        let data = abi::encode_call(
            [0; 4],
            &[Token::Uint(1_700_000_000), Token::Address(reserver)],
        )[4..]
            .to_vec();

        // when
        let reservation = interface.decode_reservation(5, &data).unwrap();

        // then
        assert_eq!(
            reservation,
            Reservation {
                ticket: 5,
                reserver,
                timestamp: 1_700_000_000,
            }
        );
    }
}
