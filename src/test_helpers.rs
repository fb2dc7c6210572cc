//! In-memory stand-in for the deployed store contract, shared by the unit
//! tests and the `tests/` harness.

use crate::{
    abi::AbiEntry,
    contract::{
        Confirmation,
        ContractError,
        GasSettings,
        RevertReason,
        TicketStore,
    },
    provider::{
        ProviderError,
        TxHash,
    },
    types::{
        Address,
        ContractBalances,
        RESERVATION_SLOTS,
        Reservation,
        WEI_PER_ETHER,
        Wei,
    },
};
use serde_json::{
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
    },
};

pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const STARTING_BALANCE: Wei = 100 * WEI_PER_ETHER;

pub fn test_account(byte: u8) -> Address {
    Address::new([byte; 20])
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FakeRead {
    Tickets,
    Reservations,
    ContractBalances,
    WalletBalance,
    BlockTimestamp,
}

/// A transaction the fake chain accepted for execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmittedTx {
    pub from: Address,
    pub method: &'static str,
    pub value: Wei,
    pub gas: Option<GasSettings>,
    pub succeeded: bool,
}

#[derive(Debug)]
pub struct FakeChain {
    pub now: u64,
    pub admin: Address,
    pub tickets: Vec<Address>,
    pub reservations: Vec<Reservation>,
    pub real_balance: Wei,
    pub balance_wei: Wei,
    pub balances: HashMap<Address, Wei>,
    pub submitted: Vec<SubmittedTx>,
    failing_reads: HashSet<FakeRead>,
    nonce: u64,
}

impl FakeChain {
    pub fn new(admin: Address) -> Self {
        Self {
            now: GENESIS_TIME,
            admin,
            tickets: vec![Address::ZERO; RESERVATION_SLOTS],
            reservations: (0..RESERVATION_SLOTS)
                .map(|ticket| Reservation {
                    ticket,
                    ..Reservation::default()
                })
                .collect(),
            real_balance: 0,
            balance_wei: 0,
            balances: HashMap::new(),
            submitted: Vec::new(),
            failing_reads: HashSet::new(),
            nonce: 0,
        }
    }

    pub fn balance_of(&self, account: Address) -> Wei {
        self.balances
            .get(&account)
            .copied()
            .unwrap_or(STARTING_BALANCE)
    }

    fn read(&self, read: FakeRead) -> Result<(), ContractError> {
        if self.failing_reads.contains(&read) {
            return Err(ContractError::Provider(ProviderError::InvalidResponse(
                format!("{read:?} read unavailable"),
            )));
        }
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<(), ContractError> {
        if index >= self.tickets.len() {
            return Err(revert("Invalid ticket index"));
        }
        Ok(())
    }

    fn held_by_other(&self, index: usize, caller: Address) -> bool {
        self.reservations
            .get(index)
            .is_some_and(|r| r.is_live(self.now) && r.reserver != caller)
    }

    fn mine(
        &mut self,
        from: Address,
        method: &'static str,
        value: Wei,
        gas: Option<GasSettings>,
        outcome: Result<(), ContractError>,
    ) -> Result<Confirmation, ContractError> {
        self.nonce += 1;
        self.submitted.push(SubmittedTx {
            from,
            method,
            value,
            gas,
            succeeded: outcome.is_ok(),
        });
        outcome?;
        let mut hash = [0u8; 32];
        hash[24..].copy_from_slice(&self.nonce.to_be_bytes());
        Ok(Confirmation {
            tx_hash: TxHash(hash),
        })
    }

    fn book(&mut self, index: usize, caller: Address) -> Result<(), ContractError> {
        self.slot(index)?;
        if !self.tickets[index].is_zero() {
            return Err(revert("Ticket already sold"));
        }
        if index >= self.reservations.len() {
            return Err(revert("Ticket cannot be reserved"));
        }
        if self.held_by_other(index, caller) {
            return Err(revert("Ticket already reserved"));
        }
        self.reservations[index] = Reservation {
            ticket: index,
            reserver: caller,
            timestamp: self.now,
        };
        Ok(())
    }

    fn buy(&mut self, index: usize, value: Wei, caller: Address) -> Result<(), ContractError> {
        self.slot(index)?;
        if !self.tickets[index].is_zero() {
            return Err(revert("Ticket already sold"));
        }
        if value == 0 {
            return Err(revert("A donation is required"));
        }
        if self.held_by_other(index, caller) {
            return Err(revert("Ticket is reserved by another user"));
        }
        let balance = self.balance_of(caller);
        if balance < value {
            return Err(revert("sender doesn't have enough funds to send tx"));
        }
        self.balances.insert(caller, balance - value);
        self.real_balance += value;
        self.balance_wei += value;
        self.tickets[index] = caller;
        Ok(())
    }

    fn clear_stale_reservation(&mut self, index: usize) -> Result<(), ContractError> {
        self.slot(index)?;
        let now = self.now;
        let sold = !self.tickets[index].is_zero();
        if let Some(reservation) = self.reservations.get_mut(index)
            && reservation.timestamp != 0
            && (sold || reservation.has_expired(now))
        {
            *reservation = Reservation {
                ticket: index,
                ..Reservation::default()
            };
        }
        Ok(())
    }

    fn withdraw(&mut self, caller: Address) -> Result<(), ContractError> {
        if caller != self.admin {
            return Err(revert("Only the admin can withdraw the balance"));
        }
        let admin_balance = self.balance_of(caller);
        self.balances.insert(caller, admin_balance + self.real_balance);
        self.real_balance = 0;
        self.balance_wei = 0;
        Ok(())
    }

    fn rotate_admin(&mut self, new_admin: Address, caller: Address) -> Result<(), ContractError> {
        if caller != self.admin {
            return Err(revert("Only the admin can change the admin"));
        }
        self.admin = new_admin;
        Ok(())
    }

    fn transfer(
        &mut self,
        index: usize,
        new_owner: Address,
        caller: Address,
    ) -> Result<(), ContractError> {
        self.slot(index)?;
        if self.tickets[index] != caller {
            return Err(revert("Only the owner can transfer the ticket"));
        }
        self.tickets[index] = new_owner;
        Ok(())
    }
}

fn revert(reason: &str) -> ContractError {
    ContractError::Reverted(RevertReason::structured(format!(
        "VM Exception while processing transaction: revert {reason}"
    )))
}

/// [`TicketStore`] over a [`FakeChain`]; clones signing as other accounts
/// share the same chain.
#[derive(Clone, Debug)]
pub struct FakeTicketStore {
    chain: Arc<Mutex<FakeChain>>,
    account: Address,
}

impl FakeTicketStore {
    /// A fresh chain with the contract deployed by `admin`.
    pub fn deploy(admin: Address) -> Self {
        Self {
            chain: Arc::new(Mutex::new(FakeChain::new(admin))),
            account: admin,
        }
    }

    pub fn connect_as(&self, account: Address) -> Self {
        Self {
            chain: self.chain.clone(),
            account,
        }
    }

    pub fn chain(&self) -> Arc<Mutex<FakeChain>> {
        self.chain.clone()
    }

    pub fn advance_time(&self, secs: u64) {
        self.chain.lock().unwrap().now += secs;
    }

    pub fn set_read_failure(&self, read: FakeRead, failing: bool) {
        let mut chain = self.chain.lock().unwrap();
        if failing {
            chain.failing_reads.insert(read);
        } else {
            chain.failing_reads.remove(&read);
        }
    }

    pub fn tickets_now(&self) -> Vec<Address> {
        self.chain.lock().unwrap().tickets.clone()
    }

    pub fn reservation_now(&self, index: usize) -> Reservation {
        self.chain.lock().unwrap().reservations[index]
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.chain.lock().unwrap().submitted.clone()
    }
}

impl TicketStore for FakeTicketStore {
    fn account(&self) -> Address {
        self.account
    }

    async fn tickets(&self) -> Result<Vec<Address>, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.read(FakeRead::Tickets)?;
        Ok(chain.tickets.clone())
    }

    async fn reservation(&self, index: usize) -> Result<Reservation, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.read(FakeRead::Reservations)?;
        chain
            .reservations
            .get(index)
            .copied()
            .ok_or_else(|| revert("Invalid reservation index"))
    }

    async fn contract_balances(&self) -> Result<ContractBalances, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.read(FakeRead::ContractBalances)?;
        Ok(ContractBalances {
            real_balance: chain.real_balance,
            balance_wei: chain.balance_wei,
        })
    }

    async fn wallet_balance(&self) -> Result<Wei, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.read(FakeRead::WalletBalance)?;
        Ok(chain.balance_of(self.account))
    }

    async fn block_timestamp(&self) -> Result<u64, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.read(FakeRead::BlockTimestamp)?;
        Ok(chain.now)
    }

    async fn is_ticket_available(&self, index: usize) -> Result<bool, ContractError> {
        let chain = self.chain.lock().unwrap();
        chain.slot(index)?;
        if !chain.tickets[index].is_zero() {
            return Err(revert("Ticket already sold"));
        }
        if chain.held_by_other(index, self.account) {
            return Err(revert("Ticket is reserved by another user"));
        }
        Ok(true)
    }

    async fn book_ticket(&self, index: usize) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.book(index, self.account);
        chain.mine(self.account, "bookTicket", 0, None, outcome)
    }

    async fn buy_ticket(
        &self,
        index: usize,
        value: Wei,
        gas: GasSettings,
    ) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.buy(index, value, self.account);
        chain.mine(self.account, "buyTiket", value, Some(gas), outcome)
    }

    async fn check_reservation_timeout(
        &self,
        index: usize,
    ) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.clear_stale_reservation(index);
        chain.mine(self.account, "checkReservationTimeout", 0, None, outcome)
    }

    async fn transfer_balance_to_admin(&self) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.withdraw(self.account);
        chain.mine(self.account, "transferbalanceToAdmin", 0, None, outcome)
    }

    async fn change_admin(&self, new_admin: Address) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.rotate_admin(new_admin, self.account);
        chain.mine(self.account, "changeAdmin", 0, None, outcome)
    }

    async fn transfer_ticket(
        &self,
        index: usize,
        new_owner: Address,
    ) -> Result<Confirmation, ContractError> {
        let mut chain = self.chain.lock().unwrap();
        let outcome = chain.transfer(index, new_owner, self.account);
        chain.mine(self.account, "transferTicket", 0, None, outcome)
    }
}

fn function(name: &str, inputs: Value, outputs: Value, mutability: &str) -> Value {
    json!({
        "type": "function",
        "name": name,
        "inputs": inputs,
        "outputs": outputs,
        "stateMutability": mutability,
    })
}

/// Interface descriptor JSON of the store contract with a custom
/// `getReservation` output layout.
pub fn store_abi_json_with_reservation_outputs(reservation_outputs: Value) -> Value {
    let index = json!([{"name": "index", "type": "uint256"}]);
    json!([
        {"type": "constructor", "inputs": [], "stateMutability": "nonpayable"},
        function("getTikets", json!([]), json!([{"name": "", "type": "address[16]"}]), "view"),
        function(
            "getReservation",
            index.clone(),
            json!([{"name": "", "type": "tuple", "components": reservation_outputs}]),
            "view",
        ),
        function(
            "getContractBalances",
            json!([]),
            json!([{"name": "", "type": "uint256"}, {"name": "", "type": "uint256"}]),
            "view",
        ),
        function("bookTicket", index.clone(), json!([]), "nonpayable"),
        function("isTicketAvailable", index.clone(), json!([{"name": "", "type": "bool"}]), "view"),
        function("buyTiket", index.clone(), json!([]), "payable"),
        function("checkReservationTimeout", index.clone(), json!([]), "nonpayable"),
        function("transferbalanceToAdmin", json!([]), json!([]), "nonpayable"),
        function(
            "changeAdmin",
            json!([{"name": "newAdmin", "type": "address"}]),
            json!([]),
            "nonpayable",
        ),
        function(
            "transferTicket",
            json!([{"name": "index", "type": "uint256"}, {"name": "newOwner", "type": "address"}]),
            json!([]),
            "nonpayable",
        ),
    ])
}

pub fn store_abi_json() -> Value {
    store_abi_json_with_reservation_outputs(json!([
        {"name": "reserver", "type": "address"},
        {"name": "timestamp", "type": "uint256"}
    ]))
}

pub fn store_abi_with_reservation_outputs(reservation_outputs: Value) -> Vec<AbiEntry> {
    serde_json::from_value(store_abi_json_with_reservation_outputs(reservation_outputs)).unwrap()
}

pub fn store_abi() -> Vec<AbiEntry> {
    serde_json::from_value(store_abi_json()).unwrap()
}

/// Truffle-style artifact recording `address` on `network_id`.
pub fn store_manifest_json(network_id: &str, address: Address, deployed_bytecode: &str) -> Value {
    json!({
        "contractName": "MyContract",
        "abi": store_abi_json(),
        "networks": {
            network_id: {
                "events": {},
                "links": {},
                "address": address.to_string(),
                "transactionHash": format!("0x{}", "ab".repeat(32)),
            }
        },
        "deployedBytecode": deployed_bytecode,
    })
}
