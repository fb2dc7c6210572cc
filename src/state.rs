//! View state owned by the dispatcher and the immutable snapshot handed to
//! the presentation layer.

use crate::types::{
    Address,
    ContractBalances,
    RESERVATION_SLOTS,
    Reservation,
    Wei,
};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionKind {
    Reserve { index: usize },
    Purchase { index: usize },
    Transfer { index: usize },
    Withdraw,
    ChangeAdmin,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Reserve { index } => write!(f, "reserve ticket {index}"),
            ActionKind::Purchase { index } => write!(f, "purchase ticket {index}"),
            ActionKind::Transfer { index } => write!(f, "transfer ticket {index}"),
            ActionKind::Withdraw => write!(f, "withdraw to admin"),
            ActionKind::ChangeAdmin => write!(f, "change admin"),
        }
    }
}

/// Lifecycle of the action currently being dispatched.
/// `Idle -> Submitted -> Confirmed | Reverted -> Idle`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ActionPhase {
    #[default]
    Idle,
    Submitted(ActionKind),
    Confirmed(ActionKind),
    Reverted(ActionKind),
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPhase::Idle => write!(f, "Idle"),
            ActionPhase::Submitted(kind) => write!(f, "Submitted: {kind}"),
            ActionPhase::Confirmed(kind) => write!(f, "Confirmed: {kind}"),
            ActionPhase::Reverted(kind) => write!(f, "Reverted: {kind}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertKind {
    ReadFailure,
    Revert,
    Notice,
    Success,
    /// Client-side check that stopped an action before submission.
    Guard,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreState {
    connected: bool,
    account: Option<Address>,
    contract: Option<Address>,
    tickets: Vec<Address>,
    reservations: Vec<Reservation>,
    chain_time: Option<u64>,
    contract_balances: Option<ContractBalances>,
    wallet_balance: Option<Wei>,
    phase: ActionPhase,
    status: String,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            connected: false,
            account: None,
            contract: None,
            tickets: Vec::new(),
            reservations: empty_reservations(),
            chain_time: None,
            contract_balances: None,
            wallet_balance: None,
            phase: ActionPhase::Idle,
            status: String::new(),
        }
    }
}

fn empty_reservations() -> Vec<Reservation> {
    (0..RESERVATION_SLOTS)
        .map(|ticket| Reservation {
            ticket,
            ..Reservation::default()
        })
        .collect()
}

impl StoreState {
    pub fn connected(account: Address, contract: Address) -> Self {
        Self {
            connected: true,
            account: Some(account),
            contract: Some(contract),
            ..Self::default()
        }
    }

    pub fn disconnected(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn tickets(&self) -> &[Address] {
        &self.tickets
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn reservation(&self, index: usize) -> Option<&Reservation> {
        self.reservations.get(index)
    }

    pub fn chain_time(&self) -> Option<u64> {
        self.chain_time
    }

    pub fn contract_balances(&self) -> Option<ContractBalances> {
        self.contract_balances
    }

    pub fn wallet_balance(&self) -> Option<Wei> {
        self.wallet_balance
    }

    pub fn phase(&self) -> ActionPhase {
        self.phase
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn apply_tickets(&mut self, owners: Vec<Address>) {
        self.tickets = owners;
    }

    pub fn apply_reservations(&mut self, reservations: Vec<Reservation>) {
        self.reservations = reservations;
    }

    pub fn apply_chain_time(&mut self, now: u64) {
        self.chain_time = Some(now);
    }

    pub fn apply_contract_balances(&mut self, balances: ContractBalances) {
        self.contract_balances = Some(balances);
    }

    pub fn apply_wallet_balance(&mut self, balance: Wei) {
        self.wallet_balance = Some(balance);
    }

    pub fn set_phase(&mut self, phase: ActionPhase) {
        self.phase = phase;
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    /// Whether a reservation currently holds `index`. Without a known chain
    /// time a non-zero reserver counts as held.
    pub fn is_reserved(&self, index: usize) -> bool {
        let Some(reservation) = self.reservations.get(index) else {
            return false;
        };
        match self.chain_time {
            Some(now) => reservation.is_live(now),
            None => !reservation.is_empty(),
        }
    }

    pub fn ticket_rows(&self) -> Vec<TicketRow> {
        self.tickets
            .iter()
            .enumerate()
            .map(|(index, owner)| {
                let available = owner.is_zero();
                let reserved = self.is_reserved(index);
                TicketRow {
                    index,
                    owner: *owner,
                    can_buy: available,
                    can_reserve: available && !reserved,
                    reserved_until: (available && reserved)
                        .then(|| self.reservations[index].expires_at())
                        .flatten(),
                    reserved: available && reserved,
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            connected: self.connected,
            account: self.account,
            contract: self.contract,
            rows: self.ticket_rows(),
            chain_time: self.chain_time,
            contract_balances: self.contract_balances,
            wallet_balance: self.wallet_balance,
            phase: self.phase,
            status: self.status.clone(),
        }
    }
}

/// One rendered ticket line and the affordances it offers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TicketRow {
    pub index: usize,
    pub owner: Address,
    pub can_buy: bool,
    pub can_reserve: bool,
    pub reserved: bool,
    /// Chain time at which a live hold lapses.
    pub reserved_until: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    pub connected: bool,
    pub account: Option<Address>,
    pub contract: Option<Address>,
    pub rows: Vec<TicketRow>,
    pub chain_time: Option<u64>,
    pub contract_balances: Option<ContractBalances>,
    pub wallet_balance: Option<Wei>,
    pub phase: ActionPhase,
    pub status: String,
}
