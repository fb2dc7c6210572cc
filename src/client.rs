use crate::{
    contract::{
        ContractError,
        ContractInterface,
        GasSettings,
        RpcTicketStore,
        TicketStore,
    },
    deployment::{
        self,
        CodeCheck,
        DeploymentManifest,
    },
    provider::{
        Provider,
        ProviderError,
    },
    state::{
        ActionKind,
        ActionPhase,
        Alert,
        AlertKind,
        StoreSnapshot,
        StoreState,
    },
    types::{
        Address,
        ContractBalances,
        RESERVATION_SLOTS,
        Reservation,
        Wei,
    },
    ui,
    wallets::{
        self,
        AccountSelector,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    error,
    info,
    warn,
};

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const INSUFFICIENT_BALANCE: &str = "Insufficient balance to buy the ticket.";
pub const EXPIRED_RESERVATION_NOTICE: &str =
    "The reservation for this ticket had expired, so you were able to buy it.";
pub const SUCCESS: &str = "Success";

const TICKETS_READ_FAILED: &str = "Error obtaining tickets";
const RESERVATIONS_READ_FAILED: &str = "Error obtaining contract reservations";
const CONTRACT_BALANCES_READ_FAILED: &str = "Error obtaining contract balances";
const WALLET_BALANCE_READ_FAILED: &str = "Error obtaining wallet balance";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub rpc_url: String,
    pub manifest_path: PathBuf,
    pub account: AccountSelector,
    pub gas: GasSettings,
    pub receipt_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            manifest_path: PathBuf::from(deployment::DEFAULT_MANIFEST_PATH),
            account: AccountSelector::First,
            gas: GasSettings::default(),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }
}

/// One unit of dispatcher work. Each runs to completion, refreshes
/// included, before the next is taken off the queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    RefreshAll,
    Reserve { index: usize },
    Purchase { index: usize, donation: Wei },
    Transfer { index: usize, new_owner: Address },
    Withdraw,
    ChangeAdmin { new_admin: Address },
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Snapshot(StoreSnapshot),
    Alerts(Vec<Alert>),
}

pub struct AppController<S> {
    store: Option<S>,
    state: StoreState,
    gas: GasSettings,
    alerts: Vec<Alert>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl<S: TicketStore + Clone> AppController<S> {
    pub fn new(store: S, contract: Address, gas: GasSettings) -> Self {
        let state = StoreState::connected(store.account(), contract);
        Self {
            store: Some(store),
            state,
            gas,
            alerts: Vec::new(),
            events: None,
        }
    }

    /// Controller for a failed binding: every read and action is skipped.
    pub fn unbound(status: impl Into<String>) -> Self {
        Self {
            store: None,
            state: StoreState::disconnected(status),
            gas: GasSettings::default(),
            alerts: Vec::new(),
            events: None,
        }
    }

    /// Publishes snapshots and alerts to `events` from now on.
    pub fn attach(&mut self, events: mpsc::UnboundedSender<WorkerEvent>) {
        self.events = Some(events);
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.snapshot()
    }

    pub fn take_alerts(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.alerts)
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.state.set_status(message);
    }

    fn push_alert(&mut self, kind: AlertKind, message: impl Into<String>) {
        let alert = Alert::new(kind, message);
        match kind {
            AlertKind::ReadFailure | AlertKind::Revert => error!(alert = %alert.message, "alert raised"),
            _ => info!(alert = %alert.message, "alert raised"),
        }
        self.alerts.push(alert);
    }

    /// Sends the current snapshot and any pending alerts to the UI.
    pub fn publish(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let snapshot = self.state.snapshot();
        let alerts = std::mem::take(&mut self.alerts);
        if events.send(WorkerEvent::Snapshot(snapshot)).is_err() {
            debug!("ui receiver dropped");
            return;
        }
        if !alerts.is_empty() {
            let _ = events.send(WorkerEvent::Alerts(alerts));
        }
    }

    fn set_phase(&mut self, phase: ActionPhase) {
        debug!(%phase, "action phase");
        self.state.set_phase(phase);
        self.publish();
    }

    fn read_failed(&mut self, message: &str, err: &ContractError) {
        error!(error = %err, "{message}");
        self.push_alert(AlertKind::ReadFailure, message);
    }

    fn report_failure(&mut self, kind: ActionKind, err: &ContractError) {
        warn!(action = %kind, error = %err, "action failed");
        self.set_status(format!("Failed to {kind}"));
        self.push_alert(AlertKind::Revert, err.alert_text());
        self.set_phase(ActionPhase::Reverted(kind));
    }

    fn report_success(&mut self, kind: ActionKind) {
        self.set_status(format!("Confirmed: {kind}"));
        self.set_phase(ActionPhase::Confirmed(kind));
    }

    pub async fn fetch_tickets(&mut self) -> Option<Vec<Address>> {
        let store = self.store.as_ref()?;
        match store.tickets().await {
            Ok(owners) => {
                self.state.apply_tickets(owners.clone());
                Some(owners)
            }
            Err(err) => {
                self.read_failed(TICKETS_READ_FAILED, &err);
                None
            }
        }
    }

    /// One sequential read per slot; any failure leaves the previous
    /// records untouched.
    pub async fn fetch_reservations(&mut self) -> Option<Vec<Reservation>> {
        let store = self.store.as_ref()?;
        let mut reservations = Vec::with_capacity(RESERVATION_SLOTS);
        for index in 0..RESERVATION_SLOTS {
            match store.reservation(index).await {
                Ok(reservation) => reservations.push(reservation),
                Err(err) => {
                    self.read_failed(RESERVATIONS_READ_FAILED, &err);
                    return None;
                }
            }
        }
        match store.block_timestamp().await {
            Ok(now) => self.state.apply_chain_time(now),
            Err(err) => warn!(error = %err, "block timestamp unavailable"),
        }
        self.state.apply_reservations(reservations.clone());
        Some(reservations)
    }

    pub async fn fetch_contract_balances(&mut self) -> Option<ContractBalances> {
        let store = self.store.as_ref()?;
        match store.contract_balances().await {
            Ok(balances) => {
                self.state.apply_contract_balances(balances);
                Some(balances)
            }
            Err(err) => {
                self.read_failed(CONTRACT_BALANCES_READ_FAILED, &err);
                None
            }
        }
    }

    pub async fn fetch_wallet_balance(&mut self) -> Option<Wei> {
        let store = self.store.as_ref()?;
        match store.wallet_balance().await {
            Ok(balance) => {
                self.state.apply_wallet_balance(balance);
                Some(balance)
            }
            Err(err) => {
                self.read_failed(WALLET_BALANCE_READ_FAILED, &err);
                None
            }
        }
    }

    pub async fn refresh_all(&mut self) {
        self.fetch_tickets().await;
        self.fetch_reservations().await;
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
    }

    pub async fn initial_load(&mut self) {
        if self.store.is_none() {
            return;
        }
        info!("loading store state");
        self.refresh_all().await;
        self.set_status("Ready");
    }

    pub async fn reserve(&mut self, index: usize) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let kind = ActionKind::Reserve { index };
        self.set_status(format!("Reserving ticket {index}..."));
        self.set_phase(ActionPhase::Submitted(kind));
        match store.book_ticket(index).await {
            Ok(confirmation) => {
                info!(index, tx = %confirmation.tx_hash, "ticket reserved");
                self.report_success(kind);
            }
            Err(err) => self.report_failure(kind, &err),
        }
        self.fetch_reservations().await;
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
        self.set_phase(ActionPhase::Idle);
    }

    pub async fn purchase(&mut self, index: usize, donation: Wei) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.state.wallet_balance().unwrap_or(0) < donation {
            self.push_alert(AlertKind::Guard, INSUFFICIENT_BALANCE);
            return;
        }

        match store.is_ticket_available(index).await {
            Ok(true) => {}
            Ok(false) => debug!(index, "contract reports ticket unavailable"),
            Err(ContractError::Reverted(reason)) if reason.is_structured() => {
                self.push_alert(AlertKind::Revert, reason.alert_text());
            }
            Err(err) => warn!(index, error = %err, "availability preflight failed"),
        }

        let prior = if index < RESERVATION_SLOTS {
            match store.reservation(index).await {
                Ok(reservation) => Some(reservation),
                Err(err) => {
                    warn!(index, error = %err, "prior reservation unavailable");
                    None
                }
            }
        } else {
            None
        };

        let kind = ActionKind::Purchase { index };
        self.set_status(format!("Buying ticket {index}..."));
        self.set_phase(ActionPhase::Submitted(kind));
        match store.buy_ticket(index, donation, self.gas).await {
            Ok(confirmation) => {
                info!(index, donation, tx = %confirmation.tx_hash, "ticket purchased");
                self.report_success(kind);
                if let Err(err) = store.check_reservation_timeout(index).await {
                    warn!(index, error = %err, "reservation timeout check failed");
                }
                match store.block_timestamp().await {
                    Ok(now) => {
                        if prior.is_some_and(|r| r.has_expired(now)) {
                            self.push_alert(AlertKind::Notice, EXPIRED_RESERVATION_NOTICE);
                        }
                    }
                    Err(err) => warn!(error = %err, "block timestamp unavailable"),
                }
            }
            Err(err) => self.report_failure(kind, &err),
        }
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
        self.fetch_reservations().await;
        self.fetch_tickets().await;
        self.set_phase(ActionPhase::Idle);
    }

    pub async fn transfer(&mut self, index: usize, new_owner: Address) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let kind = ActionKind::Transfer { index };
        self.set_status(format!("Transferring ticket {index} to {new_owner}..."));
        self.set_phase(ActionPhase::Submitted(kind));
        match store.transfer_ticket(index, new_owner).await {
            Ok(confirmation) => {
                info!(index, %new_owner, tx = %confirmation.tx_hash, "ticket transferred");
                self.report_success(kind);
            }
            Err(err) => self.report_failure(kind, &err),
        }
        self.fetch_tickets().await;
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
        self.set_phase(ActionPhase::Idle);
    }

    pub async fn withdraw(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let kind = ActionKind::Withdraw;
        self.set_status("Withdrawing contract balance...");
        self.set_phase(ActionPhase::Submitted(kind));
        match store.transfer_balance_to_admin().await {
            Ok(confirmation) => {
                info!(tx = %confirmation.tx_hash, "balance withdrawn");
                self.push_alert(AlertKind::Success, SUCCESS);
                self.report_success(kind);
            }
            Err(err) => self.report_failure(kind, &err),
        }
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
        self.set_phase(ActionPhase::Idle);
    }

    pub async fn change_admin(&mut self, new_admin: Address) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let kind = ActionKind::ChangeAdmin;
        self.set_status(format!("Changing admin to {new_admin}..."));
        self.set_phase(ActionPhase::Submitted(kind));
        match store.change_admin(new_admin).await {
            Ok(confirmation) => {
                info!(%new_admin, tx = %confirmation.tx_hash, "admin changed");
                self.push_alert(AlertKind::Success, SUCCESS);
                self.report_success(kind);
            }
            Err(err) => self.report_failure(kind, &err),
        }
        self.fetch_contract_balances().await;
        self.fetch_wallet_balance().await;
        self.set_phase(ActionPhase::Idle);
    }

    /// Runs one command. Returns `false` once the worker should stop.
    pub async fn execute(&mut self, command: Command) -> bool {
        if self.store.is_none() && command != Command::Shutdown {
            debug!(?command, "not connected; command skipped");
            return true;
        }
        match command {
            Command::RefreshAll => {
                self.refresh_all().await;
                self.set_status("Refreshed");
            }
            Command::Reserve { index } => self.reserve(index).await,
            Command::Purchase { index, donation } => self.purchase(index, donation).await,
            Command::Transfer { index, new_owner } => self.transfer(index, new_owner).await,
            Command::Withdraw => self.withdraw().await,
            Command::ChangeAdmin { new_admin } => self.change_admin(new_admin).await,
            Command::Shutdown => return false,
        }
        true
    }
}

/// Connects to the provider and binds the store contract recorded in the
/// manifest for the provider's network.
pub async fn bind_store(config: &AppConfig) -> Result<(RpcTicketStore, Address)> {
    let provider = Arc::new(
        Provider::new(config.rpc_url.clone()).wrap_err("Failed to create provider client")?,
    );
    info!(url = %provider.url(), "connecting to provider");

    let accounts = match provider.request_accounts().await {
        Ok(accounts) => accounts,
        Err(ProviderError::Rpc(err)) if err.is_user_rejection() => {
            return Err(eyre!("Account access rejected: {err}"));
        }
        Err(err) => return Err(err).wrap_err("Failed to request account access"),
    };
    let account = wallets::select_account(&accounts, config.account)?;
    info!(%account, available = accounts.len(), "account selected");

    let network_id = provider
        .network_id()
        .await
        .wrap_err("Failed to read network id")?;
    let manifest = DeploymentManifest::load(&config.manifest_path)?;
    let Some(contract) = manifest.address_for(&network_id) else {
        return Err(eyre!(deployment::format_deployment_summary(
            &manifest,
            &network_id,
            &config.manifest_path,
        )));
    };
    let interface = ContractInterface::from_abi(&manifest.abi)
        .wrap_err("Manifest ABI does not describe the ticket store")?;

    let code = provider
        .code(contract)
        .await
        .wrap_err("Failed to read deployed code")?;
    match manifest.check_code(&code) {
        CodeCheck::Missing => {
            return Err(eyre!("No contract code at {contract} on network {network_id}"));
        }
        CodeCheck::Mismatch { expected, actual } => warn!(
            expected = %deployment::hash_preview(&expected),
            actual = %deployment::hash_preview(&actual),
            "deployed code differs from manifest bytecode"
        ),
        CodeCheck::Match => info!("deployed code matches manifest"),
        CodeCheck::Unchecked => debug!("manifest carries no runtime bytecode"),
    }
    info!(%contract, network = %network_id, "contract bound");

    let store = RpcTicketStore::new(
        provider,
        contract,
        account,
        interface,
        config.receipt_poll_interval,
    );
    Ok((store, contract))
}

/// Drains the command queue in order; the only task touching the contract.
pub async fn dispatcher_worker<S: TicketStore + Clone>(
    mut controller: AppController<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    controller.attach(events);
    controller.publish();
    controller.initial_load().await;
    controller.publish();
    while let Some(command) = cmd_rx.recv().await {
        if !controller.execute(command).await {
            break;
        }
        controller.publish();
    }
    debug!("dispatcher stopped");
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let controller = match bind_store(&config).await {
        Ok((store, contract)) => AppController::new(store, contract, config.gas),
        Err(err) => {
            error!(error = ?err, "binding failed; running without a contract");
            AppController::unbound("Not connected")
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(dispatcher_worker(controller, cmd_rx, event_tx));

    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();
    info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(&mut ui_state, &mut input_events, &cmd_tx, event_rx).await;
    ui::terminal_exit()?;

    let _ = cmd_tx.send(Command::Shutdown);
    drop(cmd_tx);
    if !worker.is_finished() {
        // an in-flight transaction may still be waiting on its receipt
        worker.abort();
    }
    res
}

async fn run_loop(
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
) -> Result<()> {
    info!("Running app loop");
    let mut last_snapshot = StoreSnapshot::default();
    ui::draw(ui_state, &last_snapshot).wrap_err("initial draw failed")?;

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(WorkerEvent::Snapshot(snapshot)) => {
                        last_snapshot = snapshot;
                    }
                    Some(WorkerEvent::Alerts(alerts)) => {
                        ui_state.push_alerts(alerts);
                    }
                    None => {
                        warn!("dispatcher channel closed");
                        break;
                    }
                }
                ui::draw(ui_state, &last_snapshot).wrap_err("draw after worker event failed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::Dispatch(command) => {
                        debug!(?command, "queueing command");
                        if cmd_tx.send(command).is_err() {
                            warn!("dispatcher stopped; command dropped");
                        }
                    }
                }
                ui::draw(ui_state, &last_snapshot).wrap_err("draw after input failed")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        test_helpers::{
            FakeRead,
            FakeTicketStore,
            GENESIS_TIME,
            test_account,
        },
        types::{
            RESERVATION_WINDOW_SECS,
            parse_ether,
        },
    };

    fn admin() -> Address {
        test_account(0xad)
    }

    fn alice() -> Address {
        test_account(0xa1)
    }

    fn bob() -> Address {
        test_account(0xb0)
    }

    async fn loaded(store: FakeTicketStore) -> AppController<FakeTicketStore> {
        let mut controller = AppController::new(store, test_account(0xcc), GasSettings::default());
        controller.initial_load().await;
        controller
    }

    fn donation() -> Wei {
        parse_ether("0.01").unwrap()
    }

    fn messages(alerts: &[Alert]) -> Vec<&str> {
        alerts.iter().map(|a| a.message.as_str()).collect()
    }

    #[tokio::test]
    async fn initial_load__reads_every_slice() {
        // given
        let store = FakeTicketStore::deploy(admin());

        // when
        let controller = loaded(store).await;

        // then
        let state = controller.state();
        assert_eq!(state.tickets(), vec![Address::ZERO; RESERVATION_SLOTS].as_slice());
        assert_eq!(state.reservations().len(), RESERVATION_SLOTS);
        assert_eq!(state.chain_time(), Some(GENESIS_TIME));
        assert_eq!(state.contract_balances(), Some(ContractBalances::default()));
        assert!(state.wallet_balance().is_some());
        assert_eq!(state.status(), "Ready");
    }

    #[tokio::test]
    async fn fetch_tickets__is_idempotent_without_mutation() {
        let mut controller = loaded(FakeTicketStore::deploy(admin())).await;
        let first = controller.fetch_tickets().await;
        let second = controller.fetch_tickets().await;
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn purchase__assigns_ticket_to_buyer() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store.clone()).await;

        // when
        controller.purchase(5, donation()).await;

        // then
        assert_eq!(controller.state().tickets()[5], alice());
        assert_eq!(store.tickets_now()[5], alice());
        assert_eq!(
            controller.state().contract_balances().map(|b| b.real_balance),
            Some(donation())
        );
        assert!(controller.take_alerts().is_empty());
        assert_eq!(controller.state().phase(), ActionPhase::Idle);
    }

    #[tokio::test]
    async fn purchase__sends_donation_with_fixed_gas() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store.clone()).await;

        // when
        controller.purchase(1, donation()).await;

        // then
        let buy = store
            .submitted()
            .into_iter()
            .find(|tx| tx.method == "buyTiket")
            .unwrap();
        assert_eq!(buy.value, donation());
        assert_eq!(
            buy.gas,
            Some(GasSettings {
                limit: 6_721_975,
                price: 20_000_000_000,
            })
        );
        assert!(
            store
                .submitted()
                .iter()
                .any(|tx| tx.method == "checkReservationTimeout")
        );
    }

    #[tokio::test]
    async fn purchase__insufficient_balance_alerts_and_submits_nothing() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store.clone()).await;
        let too_much = controller.state().wallet_balance().unwrap() + 1;

        // when
        controller.purchase(0, too_much).await;

        // then
        assert_eq!(messages(&controller.take_alerts()), vec![INSUFFICIENT_BALANCE]);
        assert!(store.submitted().is_empty());
        assert!(controller.state().tickets()[0].is_zero());
    }

    #[tokio::test]
    async fn purchase__unknown_wallet_balance_counts_as_zero() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        store.set_read_failure(FakeRead::WalletBalance, true);
        let mut controller = loaded(store.clone()).await;
        controller.take_alerts();

        // when
        controller.purchase(0, donation()).await;

        // then
        assert_eq!(messages(&controller.take_alerts()), vec![INSUFFICIENT_BALANCE]);
        assert!(store.submitted().is_empty());
    }

    #[tokio::test]
    async fn purchase__after_reservation_expired_raises_notice() {
        // given
        let chain = FakeTicketStore::deploy(admin());
        let mut alice_ctl = loaded(chain.connect_as(alice())).await;
        alice_ctl.reserve(3).await;
        chain.advance_time(RESERVATION_WINDOW_SECS + 1);
        let mut bob_ctl = loaded(chain.connect_as(bob())).await;

        // when
        bob_ctl.purchase(3, donation()).await;

        // then
        assert_eq!(bob_ctl.state().tickets()[3], bob());
        assert_eq!(
            messages(&bob_ctl.take_alerts()),
            vec![EXPIRED_RESERVATION_NOTICE]
        );
    }

    #[tokio::test]
    async fn purchase__live_reservation_of_another_account_is_surfaced() {
        // given
        let chain = FakeTicketStore::deploy(admin());
        let mut alice_ctl = loaded(chain.connect_as(alice())).await;
        alice_ctl.reserve(3).await;
        chain.advance_time(RESERVATION_WINDOW_SECS);
        let mut bob_ctl = loaded(chain.connect_as(bob())).await;

        // when
        bob_ctl.purchase(3, donation()).await;

        // then
        let expected = "VM Exception while processing transaction: revert Ticket is reserved by another user";
        // the preflight and the purchase both report the rejection
        assert_eq!(messages(&bob_ctl.take_alerts()), vec![expected, expected]);
        assert!(bob_ctl.state().tickets()[3].is_zero());
        assert_eq!(bob_ctl.state().reservation(3).unwrap().reserver, alice());
    }

    #[tokio::test]
    async fn reserve__records_caller_and_block_time() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store).await;

        // when
        controller.reserve(3).await;

        // then
        let reservation = controller.state().reservation(3).copied().unwrap();
        assert_eq!(reservation.reserver, alice());
        assert_eq!(reservation.timestamp, GENESIS_TIME);
        assert!(controller.state().is_reserved(3));
        assert!(!controller.state().ticket_rows()[3].can_reserve);
    }

    #[tokio::test]
    async fn reserve__owned_ticket_is_rejected_without_state_change() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store.clone()).await;
        controller.purchase(2, donation()).await;
        let before = store.reservation_now(2);

        // when
        controller.reserve(2).await;

        // then
        assert_eq!(
            messages(&controller.take_alerts()),
            vec!["VM Exception while processing transaction: revert Ticket already sold"]
        );
        assert_eq!(store.reservation_now(2), before);
        assert_eq!(controller.state().tickets()[2], alice());
    }

    #[tokio::test]
    async fn reserve__publishes_every_phase_in_order() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.attach(tx);

        // when
        controller.reserve(0).await;
        controller.reserve(0).await;

        // then
        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::Snapshot(snap) = event {
                phases.push(snap.phase);
            }
        }
        let kind = ActionKind::Reserve { index: 0 };
        assert_eq!(
            phases,
            vec![
                ActionPhase::Submitted(kind),
                ActionPhase::Confirmed(kind),
                ActionPhase::Idle,
                ActionPhase::Submitted(kind),
                ActionPhase::Confirmed(kind),
                ActionPhase::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn transfer__moves_ticket_and_rejects_non_owner() {
        // given
        let chain = FakeTicketStore::deploy(admin());
        let mut alice_ctl = loaded(chain.connect_as(alice())).await;
        let mut bob_ctl = loaded(chain.connect_as(bob())).await;
        alice_ctl.purchase(7, donation()).await;

        // when
        bob_ctl.transfer(7, bob()).await;
        alice_ctl.transfer(7, bob()).await;

        // then
        assert_eq!(
            messages(&bob_ctl.take_alerts()),
            vec!["VM Exception while processing transaction: revert Only the owner can transfer the ticket"]
        );
        assert!(alice_ctl.take_alerts().is_empty());
        assert_eq!(alice_ctl.state().tickets()[7], bob());
    }

    #[tokio::test]
    async fn withdraw__by_admin_alerts_success_and_empties_contract() {
        // given
        let chain = FakeTicketStore::deploy(admin());
        let mut alice_ctl = loaded(chain.connect_as(alice())).await;
        alice_ctl.purchase(0, donation()).await;
        let mut admin_ctl = loaded(chain.clone()).await;
        let before = admin_ctl.state().wallet_balance().unwrap();

        // when
        admin_ctl.withdraw().await;

        // then
        assert_eq!(messages(&admin_ctl.take_alerts()), vec![SUCCESS]);
        assert_eq!(
            admin_ctl.state().contract_balances(),
            Some(ContractBalances::default())
        );
        assert_eq!(admin_ctl.state().wallet_balance(), Some(before + donation()));
    }

    #[tokio::test]
    async fn withdraw__by_previous_admin_is_rejected_after_change_admin() {
        // given
        let chain = FakeTicketStore::deploy(admin());
        let mut alice_ctl = loaded(chain.connect_as(alice())).await;
        alice_ctl.purchase(0, donation()).await;
        let mut admin_ctl = loaded(chain.clone()).await;
        admin_ctl.change_admin(bob()).await;
        assert_eq!(messages(&admin_ctl.take_alerts()), vec![SUCCESS]);
        let balances_before = admin_ctl.state().contract_balances();

        // when
        admin_ctl.withdraw().await;

        // then
        assert_eq!(
            messages(&admin_ctl.take_alerts()),
            vec!["VM Exception while processing transaction: revert Only the admin can withdraw the balance"]
        );
        assert_eq!(admin_ctl.state().contract_balances(), balances_before);
        assert_eq!(chain.chain().lock().unwrap().admin, bob());
    }

    #[tokio::test]
    async fn fetch_reservations__failure_alerts_and_keeps_last_known_value() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let mut controller = loaded(store.clone()).await;
        controller.reserve(4).await;
        store.set_read_failure(FakeRead::Reservations, true);

        // when
        let result = controller.fetch_reservations().await;

        // then
        assert_eq!(result, None);
        assert_eq!(
            messages(&controller.take_alerts()),
            vec![RESERVATIONS_READ_FAILED]
        );
        assert_eq!(controller.state().reservation(4).unwrap().reserver, alice());
    }

    #[tokio::test]
    async fn refresh_all__reports_each_failed_read() {
        // given
        let store = FakeTicketStore::deploy(admin());
        let mut controller = loaded(store.clone()).await;
        for read in [
            FakeRead::Tickets,
            FakeRead::ContractBalances,
            FakeRead::WalletBalance,
        ] {
            store.set_read_failure(read, true);
        }

        // when
        controller.execute(Command::RefreshAll).await;

        // then
        assert_eq!(
            messages(&controller.take_alerts()),
            vec![
                TICKETS_READ_FAILED,
                CONTRACT_BALANCES_READ_FAILED,
                WALLET_BALANCE_READ_FAILED,
            ]
        );
        assert_eq!(controller.state().tickets().len(), RESERVATION_SLOTS);
    }

    #[tokio::test]
    async fn unbound__skips_reads_and_actions_silently() {
        // given
        let mut controller = AppController::<FakeTicketStore>::unbound("Not connected");

        // when
        controller.initial_load().await;
        let keep_going = controller.execute(Command::Reserve { index: 1 }).await;
        let tickets = controller.fetch_tickets().await;

        // then
        assert!(keep_going);
        assert_eq!(tickets, None);
        assert!(controller.take_alerts().is_empty());
        assert!(!controller.snapshot().connected);
        assert_eq!(controller.snapshot().status, "Not connected");
    }

    #[tokio::test]
    async fn dispatcher_worker__runs_commands_in_queue_order() {
        // given
        let store = FakeTicketStore::deploy(admin()).connect_as(alice());
        let controller = AppController::new(store.clone(), test_account(0xcc), GasSettings::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        cmd_tx.send(Command::Reserve { index: 9 }).unwrap();
        cmd_tx
            .send(Command::Purchase {
                index: 9,
                donation: donation(),
            })
            .unwrap();
        cmd_tx
            .send(Command::Transfer {
                index: 9,
                new_owner: bob(),
            })
            .unwrap();
        cmd_tx.send(Command::Shutdown).unwrap();

        // when
        dispatcher_worker(controller, cmd_rx, event_tx).await;

        // then
        let methods: Vec<_> = store.submitted().iter().map(|tx| tx.method).collect();
        assert_eq!(
            methods,
            vec!["bookTicket", "buyTiket", "checkReservationTimeout", "transferTicket"]
        );
        let mut last = None;
        while let Ok(event) = event_rx.try_recv() {
            if let WorkerEvent::Snapshot(snap) = event {
                last = Some(snap);
            }
        }
        let last = last.unwrap();
        assert_eq!(last.rows[9].owner, bob());
        assert_eq!(last.phase, ActionPhase::Idle);
    }
}
