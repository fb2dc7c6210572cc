use crate::{
    client::Command,
    state::{
        ActionPhase,
        Alert,
        AlertKind,
        StoreSnapshot,
        TicketRow,
    },
    types::{
        Address,
        format_ether,
        parse_ether,
    },
};
use chrono::DateTime;
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEvent,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use futures::StreamExt;
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::{
    collections::VecDeque,
    io::{
        Stdout,
        stdout,
    },
};
use unicode_width::{
    UnicodeWidthChar,
    UnicodeWidthStr,
};

pub const DEFAULT_DONATION: &str = "0.01";

pub type InputEventReceiver = EventStream;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserEvent {
    Quit,
    Redraw,
    Dispatch(Command),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferForm {
    pub index: String,
    pub new_owner: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum TransferField {
    #[default]
    Index,
    NewOwner,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
enum Mode {
    #[default]
    Normal,
    DonationModal(String),
    TransferModal(TransferForm, TransferField),
    AdminModal(String),
    QuitModal,
}

pub struct UiState {
    mode: Mode,
    selected: usize,
    rows: Vec<TicketRow>,
    donation: String,
    transfer: TransferForm,
    new_admin: String,
    alerts: VecDeque<Alert>,
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
}

impl Default for UiState {
    fn default() -> Self {
        UiState {
            mode: Mode::Normal,
            selected: 0,
            rows: Vec::new(),
            donation: DEFAULT_DONATION.to_string(),
            transfer: TransferForm::default(),
            new_admin: String::new(),
            alerts: VecDeque::new(),
            terminal: None,
        }
    }
}

impl UiState {
    pub fn push_alerts(&mut self, alerts: impl IntoIterator<Item = Alert>) {
        self.alerts.extend(alerts);
    }

    pub fn pending_alerts(&self) -> usize {
        self.alerts.len()
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn donation(&self) -> &str {
        &self.donation
    }

    fn sync_rows(&mut self, snap: &StoreSnapshot) {
        self.rows = snap.rows.clone();
        self.selected = self.selected.min(self.rows.len().saturating_sub(1));
    }

    fn guard(&mut self, message: impl Into<String>) -> Option<UserEvent> {
        self.alerts.push_back(Alert::new(AlertKind::Guard, message));
        Some(UserEvent::Redraw)
    }
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, snap: &StoreSnapshot) -> Result<()> {
    state.sync_rows(snap);
    if let Some(mut term) = state.terminal.take() {
        let res = term.draw(|f| render(f, state, snap)).map(|_| ());
        state.terminal = Some(term);
        res?;
    }
    Ok(())
}

pub fn input_event_stream() -> InputEventReceiver {
    EventStream::new()
}

pub async fn next_raw_event(input: &mut InputEventReceiver) -> Result<Event> {
    match input.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input closed")),
    }
}

/// Maps a terminal event to at most one user intent. Mutating keys only
/// produce [`UserEvent::Dispatch`]; they never touch store state.
pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => key,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(UserEvent::Quit);
    }

    // alerts block everything until dismissed
    if !state.alerts.is_empty() {
        return match key.code {
            KeyCode::Enter | KeyCode::Esc | KeyCode::Char(' ') => {
                state.alerts.pop_front();
                Some(UserEvent::Redraw)
            }
            _ => None,
        };
    }

    match std::mem::take(&mut state.mode) {
        Mode::Normal => interpret_normal(state, key),
        Mode::QuitModal => match key.code {
            KeyCode::Char('y') | KeyCode::Enter => Some(UserEvent::Quit),
            KeyCode::Char('n') | KeyCode::Esc => Some(UserEvent::Redraw),
            _ => {
                state.mode = Mode::QuitModal;
                None
            }
        },
        Mode::DonationModal(mut buffer) => match key.code {
            KeyCode::Esc => Some(UserEvent::Redraw),
            KeyCode::Enter => match parse_ether(&buffer) {
                Ok(_) => {
                    state.donation = buffer.trim().to_string();
                    Some(UserEvent::Redraw)
                }
                Err(err) => {
                    state.mode = Mode::DonationModal(buffer);
                    state.guard(format!("Invalid donation amount: {err}"))
                }
            },
            code => {
                edit_buffer(&mut buffer, code, |c| c.is_ascii_digit() || c == '.');
                state.mode = Mode::DonationModal(buffer);
                Some(UserEvent::Redraw)
            }
        },
        Mode::AdminModal(mut buffer) => match key.code {
            KeyCode::Esc => {
                state.new_admin = buffer;
                Some(UserEvent::Redraw)
            }
            KeyCode::Enter => match buffer.parse::<Address>() {
                Ok(new_admin) => {
                    state.new_admin = buffer;
                    Some(UserEvent::Dispatch(Command::ChangeAdmin { new_admin }))
                }
                Err(err) => {
                    state.mode = Mode::AdminModal(buffer);
                    state.guard(format!("Invalid admin address: {err}"))
                }
            },
            code => {
                edit_buffer(&mut buffer, code, is_address_char);
                state.mode = Mode::AdminModal(buffer);
                Some(UserEvent::Redraw)
            }
        },
        Mode::TransferModal(mut form, field) => match key.code {
            KeyCode::Esc => {
                state.transfer = form;
                Some(UserEvent::Redraw)
            }
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
                let next = match field {
                    TransferField::Index => TransferField::NewOwner,
                    TransferField::NewOwner => TransferField::Index,
                };
                state.mode = Mode::TransferModal(form, next);
                Some(UserEvent::Redraw)
            }
            KeyCode::Enter => match parse_transfer(&form) {
                Ok((index, new_owner)) => {
                    state.transfer = form;
                    Some(UserEvent::Dispatch(Command::Transfer { index, new_owner }))
                }
                Err(message) => {
                    state.mode = Mode::TransferModal(form, field);
                    state.guard(message)
                }
            },
            code => {
                match field {
                    TransferField::Index => {
                        edit_buffer(&mut form.index, code, |c| c.is_ascii_digit())
                    }
                    TransferField::NewOwner => {
                        edit_buffer(&mut form.new_owner, code, is_address_char)
                    }
                }
                state.mode = Mode::TransferModal(form, field);
                Some(UserEvent::Redraw)
            }
        },
    }
}

fn interpret_normal(state: &mut UiState, key: KeyEvent) -> Option<UserEvent> {
    let row = state.rows.get(state.selected).copied();
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => {
            state.selected = state.selected.saturating_sub(1);
            Some(UserEvent::Redraw)
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if state.selected + 1 < state.rows.len() {
                state.selected += 1;
            }
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('b') => {
            let row = row.filter(|r| r.can_buy)?;
            match parse_ether(&state.donation) {
                Ok(donation) => Some(UserEvent::Dispatch(Command::Purchase {
                    index: row.index,
                    donation,
                })),
                Err(err) => state.guard(format!("Invalid donation amount: {err}")),
            }
        }
        KeyCode::Char('r') => {
            let row = row.filter(|r| r.can_reserve)?;
            Some(UserEvent::Dispatch(Command::Reserve { index: row.index }))
        }
        KeyCode::Char('d') => {
            state.mode = Mode::DonationModal(state.donation.clone());
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('t') => {
            let mut form = state.transfer.clone();
            if let Some(row) = row {
                form.index = row.index.to_string();
            }
            state.mode = Mode::TransferModal(form, TransferField::Index);
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('a') => {
            state.mode = Mode::AdminModal(state.new_admin.clone());
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('w') => Some(UserEvent::Dispatch(Command::Withdraw)),
        KeyCode::F(5) | KeyCode::Char('u') => Some(UserEvent::Dispatch(Command::RefreshAll)),
        KeyCode::Char('q') | KeyCode::Esc => {
            state.mode = Mode::QuitModal;
            Some(UserEvent::Redraw)
        }
        _ => None,
    }
}

fn parse_transfer(form: &TransferForm) -> std::result::Result<(usize, Address), String> {
    let index = form
        .index
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("Invalid ticket index: `{}`", form.index))?;
    let new_owner = form
        .new_owner
        .parse::<Address>()
        .map_err(|err| format!("Invalid new owner address: {err}"))?;
    Ok((index, new_owner))
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_hexdigit() || c == 'x' || c == 'X'
}

fn edit_buffer(buffer: &mut String, code: KeyCode, accept: impl Fn(char) -> bool) {
    match code {
        KeyCode::Backspace => {
            buffer.pop();
        }
        KeyCode::Char(c) if accept(c) => buffer.push(c),
        _ => {}
    }
}

/// Pure view of `(state, snap)`.
pub fn render(f: &mut Frame, state: &UiState, snap: &StoreSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // header
            Constraint::Min(8),    // tickets + forms
            Constraint::Length(4), // status
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_header(f, chunks[0], snap);
    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(chunks[1]);
    draw_tickets(f, body[0], state, snap);
    draw_side_panels(f, body[1], state, snap);
    draw_status(f, chunks[2], snap);
    draw_help(f, chunks[3]);
    draw_modals(f, state);
}

fn draw_header(f: &mut Frame, area: Rect, snap: &StoreSnapshot) {
    let lines = if snap.connected {
        let account = snap.account.map(|a| a.to_string()).unwrap_or_default();
        let contract = snap.contract.map(|a| a.to_string()).unwrap_or_default();
        vec![
            Line::from(format!("Account:  {account}")),
            Line::from(format!("Contract: {contract}")),
        ]
    } else {
        vec![Line::styled(
            "Not connected to a ticket store deployment",
            Style::default().fg(Color::Red),
        )]
    };
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Tickets store"));
    f.render_widget(widget, area);
}

fn draw_tickets(f: &mut Frame, area: Rect, state: &UiState, snap: &StoreSnapshot) {
    let inner_width = usize::from(area.width.saturating_sub(4));
    let items: Vec<ListItem> = snap
        .rows
        .iter()
        .map(|row| ListItem::new(ticket_line(row, inner_width)))
        .collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Tickets"))
        .highlight_symbol("> ")
        .highlight_style(Style::default().add_modifier(Modifier::BOLD));
    let mut list_state = ListState::default();
    if !snap.rows.is_empty() {
        list_state.select(Some(state.selected.min(snap.rows.len() - 1)));
    }
    f.render_stateful_widget(list, area, &mut list_state);
}

pub fn ticket_line(row: &TicketRow, width: usize) -> Line<'static> {
    let mut affordances: Vec<Span<'static>> = Vec::new();
    if row.can_buy {
        affordances.push(Span::styled(" [Buy]", Style::default().fg(Color::Blue)));
    }
    if row.can_reserve {
        affordances.push(Span::styled(" [Reserve]", Style::default().fg(Color::Green)));
    } else if row.reserved {
        let label = match row.reserved_until.and_then(format_chain_time) {
            Some(until) => format!(" Reserved until {until}"),
            None => " Reserved".to_string(),
        };
        affordances.push(Span::styled(label, Style::default().fg(Color::Yellow)));
    }
    let suffix_width: usize = affordances.iter().map(|s| s.content.width()).sum();

    let mut text = format!("Ticket {} bought by {}", row.index, row.owner);
    if text.width() + suffix_width > width {
        text = format!("Ticket {} bought by {}", row.index, row.owner.short());
    }
    let mut spans = vec![Span::raw(truncate_to_width(&text, width.saturating_sub(suffix_width)))];
    spans.extend(affordances);
    Line::from(spans)
}

fn format_chain_time(secs: u64) -> Option<String> {
    let secs = i64::try_from(secs).ok()?;
    DateTime::from_timestamp(secs, 0).map(|t| t.format("%H:%M:%S UTC").to_string())
}

fn truncate_to_width(text: &str, max: usize) -> String {
    if text.width() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w + 1 > max {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push('…');
    out
}

fn draw_side_panels(f: &mut Frame, area: Rect, state: &UiState, snap: &StoreSnapshot) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // donation
            Constraint::Length(4), // transfer
            Constraint::Length(3), // admin
            Constraint::Min(5),    // balances
        ])
        .split(area);

    let donation = Paragraph::new(format!("{} ether", state.donation))
        .block(Block::default().borders(Borders::ALL).title("Amount to donate [d]"));
    f.render_widget(donation, rows[0]);

    let transfer = Paragraph::new(vec![
        Line::from(format!("Ticket index: {}", state.transfer.index)),
        Line::from(format!("New owner: {}", state.transfer.new_owner)),
    ])
    .block(Block::default().borders(Borders::ALL).title("Transfer a ticket [t]"));
    f.render_widget(transfer, rows[1]);

    let admin = Paragraph::new(format!("New admin: {}", state.new_admin))
        .block(Block::default().borders(Borders::ALL).title("Change the administrator [a]"));
    f.render_widget(admin, rows[2]);

    let wei = |value: Option<u128>| value.map_or_else(|| "unknown".to_string(), |v| v.to_string());
    let mut lines = vec![
        Line::from(format!(
            "Actual contract balance: {} wei",
            wei(snap.contract_balances.map(|b| b.real_balance))
        )),
        Line::from(format!(
            "Balance of balanceWei: {} wei",
            wei(snap.contract_balances.map(|b| b.balance_wei))
        )),
        Line::from(format!("User wallet balance: {} wei", wei(snap.wallet_balance))),
    ];
    if let Some(balance) = snap.wallet_balance {
        lines.push(Line::styled(
            format!("  ({} ether)", format_ether(balance)),
            Style::default().fg(Color::DarkGray),
        ));
    }
    let balances = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Balances"));
    f.render_widget(balances, rows[3]);
}

fn draw_status(f: &mut Frame, area: Rect, snap: &StoreSnapshot) {
    let color = match snap.phase {
        ActionPhase::Idle | ActionPhase::Confirmed(_) => Color::Green,
        ActionPhase::Submitted(_) => Color::Yellow,
        ActionPhase::Reverted(_) => Color::Red,
    };
    let status = if snap.status.trim().is_empty() {
        "Ready"
    } else {
        snap.status.as_str()
    };
    let widget = Paragraph::new(vec![
        Line::from(format!("Phase: {}", snap.phase)),
        Line::from(status.to_string()),
    ])
    .style(Style::default().fg(color))
    .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(widget, area);
}

fn draw_help(f: &mut Frame, area: Rect) {
    let help = Paragraph::new(
        "↑/↓ select | b buy | r reserve | d donation | t transfer | a admin | w withdraw | F5/u refresh | q/Esc quit",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}

fn draw_modals(f: &mut Frame, state: &UiState) {
    if let Some(alert) = state.alerts.front() {
        let (title, color) = match alert.kind {
            AlertKind::ReadFailure | AlertKind::Revert => ("Error", Color::Red),
            AlertKind::Guard => ("Warning", Color::Yellow),
            AlertKind::Notice => ("Notice", Color::Cyan),
            AlertKind::Success => ("Success", Color::Green),
        };
        let more = state.alerts.len() - 1;
        let footer = if more > 0 {
            format!("Enter to dismiss ({more} more)")
        } else {
            "Enter to dismiss".to_string()
        };
        let area = centered_rect(60, 30, f.area());
        f.render_widget(Clear, area);
        let widget = Paragraph::new(vec![
            Line::from(alert.message.clone()),
            Line::from(""),
            Line::styled(footer, Style::default().fg(Color::DarkGray)),
        ])
        .wrap(Wrap { trim: false })
        .style(Style::default().fg(color))
        .block(Block::default().borders(Borders::ALL).title(title));
        f.render_widget(widget, area);
        return;
    }

    let (title, lines) = match &state.mode {
        Mode::Normal => return,
        Mode::QuitModal => ("Quit", vec![Line::from("Quit the ticket store? (y/n)")]),
        Mode::DonationModal(buffer) => (
            "Amount to donate",
            vec![
                Line::from(format!("{buffer}_ ether")),
                Line::from("Enter to save, Esc to cancel"),
            ],
        ),
        Mode::AdminModal(buffer) => (
            "Change the administrator",
            vec![
                Line::from(format!("New admin address: {buffer}_")),
                Line::from("Enter to submit, Esc to close"),
            ],
        ),
        Mode::TransferModal(form, field) => {
            let cursor = |active: bool| if active { "_" } else { "" };
            (
                "Transfer a ticket",
                vec![
                    Line::from(format!(
                        "Ticket index: {}{}",
                        form.index,
                        cursor(*field == TransferField::Index)
                    )),
                    Line::from(format!(
                        "New owner address: {}{}",
                        form.new_owner,
                        cursor(*field == TransferField::NewOwner)
                    )),
                    Line::from("Tab to switch field, Enter to submit, Esc to close"),
                ],
            )
        }
    };
    let area = centered_rect(60, 25, f.area());
    f.render_widget(Clear, area);
    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(widget, area);
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1]);

    horizontal[1]
}
