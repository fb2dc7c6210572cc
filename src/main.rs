use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::path::PathBuf;
use ticket_store::{
    client::{
        self,
        AppConfig,
    },
    contract::GasSettings,
    deployment,
    wallets::AccountSelector,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

#[derive(Parser, Debug)]
#[command(version, about = "Terminal client for the ticket store contract", long_about = None)]
struct Args {
    /// JSON-RPC endpoint of an account-managing provider
    #[arg(long, default_value = client::DEFAULT_RPC_URL)]
    rpc_url: String,

    /// Build artifact with the contract ABI and per-network addresses
    #[arg(long, default_value = deployment::DEFAULT_MANIFEST_PATH)]
    manifest: String,

    /// Provider account to use, by address or by position
    #[arg(long)]
    account: Option<String>,

    #[arg(long, default_value = ".logs")]
    log_dir: String,
}

fn init_tracing(log_dir: &str) -> WorkerGuard {
    let dir = PathBuf::from(shellexpand::tilde(log_dir).into_owned());
    let appender = rolling::daily(dir, "ticket-store.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _guard = init_tracing(&args.log_dir);
    tracing::info!("starting ticket-store client");

    let account = match args.account.as_deref() {
        Some(raw) => raw
            .parse::<AccountSelector>()
            .wrap_err("Invalid --account")?,
        None => AccountSelector::First,
    };
    let config = AppConfig {
        rpc_url: args.rpc_url,
        manifest_path: deployment::resolve_manifest_path(&args.manifest),
        account,
        gas: GasSettings::default(),
        receipt_poll_interval: client::RECEIPT_POLL_INTERVAL,
    };
    client::run_app(config).await
}
