use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::watch;

use slot_watch::data::snapshot::SnapshotStore;
use slot_watch::data::zeroworld::ZeroworldClient;
use slot_watch::error::{CycleError, FetchError, NotifyError, SettingsError, StorageError};
use slot_watch::monitor::{CycleOutcome, Monitor};
use slot_watch::notify::telegram::{CommandContext, CommandListener, TelegramNotifier};
use slot_watch::settings::Settings;
use slot_watch::utils::date::format_iso_date;

#[derive(Parser)]
#[command(name = "slot-watch")]
#[command(about = "Watches a booking page and announces newly opened slots", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the YAML settings file
    #[arg(short, long, default_value = "settings.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Check on a fixed interval until interrupted (default)
    Run,
    /// Run a single check and exit
    Once,
    /// Verify the notifier and the booking site are reachable
    Test,
    /// Print the effective settings
    Config,
    /// Print statistics of the stored snapshot
    Stats,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("a check was already running")]
    Busy,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::from_yaml(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            init_logging("info");
            log::error!("cannot load settings from {:?}: {}", cli.config, e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&settings.log_level);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(settings).await,
        Commands::Once => once(settings).await,
        Commands::Test => self_test(settings).await,
        Commands::Config => {
            print_config(&settings);
            Ok(())
        }
        Commands::Stats => print_stats(&settings),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn build_monitor(settings: Settings) -> Result<(Arc<Monitor>, Arc<TelegramNotifier>), AppError> {
    let source = Arc::new(ZeroworldClient::new(&settings)?);
    let notifier = Arc::new(TelegramNotifier::new(
        &settings.telegram,
        settings.request_timeout(),
    )?);
    let store = Arc::new(SnapshotStore::new(settings.state_file.clone()));
    let monitor = Monitor::new(settings, source, notifier.clone(), store);
    Ok((Arc::new(monitor), notifier))
}

async fn run(settings: Settings) -> Result<(), AppError> {
    let listen = settings.telegram.listen_commands;
    let context = CommandContext {
        theme_name: settings.theme_name.clone(),
        check_interval_secs: settings.check_interval_secs,
    };
    let (monitor, bot) = build_monitor(settings)?;

    log::info!("running start-up self test");
    let report = monitor.self_test().await?;
    log::info!(
        "self test passed: notifier {}, {} slots today ({} available)",
        report.notifier,
        report.slots,
        report.available
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = listen.then(|| {
        let listener = CommandListener::new(bot, monitor.board(), context);
        tokio::spawn(listener.run(shutdown_rx.clone()))
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("shutdown signal received"),
            Err(e) => log::error!("cannot listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    monitor.run_forever(shutdown_rx).await;

    if let Some(handle) = listener {
        if let Err(e) = handle.await {
            log::error!("command listener task failed: {}", e);
        }
    }
    Ok(())
}

async fn once(settings: Settings) -> Result<(), AppError> {
    let (monitor, _) = build_monitor(settings)?;
    let report = monitor.self_test().await?;
    log::info!("self test passed: notifier {}", report.notifier);
    let outcome = monitor.try_run_cycle().await.ok_or(AppError::Busy)??;
    match outcome {
        CycleOutcome::OutsideRunHours => log::info!("outside run hours, nothing checked"),
        CycleOutcome::NoData => log::warn!("no slot information was returned"),
        CycleOutcome::Checked(report) => log::info!(
            "checked {} slots ({} available), {} newly available",
            report.total_slots,
            report.available_slots,
            report.newly_available.len()
        ),
    }
    Ok(())
}

async fn self_test(settings: Settings) -> Result<(), AppError> {
    let (monitor, _) = build_monitor(settings)?;
    let report = monitor.self_test().await?;
    println!("notifier: ok ({})", report.notifier);
    println!(
        "booking site: ok ({} slots today, {} available)",
        report.slots, report.available
    );
    Ok(())
}

fn print_config(settings: &Settings) {
    let mask = |value: &str| if value.is_empty() { "unset" } else { "set" };
    let date_end = settings
        .date_end
        .map(|d| d.to_string())
        .unwrap_or_else(|| format!("today + {} days", settings.days_ahead));

    println!("base url:           {}", settings.base_url);
    println!("theme:              {}", settings.theme_name);
    println!("date range:         today ~ {}", date_end);
    println!("utc offset:         {:+}h", settings.timezone_offset_hours);
    println!(
        "run hours:          {:02}:00 ~ {:02}:00",
        settings.run_hours.start, settings.run_hours.end
    );
    println!("check interval:     {}s", settings.check_interval_secs);
    println!("hidden match:       {:?}", settings.match_tolerance());
    println!("state file:         {}", settings.state_file.display());
    println!(
        "notifications:      cooldown {}s, max {} slots",
        settings.notification.cooldown_secs, settings.notification.max_slots
    );
    println!("telegram token:     {}", mask(&settings.telegram.bot_token));
    println!("telegram chat:      {}", mask(&settings.telegram.chat_id));
}

fn print_stats(settings: &Settings) -> Result<(), AppError> {
    let stats = SnapshotStore::new(settings.state_file.clone()).stats()?;
    println!("total slots:     {}", stats.total_slots);
    println!("available:       {}", stats.available_slots);
    println!("reserved:        {}", stats.reserved_slots);
    println!(
        "last updated:    {}",
        stats
            .last_updated
            .as_deref()
            .map(format_iso_date)
            .unwrap_or_else(|| "N/A".to_string())
    );
    println!("file size:       {} bytes", stats.file_size);
    Ok(())
}
