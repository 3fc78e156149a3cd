use clap::Parser;
use k_backup_stream::backup::backup_config::{RunOutcome, StreamBackupConfig};
use k_backup_stream::backup::pipeline::cancel::Cancellation;
use k_backup_stream::backup::result_error::result::Result;
use k_backup_stream::backup::result_error::WithMsg;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Stream a directory into an encrypted archive on an object store
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    /// Print the resolved config with secrets redacted and exit
    #[arg(long)]
    dry_run_config: bool,

    /// Log filter, e.g. `debug` or `k_backup_stream=trace`; overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

/// `--log-level` wins over RUST_LOG; anything unparsable falls back to `info`.
fn env_filter(log_level: Option<&str>) -> EnvFilter {
    match log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_tracing(log_level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .init();
}

/// Cancels the run on Ctrl-C. The listener thread lives until the process exits.
fn install_interrupt_handler(cancel: Cancellation) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Interrupt received, cancelling backup");
                        cancel.cancel();
                    }
                    Err(e) => warn!("Cannot listen for interrupts: {e}"),
                }
            })
        })?;
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let config = StreamBackupConfig::load(&args.config)?;
    if args.dry_run_config {
        print!("{}", serde_yml::to_string(&config)?);
        return Ok(());
    }

    let store = config.store().build().with_msg("Building object store failed")?;
    let cancel = Cancellation::default();
    install_interrupt_handler(cancel.clone())?;

    match config.run_once(store, cancel)? {
        RunOutcome::Skipped { newest, next_due } => {
            info!("Skipping backup, {newest} is recent; next upload due at {next_due}")
        }
        RunOutcome::Uploaded(summary) => info!(
            "Backup stored as {} ({} part(s))",
            summary.key(),
            summary.parts()
        ),
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    match run(&args) {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{e}");
            exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_from_log_level() {
        assert_eq!(env_filter(Some("debug")).to_string(), "debug");
    }

    #[test]
    fn test_env_filter_falls_back_to_info() {
        assert_eq!(env_filter(Some("k_backup_stream=loud")).to_string(), "info");
    }
}
