//! vault-walker - Concurrent Dump, Import and Purge for Vault KV Trees
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vault_walker::config::{CliArgs, DumpSettings, ImportSettings, Operation, PurgeSettings, RunConfig};
use vault_walker::output::FailureReport;
use vault_walker::progress::{print_danger, print_header, print_summary, ProgressReporter};
use vault_walker::vault::{HttpVault, VaultStore};
use vault_walker::walker::{
    load_bundle, DumpCoordinator, DumpOptions, ImportOptions, LoadCoordinator, PurgeCoordinator, PurgeOptions,
    RunProgress,
};

/// Exit code for a run stopped by a signal
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = RunConfig::from_args(args).context("Invalid configuration")?;

    let store: Arc<dyn VaultStore> = Arc::new(
        HttpVault::new(config.vault.address.clone(), &config.vault.token, config.vault.timeout)
            .context("Failed to create Vault client")?,
    );

    match &config.operation {
        Operation::Dump(settings) => run_dump(&config, settings, store),
        Operation::Import(settings) => run_import(&config, settings, store),
        Operation::Purge(settings) => run_purge(&config, settings, store),
    }
}

/// Route SIGINT/SIGTERM to a coordinator's shutdown flag
fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")
}

/// Progress reporter plus the callback feeding it
fn progress_for(config: &RunConfig, verb: &'static str) -> (Option<ProgressReporter>, impl Fn(RunProgress) + Send + 'static) {
    let reporter = config.show_progress.then(|| ProgressReporter::new(verb));
    let feed = reporter.clone();
    let callback = move |p: RunProgress| {
        if let Some(ref r) = feed {
            r.update(&p);
        }
    };
    (reporter, callback)
}

fn finish_progress(reporter: &Option<ProgressReporter>, completed: bool, what: &str) {
    if let Some(p) = reporter {
        if completed {
            p.finish(&format!("{what} completed"));
        } else {
            p.finish(&format!("{what} interrupted"));
        }
    }
}

fn run_dump(config: &RunConfig, settings: &DumpSettings, store: Arc<dyn VaultStore>) -> Result<ExitCode> {
    let target = settings
        .output
        .file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stdout".to_string());
    if config.show_progress {
        print_header("dump", &config.vault.address.to_string(), config.worker_count, &target);
    }

    let options = DumpOptions::new(settings.roots.clone(), config.worker_count)
        .with_queue_size(config.queue_size)
        .with_ignore(config.ignore.clone());
    let coordinator = DumpCoordinator::new(store, options);
    install_signal_handler(coordinator.shutdown_flag())?;

    let (reporter, callback) = progress_for(config, "Read");
    let result = coordinator.run_with_progress(callback).context("Dump failed")?;
    finish_progress(&reporter, result.completed, "Dump");

    if !result.completed {
        warn!(secrets = result.secrets.len(), "Dump was interrupted, nothing written");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    if result.secrets.is_empty() {
        warn!(roots = ?settings.roots, "No secrets found");
        if config.show_progress {
            print_summary("No secrets found", "Read", &result.progress, result.duration, None);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let written = settings.output.write(&result.secrets).context("Failed to write dump")?;
    info!(
        secrets = result.secrets.len(),
        started_at = %result.started_at.to_rfc3339(),
        output = %written.describe(),
        "Dump complete"
    );

    if config.show_progress {
        let describe = written.describe();
        print_summary(
            "Dump Complete",
            "Read",
            &result.progress,
            result.duration,
            Some((describe.as_str(), written.bytes())),
        );
    }

    Ok(if result.progress.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run_import(config: &RunConfig, settings: &ImportSettings, store: Arc<dyn VaultStore>) -> Result<ExitCode> {
    if config.show_progress {
        print_header(
            "import",
            &config.vault.address.to_string(),
            config.worker_count,
            &settings.input.display().to_string(),
        );
    }

    let bundle = load_bundle(&settings.input)
        .with_context(|| format!("Failed to read {}", settings.input.display()))?;
    if bundle.is_empty() {
        warn!(input = %settings.input.display(), "No secrets found");
        return Ok(ExitCode::SUCCESS);
    }

    let options = ImportOptions::new(config.worker_count)
        .with_queue_size(config.queue_size)
        .with_retry(settings.retry)
        .with_ignore(config.ignore.clone());
    let coordinator = LoadCoordinator::new(store, options);
    install_signal_handler(coordinator.shutdown_flag())?;

    let (reporter, callback) = progress_for(config, "Written");
    let result = coordinator
        .run_with_progress(bundle, callback)
        .context("Import failed")?;
    finish_progress(&reporter, result.completed, "Import");

    let report = FailureReport::write(&settings.failures_dir, &result.tally)
        .context("Failed to write failure report")?;

    if config.show_progress {
        print_summary("Import Complete", "Written", &result.progress, result.duration, None);
    }
    if let Some(path) = report {
        eprintln!("Failed entries saved to {}", path.display());
    }

    if !result.completed {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(if result.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_purge(config: &RunConfig, settings: &PurgeSettings, store: Arc<dyn VaultStore>) -> Result<ExitCode> {
    let options = PurgeOptions::new(settings.roots.clone(), config.worker_count);
    let coordinator = PurgeCoordinator::new(store, options);
    let shutdown = coordinator.shutdown_flag();
    install_signal_handler(Arc::clone(&shutdown))?;

    let address = config.vault.address.to_string();
    print_danger(&address, settings.pause);
    std::thread::sleep(settings.pause);

    if !settings.force {
        eprintln!("Press 'Enter' to continue");
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read confirmation")?;
    }

    if shutdown.load(Ordering::SeqCst) {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    if config.show_progress {
        print_header("purge", &address, config.worker_count, &settings.roots.join(","));
    }

    let (reporter, callback) = progress_for(config, "Deleted");
    let result = coordinator.run_with_progress(callback).context("Purge failed")?;
    finish_progress(&reporter, result.completed, "Purge");

    for (path, err) in &result.failures {
        error!(path = %path, error = %err, "Not deleted");
    }
    if config.show_progress {
        print_summary("Purge Complete", "Deleted", &result.progress, result.duration, None);
    }

    if !result.completed {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(if result.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("vault_walker=debug,warn")
    } else {
        EnvFilter::new("vault_walker=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
