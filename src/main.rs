//! CLI entry point for the media archiver.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use archiver_core::{ArchiveConfig, Archiver, FileConfig, JsonExportLister, PatternMediaExtractor};
use clap::Parser;
use tracing::{debug, error, info, warn};

mod cli;
mod progress;
mod telemetry;

use cli::Args;
use progress::SpinnerProgress;
use telemetry::Telemetry;

/// Process outcome mapped to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failure,
    Interrupted,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Interrupted => 130,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let no_color = args.no_color || std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());
    let telemetry = match Telemetry::init(args.log_level(), no_color, args.log_file.as_deref()) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(ProcessExit::Failure.code());
        }
    };

    let exit = match run(args).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %format!("{e:#}"), "archive run failed");
            eprintln!("error: {e:#}");
            ProcessExit::Failure
        }
    };

    telemetry.shutdown();
    ExitCode::from(exit.code())
}

async fn run(args: Args) -> Result<ProcessExit> {
    debug!(?args, "CLI arguments parsed");

    let mut config = ArchiveConfig::for_source(args.source.clone(), args.source_url());
    let file_config = match &args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => FileConfig::load_default()?,
    };
    if let Some(file_config) = &file_config {
        debug!("applying config file defaults");
        file_config.apply_to(&mut config);
    }
    args.apply_to(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source_name,
        output_dir = %config.output_dir.display(),
        concurrency = config.concurrency,
        requests_per_second = config.requests_per_second,
        "media archiver starting"
    );

    let lister = Arc::new(JsonExportLister::new(
        args.export_path(),
        config.source_name.clone(),
        config.source_url.clone(),
        config.page_size,
    ));

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight items and saving progress");
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let use_spinner = progress::should_use_spinner(
        io::stderr().is_terminal(),
        args.quiet,
        progress::is_dumb_terminal(),
    );
    let progress = Arc::new(SpinnerProgress::new(use_spinner));

    let archiver = Archiver::new(config, lister, Arc::new(PatternMediaExtractor::new()))
        .with_interrupt(Arc::clone(&interrupted))
        .with_progress(Arc::clone(&progress) as Arc<dyn archiver_core::ProgressObserver>);

    let result = archiver.run().await;
    progress.finish();
    let summary = result?;

    if !args.quiet {
        println!("{summary}");
    }

    if summary.interrupted || interrupted.load(Ordering::SeqCst) {
        return Ok(ProcessExit::Interrupted);
    }
    Ok(ProcessExit::Success)
}
