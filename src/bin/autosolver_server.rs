// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      internal_error};
use clap::Parser;
use log::{error, info};

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use autosolver::image_watcher::FolderWatcher;
use autosolver::result_channel::ResultChannel;
use autosolver::solve_field::{SolveField, SolveFieldConfig};
use autosolver::solve_worker::{SolveWorker, SolveWorkerConfig};
use autosolver::stellarium_server::{ServerConfig, StellariumServer};

/// Watches a folder for new images, runs them through the astrometry.net
/// solver, and reports each solved position to Stellarium as the position of
/// a telescope.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Folder to watch for new images (created if it does not exist).
    #[arg(long)]
    watch_folder: PathBuf,

    /// Folder for solver output (created if it does not exist).
    #[arg(long)]
    output_folder: PathBuf,

    /// TCP port for Stellarium Telescope Protocol clients.
    #[arg(long, default_value = "10001")]
    port: u16,

    /// Path to astrometry.net's solve-field program.
    #[arg(long, default_value = "/usr/local/bin/solve-field")]
    solve_field: PathBuf,

    /// Image file extension to watch for.
    #[arg(long, default_value = "jpg")]
    image_extension: String,

    /// Client and watcher polling interval, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "0.1")]
    poll_interval: Duration,

    /// Delay between noticing a new image and solving it, seconds. Gives the
    /// camera time to finish writing the file.
    #[arg(long, value_parser = parse_duration, default_value = "0.5")]
    settle_delay: Duration,

    /// Directory for log files.
    #[arg(long, default_value = ".")]
    log_dir: String,

    /// Log file name prefix; files are rotated daily.
    #[arg(long, default_value = "autosolver_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str) -> Result<Duration, String> {
    let seconds: f64 = arg.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{}", e))
}

fn create_folder(path: &Path) -> Result<(), CanonicalError> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) => Err(failed_precondition_error(
            format!("Could not create {:?}: {:?}", path, e).as_str())),
    }
}

fn async_main(args: Args, got_signal: Arc<AtomicBool>)
              -> Result<(), CanonicalError> {
    create_folder(&args.watch_folder)?;
    create_folder(&args.output_folder)?;

    let results = ResultChannel::new();
    let watcher = FolderWatcher::new(&args.watch_folder, &args.image_extension)?;
    let solver = Arc::new(SolveField::new(SolveFieldConfig{
        solve_field_path: args.solve_field.clone(),
    }));
    let mut solve_worker = SolveWorker::start(
        Box::new(watcher), solver,
        SolveWorkerConfig{
            output_dir: args.output_folder.clone(),
            settle_delay: args.settle_delay,
            poll_interval: args.poll_interval,
        },
        results.clone(), got_signal.clone())?;

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("stellarium_server")
        .build() {
            Ok(runtime) => runtime,
            Err(e) => {
                got_signal.store(true, AtomicOrdering::Relaxed);
                solve_worker.join();
                return Err(internal_error(
                    format!("Could not start runtime: {:?}", e).as_str()));
            }
        };
    let server = StellariumServer::new(
        ServerConfig{
            port: args.port,
            poll_interval: args.poll_interval,
            ..Default::default()
        },
        results, got_signal.clone());
    let served = runtime.block_on(server.run());

    // Also stops the solve worker if the server could not start.
    got_signal.store(true, AtomicOrdering::Relaxed);
    solve_worker.join();
    served
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir) {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Could not create log file in {}: {}",
                          args.log_dir, e);
                std::process::exit(1);
            }
        };

    // Create non-blocking writers for both the file and stdout
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got shutdown signal");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        error!("Could not install signal handler: {:?}", e);
    }

    let exit_code = match async_main(args, got_signal) {
        Ok(()) => {
            info!("Exiting");
            0
        },
        Err(e) => {
            error!("{:?}", e);
            1
        }
    };
    // Flush logs before exiting.
    drop(_guard1);
    drop(_guard2);
    std::process::exit(exit_code);
}
