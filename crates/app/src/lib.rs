use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use qscale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use qscale_core::device::enumerate_devices;
use qscale_core::inference::onnx::OnnxModelLoader;
use qscale_core::job::{JobPaths, JobRequest, KNOWN_MODELS};
use qscale_core::lifecycle::{ExecutableLauncher, JobOutcome, LifecycleController};
use qscale_core::logging::{self, FileSink, LoggingOptions, PanicHook, ProcessRole, DEFAULT_LOG_FILTER};
use qscale_core::media::describe;
use qscale_core::orchestrator::{read_job, run_worker};
use qscale_core::progress::ProgressEvent;
use qscale_core::runtime;

const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Parser)]
#[command(name = "qscale", about = "4x super-resolution for images and videos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale a batch of images and videos.
    Upscale(UpscaleArgs),
    /// Process a job read from stdin. Started by `upscale`.
    #[command(name = "worker", hide = true)]
    Worker,
    /// List inference devices.
    Devices,
    /// List known models and whether their weights are installed.
    Models,
    /// Describe image and video files.
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Options left out fall back to the `[upscale]` section of config.toml.
#[derive(Args, Debug, Default)]
struct UpscaleArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, help = "Device id, e.g. cuda:0, tensorrt:0 or cpu")]
    device: Option<String>,
    #[arg(long, help = "half or full")]
    precision: Option<String>,
    #[arg(long = "vram", value_name = "GB")]
    vram_gb: Option<String>,
    #[arg(long = "resize", value_name = "PERCENT")]
    resize_percent: Option<String>,
    #[arg(long = "cpu", value_name = "THREADS")]
    cpu_threads: Option<String>,
    #[arg(long = "image-ext", value_name = "EXT")]
    image_extension: Option<String>,
    #[arg(long = "video-ext", value_name = "EXT")]
    video_extension: Option<String>,
    #[arg(long, help = "Blend the result 50/50 with the resized source")]
    interpolate: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let role = match cli.command {
        Commands::Worker => ProcessRole::Worker,
        _ => ProcessRole::Supervisor,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    // Before any ort call and before tracing, see `setup_runtime_libs`.
    let runtime_libs = (role == ProcessRole::Worker).then(runtime::setup_runtime_libs);
    init_logging(role, &resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    if let Some(libs) = &runtime_libs {
        runtime::log_runtime_lib_status(libs);
    }
    log_startup_metadata(role, &resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Upscale(args) => {
            let worker_args = worker_args(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
            upscale(args, &config, &resolved_data_dir, worker_args).await
        }
        Commands::Worker => worker().await,
        Commands::Devices => {
            for device in enumerate_devices() {
                println!("{:<14} {}", device.id.to_string(), device.name);
            }
            Ok(())
        }
        Commands::Models => {
            let paths = config.paths.resolved(&resolved_data_dir);
            let loader = OnnxModelLoader {
                models_dir: paths.models_dir,
                trt_cache_dir: paths.trt_cache_dir,
            };
            for model in KNOWN_MODELS {
                let path = loader.model_path(model);
                let state = if path.is_file() { "installed" } else { "missing" };
                println!("{model:<14} {state:<9} {}", path.display());
            }
            Ok(())
        }
        Commands::Probe { files } => probe(&files),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{error:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Global flags forwarded to the worker so both processes log alike.
fn worker_args(data_dir: &Path, verbose: u8, log_filter: Option<&str>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--data-dir".into(),
        data_dir.as_os_str().to_owned(),
    ];
    if verbose > 0 {
        args.push(format!("-{}", "v".repeat(usize::from(verbose))).into());
    }
    if let Some(filter) = log_filter {
        args.push("--log-filter".into());
        args.push(filter.into());
    }
    args.push(WORKER_SUBCOMMAND.into());
    args
}

fn build_request(args: UpscaleArgs, config: &AppConfig, data_dir: &Path) -> JobRequest {
    let defaults = &config.upscale;
    let paths = config.paths.resolved(data_dir);
    JobRequest {
        inputs: args.files,
        model_id: args.model.unwrap_or_else(|| defaults.model.clone()),
        device: args.device.unwrap_or_else(|| defaults.device.clone()),
        precision: args.precision.unwrap_or_else(|| defaults.precision.clone()),
        vram_gb: args.vram_gb.unwrap_or_else(|| defaults.vram_gb.clone()),
        resize_percent: args
            .resize_percent
            .unwrap_or_else(|| defaults.resize_percent.clone()),
        cpu_threads: args.cpu_threads.unwrap_or_else(|| defaults.cpu_threads.clone()),
        image_extension: args
            .image_extension
            .unwrap_or_else(|| defaults.image_extension.clone()),
        video_extension: args
            .video_extension
            .unwrap_or_else(|| defaults.video_extension.clone()),
        interpolate: args.interpolate || defaults.interpolate,
        paths: JobPaths {
            work_dir: paths.work_dir,
            models_dir: paths.models_dir,
            trt_cache_dir: paths.trt_cache_dir,
        },
    }
}

async fn upscale(
    args: UpscaleArgs,
    config: &AppConfig,
    data_dir: &Path,
    worker_args: Vec<OsString>,
) -> Result<()> {
    let devices = enumerate_devices();
    let job = build_request(args, config, data_dir).validate(&devices)?;

    let launcher = ExecutableLauncher::current_exe(worker_args)?;
    let controller = LifecycleController::new(launcher, config.lifecycle.settings());
    let handle = controller.start(job).await?;

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping...");
            stop.cancel();
        }
    });

    let mut status = handle.status();
    let printer = tokio::spawn(async move {
        eprintln!("{}", *status.borrow_and_update());
        while status.changed().await.is_ok() {
            let event = status.borrow_and_update().clone();
            if !event.is_terminal() {
                eprintln!("{event}");
            }
        }
    });

    let outcome = handle.wait().await?;
    join_printer(printer).await;

    match outcome {
        JobOutcome::Completed { elapsed } => {
            eprintln!(
                "All files completed in {}",
                format_duration(elapsed.as_secs_f64())
            );
            Ok(())
        }
        JobOutcome::Failed(reason) => bail!("upscaling failed: {reason}"),
        JobOutcome::Cancelled => {
            eprintln!("{}", ProgressEvent::Cancelled);
            Ok(())
        }
        JobOutcome::Detached => {
            warn!("Status file disappeared; the outcome of the job is unknown");
            Ok(())
        }
    }
}

/// Returns whether the status printer ended on its own.
async fn join_printer(printer: tokio::task::JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(error) => {
            debug!(error = %error, "Status printer task ended abnormally");
            false
        }
    }
}

async fn worker() -> Result<()> {
    let report = tokio::task::spawn_blocking(|| {
        let job = read_job(std::io::stdin().lock())?;
        let loader = OnnxModelLoader {
            models_dir: job.paths.models_dir.clone(),
            trt_cache_dir: job.paths.trt_cache_dir.clone(),
        };
        run_worker(&job, &loader)
    })
    .await??;
    info!(outputs = report.outputs.len(), status = %report.event, "Worker finished");
    Ok(())
}

fn probe(files: &[PathBuf]) -> Result<()> {
    let mut failed = 0usize;
    for file in files {
        match describe(file) {
            Ok(line) => println!("{line}"),
            Err(error) => {
                failed += 1;
                eprintln!("{}: {error:#}", file.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} files could not be described", files.len());
    }
    Ok(())
}

fn init_logging(role: ProcessRole, data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir, role);

    let options = LoggingOptions {
        role,
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::plan_logging(&options);
    let console_filter = parse_env_filter_with_fallback(&plan.filters.console, "console");

    match plan.file_sink {
        FileSink::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&plan.filters.file, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHook::Unavailable {
        attempted_crash_dir,
        reason,
    } = panic_hook
    {
        warn!(
            attempted_crash_dir = %attempted_crash_dir.display(),
            reason = %reason,
            "Panic crash artifacts unavailable"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(role: ProcessRole, data_dir: &Path) {
    info!(
        mode = role.name(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn printer_panic_is_reported_not_propagated() {
        assert!(join_printer(tokio::spawn(async {})).await);
        let crashed = tokio::spawn(async { panic!("stderr closed") });
        assert!(!join_printer(crashed).await);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.4), "00:00:45");
        assert_eq!(format_duration(3600.0), "01:00:00");
        assert_eq!(format_duration(0.0), "00:00:00");
    }

    #[test]
    fn upscale_flags_parse() {
        let cli = Cli::try_parse_from([
            "qscale",
            "-v",
            "upscale",
            "a.png",
            "clip.mp4",
            "--model",
            "RRDBx4",
            "--resize",
            "50",
            "--interpolate",
        ])
        .expect("parse");

        assert_eq!(cli.verbose, 1);
        let Commands::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.files, [PathBuf::from("a.png"), PathBuf::from("clip.mp4")]);
        assert_eq!(args.model.as_deref(), Some("RRDBx4"));
        assert_eq!(args.resize_percent.as_deref(), Some("50"));
        assert!(args.interpolate);
        assert_eq!(args.device, None);
    }

    #[test]
    fn upscale_requires_files() {
        assert!(Cli::try_parse_from(["qscale", "upscale"]).is_err());
    }

    #[test]
    fn worker_args_round_trip_through_cli() {
        let args = worker_args(Path::new("/srv/qscale"), 2, Some("qscale_core=trace"));
        let argv = std::iter::once(OsString::from("qscale")).chain(args);

        let cli = Cli::try_parse_from(argv).expect("parse");
        assert!(matches!(cli.command, Commands::Worker));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter.as_deref(), Some("qscale_core=trace"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/qscale")));
    }

    #[test]
    fn missing_flags_fall_back_to_config() {
        let mut config = AppConfig::default();
        config.upscale.model = "ESRGANx4".to_string();
        config.upscale.cpu_threads = "6".to_string();
        let args = UpscaleArgs {
            files: vec![PathBuf::from("in.png")],
            device: Some("cpu".to_string()),
            ..Default::default()
        };

        let request = build_request(args, &config, Path::new("/data"));

        assert_eq!(request.model_id, "ESRGANx4");
        assert_eq!(request.device, "cpu");
        assert_eq!(request.precision, "half");
        assert_eq!(request.cpu_threads, "6");
        assert_eq!(request.paths.models_dir, PathBuf::from("/data/models"));
        assert!(!request.interpolate);
    }
}
