//! Log filter selection, the rolling file sink and the crash-artifact panic
//! hook. The app crate turns a [`LoggingPlan`] into a `tracing-subscriber`
//! registry; nothing here installs a subscriber.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_SUFFIX: &str = "log";

/// Targets carrying ffmpeg/ffprobe stderr. Always persisted at debug level.
pub const SUBPROCESS_TARGETS: [&str; 2] = ["ffmpeg_stderr", "ffmpeg_encode_stderr"];

static PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_ROLE: OnceLock<ProcessRole> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which side of the process split is logging. The two sides write separate
/// log files so their lines never interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Supervisor,
    Worker,
}

impl ProcessRole {
    pub fn name(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            Self::Supervisor => "qscale",
            Self::Worker => "qscale-worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub role: ProcessRole,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            role: ProcessRole::Supervisor,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingOptions {
    /// True when the user did not pick a filter with `--log-filter` or `-v`.
    fn filter_is_implicit(&self) -> bool {
        self.cli_log_filter.is_none() && self.verbose == 0
    }

    fn user_filter(&self) -> String {
        if let Some(filter) = self.cli_log_filter.as_deref() {
            return filter.to_string();
        }
        match self.verbose {
            0 => self
                .rust_log_env
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPlan {
    pub user: String,
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub struct LoggingPlan {
    pub filters: FilterPlan,
    pub file_sink: FileSink,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::ConsoleOnly {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

pub fn plan_logging(options: &LoggingOptions) -> LoggingPlan {
    LoggingPlan {
        filters: compose_filters(options),
        file_sink: open_file_sink(options),
    }
}

pub fn compose_filters(options: &LoggingOptions) -> FilterPlan {
    let user = options.user_filter();
    let noise = options.noise_filter.trim();
    if !options.filter_is_implicit() || noise.is_empty() {
        return FilterPlan {
            console: user.clone(),
            file: user.clone(),
            user,
        };
    }

    FilterPlan {
        console: format!("{noise},{user}"),
        file: format!("{},{user}", persist_subprocess_output(noise)),
        user,
    }
}

/// Rewrite the noise directives for the file layer: subprocess targets are
/// raised to `debug` (and added when missing), everything else is kept.
fn persist_subprocess_output(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(t, _)| t.trim());
            !SUBPROCESS_TARGETS.contains(&target)
        })
        .map(str::to_string)
        .collect();
    directives.extend(SUBPROCESS_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

fn retention_or_default(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

pub fn open_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::ConsoleOnly {
            attempted_log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(options.role.file_prefix())
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_or_default(options.retention_files))
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Ready { log_dir, appender },
        Err(error) => FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable {
        attempted_crash_dir: PathBuf,
        reason: String,
    },
}

/// Chain a hook that writes `panic-<timestamp>-<seq>.log` under
/// `<data_dir>/logs/crash` before the previous hook runs. Installing twice
/// keeps the first crash directory.
pub fn install_panic_hook(data_dir: &Path, role: ProcessRole) -> PanicHook {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHook::AlreadyInstalled(existing.clone());
    }

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHook::Unavailable {
            attempted_crash_dir: crash_dir,
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHook::AlreadyInstalled(existing.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));

    let _ = PANIC_HOOK_ROLE.set(role);
    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHook::Installed(crash_dir)
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    role: &'static str,
    pid: u32,
    thread: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let (backtrace_policy, backtrace) = capture_backtrace();
        Self {
            timestamp: chrono::Utc::now(),
            role: PANIC_HOOK_ROLE
                .get()
                .copied()
                .unwrap_or(ProcessRole::Supervisor)
                .name(),
            pid: std::process::id(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));
        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "process={} pid={}", self.role, self.pid)?;
        writeln!(file, "thread={}", self.thread)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:\n{}", self.backtrace)?;
        file.flush()?;
        Ok(path)
    }
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into this hook.
    if CRASH_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn capture_backtrace() -> (&'static str, String) {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => ("captured", backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)",
            "<disabled>".to_string(),
        ),
        _ => ("unsupported", "<unavailable>".to_string()),
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn report() -> CrashReport {
        CrashReport {
            timestamp: chrono::Utc::now(),
            role: "worker",
            pid: 42,
            thread: "tile-thread".to_string(),
            location: "src/pipeline/frame.rs:12:7".to_string(),
            payload: "index out of bounds".to_string(),
            backtrace_policy: "captured",
            backtrace: "fake backtrace".to_string(),
        }
    }

    #[test]
    fn explicit_filter_beats_verbosity_and_env() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: Some("qscale_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_filters(&options);
        assert_eq!(filters.user, "qscale_core=trace");
        assert_eq!(filters.console, "qscale_core=trace");
        assert_eq!(filters.file, "qscale_core=trace");
    }

    #[test]
    fn verbosity_beats_env() {
        for (verbose, expected) in [(1, "debug"), (2, "trace"), (3, "trace")] {
            let options = LoggingOptions {
                verbose,
                rust_log_env: Some("warn".to_string()),
                ..Default::default()
            };
            assert_eq!(compose_filters(&options).console, expected);
        }
    }

    #[test]
    fn implicit_filter_gets_noise_directives() {
        let options = LoggingOptions {
            rust_log_env: Some("warn,qscale_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_filters(&options);
        assert_eq!(filters.user, "warn,qscale_core=debug");
        assert_eq!(
            filters.console,
            format!("{DEFAULT_NOISE_FILTER},warn,qscale_core=debug")
        );
        assert_eq!(
            filters.file,
            "ort=error,ffmpeg_stderr=debug,ffmpeg_encode_stderr=debug,warn,qscale_core=debug"
        );
    }

    #[test]
    fn default_filter_is_info() {
        let filters = compose_filters(&LoggingOptions::default());
        assert_eq!(filters.user, "info");
        assert_eq!(filters.console, format!("{DEFAULT_NOISE_FILTER},info"));
    }

    #[test]
    fn file_filter_adds_subprocess_targets_missing_from_noise() {
        let options = LoggingOptions {
            noise_filter: "ort=error".to_string(),
            ..Default::default()
        };

        let filters = compose_filters(&options);
        assert_eq!(filters.console, "ort=error,info");
        assert_eq!(
            filters.file,
            "ort=error,ffmpeg_stderr=debug,ffmpeg_encode_stderr=debug,info"
        );
    }

    #[test]
    fn file_sink_lives_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            role: ProcessRole::Worker,
            ..Default::default()
        };

        let sink = open_file_sink(&options);
        assert!(sink.is_ready());
        assert_eq!(sink.log_dir(), Some(data_dir.path().join(LOG_DIR_NAME).as_path()));
        assert!(data_dir.path().join(LOG_DIR_NAME).is_dir());
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };

        match open_file_sink(&options) {
            FileSink::Ready { .. } => panic!("expected console-only logging"),
            FileSink::ConsoleOnly {
                attempted_log_dir,
                reason,
            } => {
                assert_eq!(attempted_log_dir, Some(not_a_dir.path().join(LOG_DIR_NAME)));
                assert!(reason.contains("failed to create log directory"));
            }
        }
    }

    #[test]
    fn no_data_dir_means_console_only() {
        let sink = open_file_sink(&LoggingOptions::default());
        assert!(!sink.is_ready());
        assert_eq!(sink.log_dir(), None);
    }

    #[test]
    fn crash_report_has_every_section() {
        let crash_dir = tempdir().expect("tempdir");

        let path = report().write_to(crash_dir.path()).expect("write artifact");
        let contents = fs::read_to_string(&path).expect("read artifact");

        assert!(path.starts_with(crash_dir.path()));
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("panic-") && name.ends_with(".log"), "{name}");
        for expected in [
            "timestamp_utc=",
            "process=worker pid=42",
            "thread=tile-thread",
            "location=src/pipeline/frame.rs:12:7",
            "payload=index out of bounds",
            "backtrace_policy=captured",
            "backtrace:\nfake backtrace",
        ] {
            assert!(contents.contains(expected), "missing {expected:?}");
        }
    }

    #[test]
    fn crash_report_write_fails_under_a_file() {
        let not_a_dir = NamedTempFile::new().expect("temp file");
        let result = report().write_to(&not_a_dir.path().join("crash"));
        assert!(result.is_err());
    }

    #[test]
    fn payload_text_handles_common_payloads() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(payload_text(str_payload), "boom");
        assert_eq!(payload_text(string_payload), "kaboom");
        assert_eq!(payload_text(int_payload), "<non-string panic payload>");
    }
}
