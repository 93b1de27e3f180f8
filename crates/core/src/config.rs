use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "QSCALE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleDefaults,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    /// Holds the temporary frame directory and the status file.
    pub work_dir: PathBuf,
}

/// Values used for any job option the command line leaves out. Kept as the
/// raw text a user would type so they go through the same validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscaleDefaults {
    pub model: String,
    pub device: String,
    pub precision: String,
    pub vram_gb: String,
    pub resize_percent: String,
    pub cpu_threads: String,
    pub image_extension: String,
    pub video_extension: String,
    pub interpolate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            work_dir: PathBuf::from("."),
        }
    }
}

impl Default for UpscaleDefaults {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            model: "BSRGANx4".to_string(),
            device: "cuda:0".to_string(),
            precision: "half".to_string(),
            vram_gb: "4".to_string(),
            resize_percent: "100".to_string(),
            cpu_threads: threads.to_string(),
            image_extension: ".png".to_string(),
            video_extension: ".mp4".to_string(),
            interpolate: false,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let settings = LifecycleSettings::default();
        Self {
            grace_period_ms: settings.grace_period.as_millis() as u64,
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
        }
    }
}

impl LifecycleConfig {
    pub fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            grace_period: Duration::from_millis(self.grace_period_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

impl PathsConfig {
    /// Same paths with relative entries anchored at `base`.
    pub fn resolved(&self, base: &Path) -> Self {
        Self {
            models_dir: resolve_relative_to(base, &self.models_dir),
            trt_cache_dir: resolve_relative_to(base, &self.trt_cache_dir),
            work_dir: resolve_relative_to(base, &self.work_dir),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory:
/// 1. CLI override if provided
/// 2. QSCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` if missing and write the default config.toml unless
/// one already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.paths.work_dir, PathBuf::from("."));

        assert_eq!(cfg.upscale.model, "BSRGANx4");
        assert_eq!(cfg.upscale.device, "cuda:0");
        assert_eq!(cfg.upscale.precision, "half");
        assert_eq!(cfg.upscale.vram_gb, "4");
        assert_eq!(cfg.upscale.resize_percent, "100");
        assert_eq!(cfg.upscale.image_extension, ".png");
        assert_eq!(cfg.upscale.video_extension, ".mp4");
        assert!(!cfg.upscale.interpolate);
        assert!(cfg.upscale.cpu_threads.parse::<u32>().expect("number") >= 1);

        assert_eq!(cfg.lifecycle.grace_period_ms, 3000);
        assert_eq!(cfg.lifecycle.poll_interval_ms, 2000);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let cfg: AppConfig = toml::from_str(
            "[upscale]\nmodel = \"RRDBx4\"\n\n[lifecycle]\npoll_interval_ms = 250\n",
        )
        .expect("parse");

        assert_eq!(cfg.upscale.model, "RRDBx4");
        assert_eq!(cfg.upscale.precision, "half");
        assert_eq!(cfg.paths, PathsConfig::default());
        let settings = cfg.lifecycle.settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.grace_period, Duration::from_millis(3000));
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[paths\nmodels_dir = 1").expect("write");

        let err = AppConfig::load_from_path(&path).expect_err("must fail");
        assert!(format!("{err}").contains(&path.display().to_string()));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("nested").join("data");

        initialize_data_dir(&data).expect("initialize data dir");

        assert!(config_path(&data).is_file());
        let loaded = AppConfig::load_from_path(&config_path(&data)).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = config_path(dir.path());
        let custom_content = "[upscale]\nvram_gb = \"8\"\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(dir.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let paths = PathsConfig {
            models_dir: PathBuf::from("/abs/models"),
            ..PathsConfig::default()
        }
        .resolved(Path::new("/data"));

        assert_eq!(paths.models_dir, PathBuf::from("/abs/models"));
        assert_eq!(paths.trt_cache_dir, PathBuf::from("/data/trt_cache"));
        assert_eq!(paths.work_dir, PathBuf::from("/data/."));
    }
}
