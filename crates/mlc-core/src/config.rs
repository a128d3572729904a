use directories::{BaseDirs, ProjectDirs};
use eyre::{bail, eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

const CONFIG_FILE_NAME: &str = "workshop.toml";
const MIN_BUFFER_SIZE: usize = 4 * 1024;
const MAX_DEFAULT_WORKERS: usize = 16;

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Return the current override path, if one has been set.
pub fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.read().clone()
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/mlc
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("com", "Mlc", "mlc") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("mlc"));
    }

    Err(eyre!(
        "unable to determine configuration directory for mlc (no override and no platform default)"
    ))
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkshopConfig {
    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-worker transfer buffer in bytes; sized from available memory when unset.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// How many times one item may be resubmitted after its auto-allocated
    /// destination vanished or changed.
    #[serde(default = "default_max_resubmits")]
    pub max_resubmits: u8,
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

fn default_max_resubmits() -> u8 {
    3
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: None,
            max_resubmits: default_max_resubmits(),
        }
    }
}

impl WorkshopConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: WorkshopConfig =
            toml::from_str(content).wrap_err("failed to parse workshop config")?;
        config.validated()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .wrap_err_with(|| format!("invalid config file: {}", path.display()))
    }

    /// Read `workshop.toml` from [`config_dir`], falling back to defaults when
    /// the file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = config_dir()?.join(CONFIG_FILE_NAME);
        if !path.exists() {
            log::debug!("no {} found; using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    fn validated(mut self) -> Result<Self> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if let Some(size) = self.buffer_size {
            if size < MIN_BUFFER_SIZE {
                log::warn!("buffer_size {size} too small; raising to {MIN_BUFFER_SIZE}");
                self.buffer_size = Some(MIN_BUFFER_SIZE);
            }
        }
        Ok(self)
    }
}
