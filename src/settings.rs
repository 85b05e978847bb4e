use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// User-tunable locations. Everything is optional; `None` means "use the
/// built-in default" so a hand-edited settings file only needs the keys the
/// user actually cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Directory holding the model checkouts (X-Restormer/, DarkIR/, vggt/).
    /// Defaults to the process working directory.
    #[serde(default)]
    pub models_root: Option<PathBuf>,
    /// Where per-upload session directories are created. Defaults to a
    /// subdirectory of the OS temp dir.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    /// Interpreter used when a model's own virtualenv python is missing.
    #[serde(default)]
    pub python_fallback: Option<PathBuf>,
    pub first_run: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            models_root: None,
            staging_root: None,
            python_fallback: None,
            first_run: true,
        }
    }
}

impl AppSettings {
    /// Get the settings file path
    fn settings_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        let app_dir = config_dir.join("enhance-studio");
        fs::create_dir_all(&app_dir)?;
        Ok(app_dir.join("settings.json"))
    }

    /// Load settings from disk
    pub fn load() -> Result<Self> {
        let path = Self::settings_path()?;

        if !path.exists() {
            // First run - create default settings
            let settings = Self::default();
            settings.save()?;
            return Ok(settings);
        }

        let contents = fs::read_to_string(&path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        Ok(())
    }

    /// Mark first run as complete
    pub fn complete_first_run(&mut self) -> Result<()> {
        self.first_run = false;
        self.save()
    }

    /// Effective models root (override or the process working directory).
    pub fn models_root(&self) -> PathBuf {
        match &self.models_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Effective staging root for session directories.
    pub fn staging_root(&self) -> PathBuf {
        match &self.staging_root {
            Some(root) => root.clone(),
            None => std::env::temp_dir().join("enhance-studio"),
        }
    }

    /// Interpreter to use when a model venv is missing: the configured
    /// override if it exists on disk, otherwise whatever `python3` resolves
    /// to on PATH.
    pub fn fallback_python(&self) -> PathBuf {
        if let Some(path) = &self.python_fallback {
            if interpreter_available(path) {
                return path.clone();
            }
        }
        detect_system_python().unwrap_or_else(|| PathBuf::from("python3"))
    }
}

/// Probes PATH for a working Python interpreter.
pub fn detect_system_python() -> Option<PathBuf> {
    use std::process::Command;

    #[cfg(target_os = "windows")]
    let candidates = ["python.exe", "python3.exe"];
    #[cfg(not(target_os = "windows"))]
    let candidates = ["python3", "python"];

    for cmd in candidates {
        if Command::new(cmd).arg("--version").output().is_ok() {
            return Some(PathBuf::from(cmd));
        }
    }

    None
}

/// True when `path` looks like a usable interpreter (exists and is a file).
pub fn interpreter_available(path: &Path) -> bool {
    path.is_file()
}
