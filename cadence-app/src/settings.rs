//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::elements::insert::InsertMethod;
use cadence_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_LOG_FILTER: &str = "cadence=info,cadence_core=info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub orchestrator: OrchestratorConfig,
    pub language_hint: String,
    pub insert_method: String,
    pub history_enabled: bool,
    pub retention_days: u32,
    pub history_max_items: usize,
    pub log_filter: String,
    pub pipeline_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            language_hint: "auto".into(),
            insert_method: InsertMethod::Clipboard.as_str().into(),
            history_enabled: true,
            retention_days: 7,
            history_max_items: 50,
            log_filter: DEFAULT_LOG_FILTER.into(),
            pipeline_path: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.language_hint = normalize_language_hint(&self.language_hint);
        self.insert_method = normalize_insert_method(&self.insert_method);
        self.retention_days = self.retention_days.clamp(1, 3650);
        self.history_max_items = self.history_max_items.clamp(1, 10_000);
        let filter = self.log_filter.trim();
        self.log_filter = if filter.is_empty() {
            DEFAULT_LOG_FILTER.into()
        } else {
            filter.into()
        };
        self.pipeline_path = self
            .pipeline_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());

        let sleep = &mut self.orchestrator.default_sleep;
        sleep.auto_sleep_delay_seconds = clamp_delay(sleep.auto_sleep_delay_seconds);
        for sleep in self.orchestrator.sleep_overrides.values_mut() {
            sleep.auto_sleep_delay_seconds = clamp_delay(sleep.auto_sleep_delay_seconds);
        }
        self.orchestrator.element_timeout_secs = self
            .orchestrator
            .element_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0);
    }

    pub fn insert_method(&self) -> InsertMethod {
        self.insert_method.parse().unwrap_or_default()
    }

    /// `None` when transcription should detect the language itself.
    pub fn language(&self) -> Option<&str> {
        (self.language_hint != "auto").then_some(self.language_hint.as_str())
    }
}

/// Auto-sleep delay in seconds, `0` meaning never.
fn clamp_delay(secs: f64) -> f64 {
    if secs.is_finite() {
        secs.clamp(0.0, 86_400.0)
    } else {
        0.0
    }
}

pub fn normalize_language_hint(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "en" | "eng" | "english" => "en".into(),
        "de" | "deu" | "german" => "de".into(),
        "fr" | "fra" | "french" => "fr".into(),
        "es" | "spa" | "spanish" => "es".into(),
        "zh" | "zh-cn" | "mandarin" | "chinese" => "zh".into(),
        "ru" | "rus" | "russian" => "ru".into(),
        _ => "auto".into(),
    }
}

pub fn normalize_insert_method(raw: &str) -> String {
    raw.parse::<InsertMethod>()
        .unwrap_or_default()
        .as_str()
        .into()
}

/// `$CADENCE_DATA_DIR`, else the platform data directory.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CADENCE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Cadence")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("cadence")
    }
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
