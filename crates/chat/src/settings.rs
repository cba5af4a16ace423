use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use vela_source::{TEMPLATE_SOURCE_ID, default_templates};
use vela_storage::UserId;

use crate::reveal::RevealPacing;
use crate::session::SessionConfig;

pub const DEFAULT_USER_ID: &str = "local";
pub const SETTINGS_DIRECTORY_NAME: &str = "vela";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chats.db";
pub const ENV_PREFIX: &str = "VELA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSettings {
    #[serde(default = "default_submit_delay_ms")]
    pub submit_delay_ms: u64,
    #[serde(default = "default_min_token_interval_ms")]
    pub min_token_interval_ms: u64,
    #[serde(default = "default_max_token_interval_ms")]
    pub max_token_interval_ms: u64,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            submit_delay_ms: default_submit_delay_ms(),
            min_token_interval_ms: default_min_token_interval_ms(),
            max_token_interval_ms: default_max_token_interval_ms(),
        }
    }
}

impl RevealSettings {
    fn normalized(mut self) -> Self {
        if self.min_token_interval_ms > self.max_token_interval_ms {
            std::mem::swap(
                &mut self.min_token_interval_ms,
                &mut self.max_token_interval_ms,
            );
        }
        self
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            submit_delay: Duration::from_millis(self.submit_delay_ms),
            pacing: RevealPacing::jitter(
                Duration::from_millis(self.min_token_interval_ms),
                Duration::from_millis(self.max_token_interval_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    #[serde(default = "default_templates")]
    pub templates: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            templates: default_templates(),
        }
    }
}

impl SourceSettings {
    fn normalized(mut self) -> Self {
        self.kind = if self.kind.trim().is_empty() {
            default_source_kind()
        } else {
            self.kind.trim().to_string()
        };

        self.templates = self
            .templates
            .into_iter()
            .map(|template| template.trim().to_string())
            .filter(|template| !template.is_empty())
            .collect();
        if self.templates.is_empty() {
            self.templates = default_templates();
        }

        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Identity used for every store call; blank runs unauthenticated.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// SQLite file location; blank selects `<config_dir>/vela/chats.db`.
    #[serde(default)]
    pub database_path: String,
    #[serde(default)]
    pub reveal: RevealSettings,
    #[serde(default)]
    pub source: SourceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            database_path: String::new(),
            reveal: RevealSettings::default(),
            source: SourceSettings::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.user_id = self.user_id.trim().to_string();
        self.database_path = self.database_path.trim().to_string();
        self.reveal = self.reveal.normalized();
        self.source = self.source.normalized();
        self
    }

    pub fn caller(&self) -> Option<UserId> {
        UserId::new(self.user_id.as_str())
    }

    pub fn database_location(&self) -> String {
        if self.database_path.is_empty() {
            SettingsStore::default_config_dir()
                .join(DATABASE_FILE_NAME)
                .to_string_lossy()
                .into_owned()
        } else {
            self.database_path.clone()
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".vela"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `VELA_*` environment variables.
    ///
    /// Unreadable files fall back to defaults.
    pub fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(?path, %error, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

fn default_source_kind() -> String {
    TEMPLATE_SOURCE_ID.to_string()
}

fn default_submit_delay_ms() -> u64 {
    500
}

fn default_min_token_interval_ms() -> u64 {
    50
}

fn default_max_token_interval_ms() -> u64 {
    150
}
