use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use ragline_api::{AuthState, DEFAULT_BASE_URL, HttpBackendConfig, MAX_TOP_K};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::ExchangeOptions;

pub const SETTINGS_DIRECTORY_NAME: &str = "ragline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "RAGLINE_";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SESSION_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Deadline for non-streaming calls; an answer may stream for longer.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub rerank_model_name: Option<String>,
    #[serde(default)]
    pub prompt_name: Option<String>,
    #[serde(default = "default_session_page_size")]
    pub session_page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            top_k: None,
            llm_model: None,
            rerank_model_name: None,
            prompt_name: None,
            session_page_size: DEFAULT_SESSION_PAGE_SIZE,
            token: None,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        let base_url = self.base_url.trim().trim_end_matches('/');
        self.base_url = if base_url.is_empty() {
            default_base_url()
        } else {
            base_url.to_string()
        };
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.top_k = self.top_k.map(|top_k| top_k.clamp(1, MAX_TOP_K));
        self.llm_model = non_blank(self.llm_model);
        self.rerank_model_name = non_blank(self.rerank_model_name);
        self.prompt_name = non_blank(self.prompt_name);
        self.session_page_size = self.session_page_size.max(1);
        self.token = non_blank(self.token);
        self
    }

    pub fn backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            page_size: self.session_page_size,
        }
    }

    pub fn exchange_options(&self) -> ExchangeOptions {
        ExchangeOptions {
            top_k: self.top_k,
            llm_model: self.llm_model.clone(),
            rerank_model_name: self.rerank_model_name.clone(),
            prompt_name: self.prompt_name.clone(),
        }
    }

    /// Auth state seeded with the stored token, if any.
    pub fn auth_state(&self) -> AuthState {
        match &self.token {
            Some(token) => AuthState::with_token(token.as_str()),
            None => AuthState::new(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
    /// Layers merged over the file that are never written back.
    overrides: Figment,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".ragline"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads defaults, then the JSON file, then `RAGLINE_*` environment overrides.
    pub fn new(config_path: PathBuf) -> Self {
        Self::with_overrides(config_path, Figment::from(Env::prefixed(ENV_PREFIX)))
    }

    fn with_overrides(config_path: PathBuf, overrides: Figment) -> Self {
        let settings = Self::load_layers(
            Self::file_layers(&config_path).merge(overrides.clone()),
            &config_path,
        );

        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            overrides,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Edits what the settings file holds and writes it back.
    ///
    /// Environment overrides are applied again on top afterwards but never persisted.
    pub fn update(&self, edit: impl FnOnce(&mut ClientSettings)) -> Result<(), SettingsError> {
        let mut stored = Self::load_layers(Self::file_layers(&self.config_path), &self.config_path);
        edit(&mut stored);
        self.persist(&stored.normalized())?;

        let merged = Self::load_layers(
            Self::file_layers(&self.config_path).merge(self.overrides.clone()),
            &self.config_path,
        );
        self.settings.store(Arc::new(merged));
        Ok(())
    }

    /// Drops the stored token once the server rejected the credential it seeded.
    ///
    /// Returns whether the file changed.
    pub fn forget_rejected_token(&self, auth: &AuthState) -> Result<bool, SettingsError> {
        if auth.is_authenticated() {
            return Ok(false);
        }

        let stored = Self::load_layers(Self::file_layers(&self.config_path), &self.config_path);
        if stored.token.is_none() {
            return Ok(false);
        }

        tracing::info!(path = ?self.config_path, "removing rejected token from settings");
        self.update(|settings| settings.token = None)?;
        Ok(true)
    }

    fn file_layers(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ClientSettings::default())).merge(Json::file(path))
    }

    fn load_layers(figment: Figment, path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings,
                    using defaults",
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
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

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_session_page_size() -> u32 {
    DEFAULT_SESSION_PAGE_SIZE
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_only_store(path: PathBuf) -> ClientSettings {
        SettingsStore::load_layers(SettingsStore::file_layers(&path), &path)
    }

    fn store_with_override(path: PathBuf, key: &str, value: &str) -> SettingsStore {
        SettingsStore::with_overrides(path, Figment::from(Serialized::default(key, value)))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_only_store(dir.path().join(SETTINGS_FILE_NAME));

        assert_eq!(settings, ClientSettings::default());
        assert_eq!(settings.base_url, "http://localhost:8000");
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"base_url":" https://rag.example.com/api/ ","top_k":99,"llm_model":"  ","token":" abc "}"#,
        )
        .unwrap();

        let settings = file_only_store(path);

        assert_eq!(settings.base_url, "https://rag.example.com/api");
        assert_eq!(settings.top_k, Some(MAX_TOP_K));
        assert_eq!(settings.llm_model, None);
        assert_eq!(settings.token.as_deref(), Some("abc"));
        assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert!(settings.auth_state().is_authenticated());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"connect_timeout_secs":"soon"}"#).unwrap();

        assert_eq!(file_only_store(path), ClientSettings::default());
    }

    #[test]
    fn update_persists_atomically_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(|settings| {
                settings.prompt_name = Some("concise".to_string());
                settings.session_page_size = 0;
            })
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(store.settings().session_page_size, 1);

        let reloaded = file_only_store(path);
        assert_eq!(reloaded.prompt_name.as_deref(), Some("concise"));
    }

    #[test]
    fn update_never_writes_override_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let store = store_with_override(path.clone(), "base_url", "http://override.example");
        assert_eq!(store.settings().base_url, "http://override.example");

        store
            .update(|settings| settings.token = Some("t1".to_string()))
            .unwrap();

        let written = file_only_store(path);
        assert_eq!(written.token.as_deref(), Some("t1"));
        assert_eq!(written.base_url, DEFAULT_BASE_URL);
        assert_eq!(store.settings().base_url, "http://override.example");
        assert_eq!(store.settings().token.as_deref(), Some("t1"));
    }

    #[test]
    fn rejected_token_is_removed_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"token":"stale","top_k":4}"#).unwrap();
        let store = SettingsStore::with_overrides(path.clone(), Figment::new());

        let auth = store.settings().auth_state();
        assert!(!store.forget_rejected_token(&auth).unwrap());

        auth.logout();
        assert!(store.forget_rejected_token(&auth).unwrap());

        let written = file_only_store(path);
        assert_eq!(written.token, None);
        assert_eq!(written.top_k, Some(4));
        assert!(!store.settings().auth_state().is_authenticated());
        assert!(!store.forget_rejected_token(&auth).unwrap());
    }

    #[test]
    fn derived_configs_follow_settings() {
        let settings = ClientSettings {
            top_k: Some(3),
            rerank_model_name: Some("bge-reranker".to_string()),
            ..ClientSettings::default()
        };

        let backend = settings.backend_config();
        assert_eq!(backend.connect_timeout, Duration::from_secs(10));
        assert_eq!(backend.page_size, 50);

        let request = settings.exchange_options().request("q");
        assert_eq!(request.top_k, Some(3));
        assert_eq!(request.rerank_model_name.as_deref(), Some("bge-reranker"));
        assert!(!settings.auth_state().is_authenticated());
    }
}
