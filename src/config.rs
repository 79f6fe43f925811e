use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MAX_RECENT_FILES: usize = 10;

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "m3umatrix", "m3u-matrix")
}

/// Stream validation settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Parallel probes; 1 means sequential
    pub workers: usize,
    /// Pause between requests in sequential mode
    pub delay_ms: u64,
    pub user_agent: String,
    pub use_cache: bool,
    pub cache_ttl_hours: u32,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            workers: 10,
            delay_ms: 100,
            user_agent: "VLC/3.0.20 LibVLC/3.0.20".to_string(),
            use_cache: false,
            cache_ttl_hours: 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub validator: ValidatorSettings,
    pub server: ServerSettings,
    /// Overrides the default `tv_schedules.db` location
    pub database_path: Option<PathBuf>,
    /// XMLTV guide loaded by the HTTP server
    pub epg_path: Option<PathBuf>,
    pub timezone: Option<String>,
    /// Most recent first
    pub recent_files: Vec<PathBuf>,
    pub default_group: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorSettings::default(),
            server: ServerSettings::default(),
            database_path: None,
            epg_path: None,
            timezone: None,
            recent_files: Vec::new(),
            default_group: crate::channel::DEFAULT_GROUP.to_string(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join("config.json"))
    }

    pub fn load() -> Result<Self, anyhow::Error> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(AppConfig::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        let path = Self::config_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), anyhow::Error> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        project_dirs()
            .map(|d| d.data_dir().join("tv_schedules.db"))
            .unwrap_or_else(|| PathBuf::from("tv_schedules.db"))
    }

    pub fn add_recent_file(&mut self, path: PathBuf) {
        self.recent_files.retain(|p| p != &path);
        self.recent_files.insert(0, path);
        self.recent_files.truncate(MAX_RECENT_FILES);
    }

    pub fn get_user_timezone(&self) -> String {
        if let Some(tz) = &self.timezone {
            return tz.clone();
        }

        if let Ok(tz) = iana_time_zone::get_timezone() {
            return tz;
        }

        "UTC".to_string()
    }

    /// Parsed timezone, UTC when the configured name is unknown
    pub fn user_tz(&self) -> chrono_tz::Tz {
        self.get_user_timezone().parse().unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"validator":{"workers":3},"timezone":"Europe/Paris"}"#).unwrap();
        assert_eq!(config.validator.workers, 3);
        assert_eq!(config.validator.timeout_secs, 10);
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.user_tz(), chrono_tz::Europe::Paris);
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let config = AppConfig {
            timezone: Some("Mars/Olympus".into()),
            ..Default::default()
        };
        assert_eq!(config.user_tz(), chrono_tz::UTC);
    }

    #[test]
    fn test_recent_files_are_capped_and_deduped() {
        let mut config = AppConfig::default();
        for i in 0..12 {
            config.add_recent_file(PathBuf::from(format!("/tmp/{}.m3u", i)));
        }
        config.add_recent_file(PathBuf::from("/tmp/5.m3u"));
        assert_eq!(config.recent_files.len(), MAX_RECENT_FILES);
        assert_eq!(config.recent_files[0], PathBuf::from("/tmp/5.m3u"));
        assert_eq!(
            config.recent_files.iter().filter(|p| p.ends_with("5.m3u")).count(),
            1
        );
    }

    #[test]
    fn test_save_and_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.server.port = 9000;
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }
}
