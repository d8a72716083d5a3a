use config::{Config, File};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const BACKENDS: &[&str] = &["piper", "espeak"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub backend: String, // "piper" or "espeak"
    pub voices_dir: String,
    pub piper_binary: String,
    pub espeak_binary: String,
    pub default_voice: String,
    // Worker pool
    pub pool_size: usize,
    pub synthesis_timeout_secs: u64,
    // Service lifetime
    pub idle_timeout_secs: u64,
    pub keep_alive: bool,
    pub voices_poll_secs: u64,
    // D-Bus registration; empty means derived from the backend
    pub bus_name: String,
    pub object_path: String,
}

fn default_voices_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("piper/voices")
        .to_string_lossy()
        .into_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: "piper".to_string(),
            voices_dir: default_voices_dir(),
            piper_binary: "piper".to_string(),
            espeak_binary: "espeak-ng".to_string(),
            default_voice: "en_US-lessac-medium".to_string(),
            pool_size: 1,
            synthesis_timeout_secs: 30,
            idle_timeout_secs: 120,
            keep_alive: false,
            voices_poll_secs: 30,
            bus_name: String::new(),
            object_path: String::new(),
        }
    }
}

lazy_static! {
    /// Loaded once per process. A bad configuration is kept as the error so
    /// start-up can refuse to run instead of falling back to defaults.
    pub static ref SETTINGS: Result<Settings, config::ConfigError> = Settings::new();
}

/// The process-wide settings, or why they could not be loaded.
pub fn settings() -> Result<Settings, String> {
    SETTINGS
        .as_ref()
        .cloned()
        .map_err(|e| format!("invalid configuration: {}", e))
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("backend", defaults.backend)?
            .set_default("voices_dir", defaults.voices_dir)?
            .set_default("piper_binary", defaults.piper_binary)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .set_default("default_voice", defaults.default_voice)?
            .set_default("pool_size", defaults.pool_size as u64)?
            .set_default("synthesis_timeout_secs", defaults.synthesis_timeout_secs)?
            .set_default("idle_timeout_secs", defaults.idle_timeout_secs)?
            .set_default("keep_alive", defaults.keep_alive)?
            .set_default("voices_poll_secs", defaults.voices_poll_secs)?
            .set_default("bus_name", defaults.bus_name)?
            .set_default("object_path", defaults.object_path)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("SpeechProvider").required(false))
            .add_source(
                File::with_name(
                    &dirs::config_dir()
                        .unwrap_or_default()
                        .join("speech-provider/SpeechProvider")
                        .to_string_lossy(),
                )
                .required(false),
            )
            // Merge with environment variables (e.g. SPEECH_PROVIDER_POOL_SIZE)
            .add_source(config::Environment::with_prefix("SPEECH_PROVIDER"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_legacy_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Honours the variables older provider launchers export.
    fn apply_legacy_env(&mut self) {
        if std::env::var_os("KEEP_ALIVE").is_some_and(|v| !v.is_empty()) {
            self.keep_alive = true;
        }
        if let Ok(dir) = std::env::var("PIPER_VOICES_DIR") {
            if !dir.is_empty() {
                self.voices_dir = dir;
            }
        }
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !BACKENDS.contains(&self.backend.as_str()) {
            return Err(config::ConfigError::Message(format!(
                "Invalid backend: {}. Must be one of {:?}",
                self.backend, BACKENDS
            )));
        }
        if self.pool_size == 0 {
            return Err(config::ConfigError::Message(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "idle_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Voices directory; relative paths resolve against the working directory.
    pub fn voices_path(&self) -> std::io::Result<PathBuf> {
        let path = PathBuf::from(&self.voices_dir);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }

    pub fn bus_name(&self) -> String {
        if !self.bus_name.is_empty() {
            return self.bus_name.clone();
        }
        match self.backend.as_str() {
            "espeak" => "org.espeak.Speech.Provider".to_string(),
            _ => "ai.piper.Speech.Provider".to_string(),
        }
    }

    pub fn object_path(&self) -> String {
        if !self.object_path.is_empty() {
            return self.object_path.clone();
        }
        format!("/{}", self.bus_name().replace('.', "/"))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn voices_poll_interval(&self) -> Option<Duration> {
        (self.voices_poll_secs > 0).then(|| Duration::from_secs(self.voices_poll_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_load() {
        let settings = Settings::new().expect("Failed to load settings");
        assert!(settings.pool_size > 0);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("SPEECH_PROVIDER_POOL_SIZE", "4");
        std::env::set_var("KEEP_ALIVE", "1");
        std::env::set_var("PIPER_VOICES_DIR", "/opt/voices");

        let settings = Settings::new();

        std::env::remove_var("SPEECH_PROVIDER_POOL_SIZE");
        std::env::remove_var("KEEP_ALIVE");
        std::env::remove_var("PIPER_VOICES_DIR");

        let settings = settings.expect("Failed to load settings");
        assert_eq!(settings.pool_size, 4);
        assert!(settings.keep_alive);
        assert_eq!(settings.voices_path().unwrap(), PathBuf::from("/opt/voices"));
    }

    #[test]
    #[serial]
    fn test_invalid_env_is_rejected_at_load() {
        std::env::set_var("SPEECH_PROVIDER_POOL_SIZE", "0");
        let empty_pool = Settings::new();
        std::env::remove_var("SPEECH_PROVIDER_POOL_SIZE");

        std::env::set_var("SPEECH_PROVIDER_BACKEND", "festival");
        let unknown_backend = Settings::new();
        std::env::remove_var("SPEECH_PROVIDER_BACKEND");

        let err = empty_pool.unwrap_err();
        assert!(err.to_string().contains("pool_size"), "{}", err);
        let err = unknown_backend.unwrap_err();
        assert!(err.to_string().contains("festival"), "{}", err);
    }

    #[test]
    #[serial]
    fn test_process_settings_load() {
        let settings = settings().expect("Failed to load settings");
        assert!(settings.pool_size > 0);
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let settings = Settings {
            pool_size: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            backend: "festival".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bus_names_follow_backend() {
        let settings = Settings::default();
        assert_eq!(settings.bus_name(), "ai.piper.Speech.Provider");
        assert_eq!(settings.object_path(), "/ai/piper/Speech/Provider");

        let settings = Settings {
            backend: "espeak".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.object_path(), "/org/espeak/Speech/Provider");
    }

    #[test]
    fn test_relative_voices_dir() {
        let settings = Settings {
            voices_dir: "voices".to_string(),
            ..Settings::default()
        };
        let path = settings.voices_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("voices"));
    }
}
