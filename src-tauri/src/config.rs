use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Defaults compiled into the binary so a shipped app needs no YAML on disk.
const DEFAULT_CONFIG: &str = include_str!("../global_config.yaml");

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_dev_env")]
    pub dev_env: String,
    pub window: WindowConfig,
    pub protocol: ProtocolSection,
    pub archive: ArchiveConfig,
    pub logging: LoggingConfig,
}

fn default_dev_env() -> String {
    "dev".to_string()
}

/// The subset of the configuration the page may read via `get_app_config`.
/// Leaves out the archive location and cipher settings.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub dev_env: String,
    pub window: WindowConfig,
    pub protocol: ProtocolSection,
}

impl From<&AppConfig> for FrontendConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dev_env: config.dev_env.clone(),
            window: config.window.clone(),
            protocol: config.protocol.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub width: f64,
    pub height: f64,
    #[serde(default = "true_default")]
    pub center: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProtocolSection {
    pub scheme: String,
    pub host: String,
    pub entry: String,
}

impl From<&ProtocolSection> for engine::ProtocolConfig {
    fn from(p: &ProtocolSection) -> Self {
        Self {
            scheme: p.scheme.clone(),
            host: p.host.clone(),
            entry: p.entry.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub path: String,
    pub iv: String,
    /// Attach the embedded key. Off only for unencrypted development archives.
    #[serde(default = "true_default")]
    pub encrypted: bool,
}

impl ArchiveConfig {
    pub fn override_path(&self) -> Option<PathBuf> {
        let p = self.path.trim();
        (!p.is_empty()).then(|| PathBuf::from(p))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    pub location: LoggingLocationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLocationConfig {
    pub show_file: bool,
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
    pub critical: bool,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

static CONFIG: RwLock<Option<&'static AppConfig>> = RwLock::new(None);

/// Load once and hand out a process-wide reference. A config that fails to
/// parse is fatal at startup.
pub fn get_config() -> &'static AppConfig {
    if let Some(cfg) = *CONFIG.read().unwrap_or_else(|e| e.into_inner()) {
        return cfg;
    }

    let mut write = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    if let Some(cfg) = *write {
        return cfg;
    }

    let cfg = Box::leak(Box::new(
        load_config().unwrap_or_else(|e| panic!("Failed to load configuration: {}", e)),
    ));
    *write = Some(cfg);
    cfg
}

#[cfg(test)]
pub fn reset_config() {
    let mut write = CONFIG.write().unwrap();
    *write = None;
}

/// Prefer the file beside Cargo.toml, fall back to the repo-root layout.
fn config_file(base: &Path, name: &str) -> PathBuf {
    let direct = base.join(name);
    if direct.exists() {
        direct
    } else {
        Path::new("src-tauri").join(name)
    }
}

fn load_config() -> Result<AppConfig, ConfigError> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let base = Path::new(&manifest_dir);

    Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml))
        .add_source(File::from(config_file(base, "global_config.yaml")).required(false))
        .add_source(File::from(config_file(base, "production_config.yaml")).required(false))
        .add_source(File::from(config_file(base, ".global_config.yaml")).required(false))
        // APP__ARCHIVE__PATH=/tmp/app.asar, APP__LOGGING__LEVELS__DEBUG=true
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard(&'static str);
    impl EnvGuard {
        fn new(key: &'static str, val: &str) -> Self {
            reset_config();
            env::set_var(key, val);
            Self(key)
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.0);
            reset_config();
        }
    }

    #[test]
    #[serial]
    fn test_load_config_defaults() {
        let config = load_config();
        assert!(config.is_ok(), "Failed to load config: {:?}", config.err());

        let config = config.unwrap();
        assert_eq!(config.window.title, "muban");
        assert_eq!(config.window.width, 400.0);
        assert_eq!(config.window.height, 200.0);
        assert_eq!(config.protocol.scheme, "muban");
        assert_eq!(config.protocol.entry, "index.html");
        assert_eq!(config.archive.iv, "yue is good lib!");
        assert!(config.archive.override_path().is_none());
    }

    #[test]
    #[serial]
    fn test_embedded_defaults_parse_alone() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.protocol.host, "app");
        assert!(config.archive.encrypted);
    }

    #[test]
    #[serial]
    fn test_env_var_override_precedence() {
        let _guard = EnvGuard::new("APP__ARCHIVE__PATH", "/tmp/dev/app.asar");

        let config = load_config().expect("Should load config");
        assert_eq!(
            config.archive.override_path(),
            Some(PathBuf::from("/tmp/dev/app.asar"))
        );
    }

    #[test]
    #[serial]
    fn test_type_coercion() {
        {
            let _guard = EnvGuard::new("APP__LOGGING__LEVELS__DEBUG", "true");
            let config = load_config().expect("Should load config");
            assert!(config.logging.levels.debug);
        }
        {
            let _guard = EnvGuard::new("APP__WINDOW__WIDTH", "640");
            let config = load_config().expect("Should load config");
            assert_eq!(config.window.width, 640.0);
        }
    }

    #[test]
    #[serial]
    fn test_get_config_is_cached_until_reset() {
        reset_config();
        let a = get_config() as *const AppConfig;
        let b = get_config() as *const AppConfig;
        assert_eq!(a, b);
        reset_config();
    }

    #[test]
    #[serial]
    fn test_frontend_config_sanitization() {
        let _guard = EnvGuard::new("APP__ARCHIVE__PATH", "/secret/location/app.asar");
        let config = load_config().expect("Should load config");

        let json = serde_json::to_string(&FrontendConfig::from(&config)).unwrap();
        assert!(!json.contains("/secret/location"));
        assert!(!json.contains("yue is good lib!"));
        assert!(json.contains("\"scheme\":\"muban\""));
    }

    #[test]
    fn test_protocol_section_converts() {
        let section = ProtocolSection {
            scheme: "muban".into(),
            host: "app".into(),
            entry: "main.html".into(),
        };
        let cfg = engine::ProtocolConfig::from(&section);
        assert_eq!(cfg.entry, "main.html");
    }
}
