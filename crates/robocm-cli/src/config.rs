//! Configuration Vault – reads/writes `~/.robocm/config.toml`.
//!
//! ```toml
//! agent_id = "agent://www.arbi.com/ContextManager"
//! listen_addr = "127.0.0.1:61120"
//! database_path = "/var/lib/robocm/kb.sqlite"   # omit for an in-memory store
//! gateway_timeout_ms = 2000
//! bus_capacity = 256
//!
//! [retention]
//! remove_threshold = 10
//! remove_span = 10
//! max_entities = 50
//!
//! [retention_overrides.object]
//! remove_threshold = 4
//! remove_span = 2
//! max_entities = 200
//!
//! [aliases]
//! AMR_LIFT1 = "AMR_Lift01"
//! AMR_LIFT2 = "AMR_Lift02"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use robocm_memory::{RetentionSettings, RetentionWindowIndex};
use robocm_perception::AliasTable;
use robocm_types::{CmError, EntityClass};
use serde::{Deserialize, Serialize};

/// Persisted deployment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity the context manager uses on the broker.
    pub agent_id: String,
    /// WebSocket broker-bridge address.
    pub listen_addr: SocketAddr,
    /// SQLite knowledge-base file; in-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Bound on every knowledge-base call.
    pub gateway_timeout_ms: u64,
    /// Buffered events per bus topic.
    pub bus_capacity: usize,
    /// Retention applied to every class without an override.
    pub retention: RetentionSettings,
    /// Per-class retention, keyed by class key (e.g. `robot_body`).
    pub retention_overrides: BTreeMap<String, RetentionSettings>,
    /// Wire name → canonical entity id.
    pub aliases: AliasTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: "agent://www.arbi.com/ContextManager".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 61120)),
            database_path: None,
            gateway_timeout_ms: 2000,
            bus_capacity: 256,
            retention: RetentionSettings::default(),
            retention_overrides: BTreeMap::new(),
            aliases: AliasTable::reference_deployment(),
        }
    }
}

impl Config {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Check everything that cannot be expressed in the TOML types.
    pub fn validate(&self) -> Result<(), CmError> {
        if self.bus_capacity == 0 {
            return Err(CmError::Config("bus_capacity must be at least 1".into()));
        }
        if self.gateway_timeout_ms == 0 {
            return Err(CmError::Config("gateway_timeout_ms must be at least 1".into()));
        }
        self.retention.validate()?;
        self.overrides().map(|_| ())
    }

    /// Overrides keyed by parsed class.
    pub fn overrides(&self) -> Result<HashMap<EntityClass, RetentionSettings>, CmError> {
        self.retention_overrides
            .iter()
            .map(|(key, settings)| Ok((key.parse::<EntityClass>()?, *settings)))
            .collect()
    }

    /// Build the retention index this configuration describes.
    pub fn retention_index(&self) -> Result<RetentionWindowIndex, CmError> {
        RetentionWindowIndex::with_overrides(self.retention, &self.overrides()?)
    }
}

/// Return the path to `~/.robocm/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".robocm").join("config.toml")
}

/// Load `path` (defaults when missing), then apply environment overrides.
pub fn load(path: &Path) -> Result<Config, CmError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the file at `path`.  `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, CmError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| CmError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| CmError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `ROBOCM_*` environment overrides.  Unparsable values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROBOCM_LISTEN_ADDR` | `listen_addr` |
/// | `ROBOCM_DB_PATH` | `database_path` |
/// | `ROBOCM_AGENT_ID` | `agent_id` |
/// | `ROBOCM_REMOVE_THRESHOLD` | `retention.remove_threshold` |
/// | `ROBOCM_REMOVE_SPAN` | `retention.remove_span` |
/// | `ROBOCM_GATEWAY_TIMEOUT_MS` | `gateway_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("ROBOCM_LISTEN_ADDR")
        && let Ok(addr) = v.parse()
    {
        cfg.listen_addr = addr;
    }
    if let Some(v) = var("ROBOCM_DB_PATH") {
        cfg.database_path = Some(v);
    }
    if let Some(v) = var("ROBOCM_AGENT_ID") {
        cfg.agent_id = v;
    }
    if let Some(v) = var("ROBOCM_REMOVE_THRESHOLD")
        && let Ok(n) = v.parse()
    {
        cfg.retention.remove_threshold = n;
    }
    if let Some(v) = var("ROBOCM_REMOVE_SPAN")
        && let Ok(n) = v.parse()
    {
        cfg.retention.remove_span = n;
    }
    if let Some(v) = var("ROBOCM_GATEWAY_TIMEOUT_MS")
        && let Ok(n) = v.parse()
    {
        cfg.gateway_timeout_ms = n;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), CmError> {
    let io_err = |what: &str, e: std::io::Error| CmError::Config(format!("{what} {}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to restrict directory for", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| CmError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err("failed to write", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err("failed to write", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr.port(), 61120);
        assert_eq!(cfg.retention, RetentionSettings::default());
        assert_eq!(cfg.aliases.resolve("AMR_LIFT2"), "AMR_Lift02");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.database_path = Some("/tmp/kb.sqlite".into());
        cfg.retention_overrides.insert(
            "object".into(),
            RetentionSettings {
                remove_threshold: 4,
                remove_span: 2,
                max_entities: 200,
            },
        );
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "gateway_timeout_ms = 500\n[retention]\nremove_span = 5\n").unwrap();

        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.gateway_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.retention.remove_span, 5);
        assert_eq!(cfg.retention.remove_threshold, 10);
        assert_eq!(cfg.bus_capacity, 256);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "listen_addr = 42").unwrap();
        assert!(matches!(load_from(&path), Err(CmError::Config(_))));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn unknown_override_class_fails_validation() {
        let mut cfg = Config::default();
        cfg.retention_overrides.insert("forklift".into(), RetentionSettings::default());
        assert!(matches!(cfg.validate(), Err(CmError::Config(_))));
    }

    #[test]
    fn zero_retention_fails_validation() {
        let mut cfg = Config::default();
        cfg.retention.remove_threshold = 0;
        assert!(cfg.validate().is_err());
        assert!(cfg.retention_index().is_err());
    }

    #[test]
    fn overrides_reach_the_retention_index() {
        let mut cfg = Config::default();
        cfg.retention_overrides.insert(
            "robot_left_finger_2".into(),
            RetentionSettings {
                remove_threshold: 3,
                remove_span: 1,
                max_entities: 1,
            },
        );
        let index = cfg.retention_index().unwrap();
        let finger = "robot_left_finger_2".parse::<EntityClass>().unwrap();
        assert_eq!(index.settings(finger).unwrap().remove_threshold, 3);
        assert_eq!(index.settings(EntityClass::Joint), Some(RetentionSettings::default()));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ROBOCM_LISTEN_ADDR", "0.0.0.0:7000"),
            ("ROBOCM_DB_PATH", "/data/kb.sqlite"),
            ("ROBOCM_AGENT_ID", "agent://lab/cm"),
            ("ROBOCM_REMOVE_THRESHOLD", "not-a-number"),
            ("ROBOCM_REMOVE_SPAN", "4"),
            ("ROBOCM_GATEWAY_TIMEOUT_MS", "750"),
        ]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.listen_addr, "0.0.0.0:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.database_path.as_deref(), Some("/data/kb.sqlite"));
        assert_eq!(cfg.agent_id, "agent://lab/cm");
        assert_eq!(cfg.retention.remove_threshold, 10);
        assert_eq!(cfg.retention.remove_span, 4);
        assert_eq!(cfg.gateway_timeout_ms, 750);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn config_path_points_to_robocm_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.ends_with(".robocm/config.toml"));
    }
}
