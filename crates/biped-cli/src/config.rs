//! Robot configuration file – reads/writes `~/.biped/config.toml`.
//!
//! The file is a TOML rendering of [`RobotConfig`]; every field is optional.
//! Resolution order: built-in defaults, then the file, then `BIPED_*`
//! environment overrides, then command-line flags (applied by `main`).

use std::fs;
use std::path::{Path, PathBuf};

use biped_types::RobotConfig;

/// Return the path to `~/.biped/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".biped").join("config.toml")
}

/// Resolve the configuration to run with.
///
/// An explicit `path` must exist.  Without one, the default location is used
/// if present and built-in defaults otherwise.  The result has env overrides
/// applied and has been validated.
pub fn resolve(path: Option<&Path>) -> Result<RobotConfig, String> {
    let mut cfg = match path {
        Some(p) => load_from(p)?.ok_or_else(|| format!("config file {} not found", p.display()))?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

/// Load a config file.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<RobotConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `BIPED_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BIPED_TICK_PERIOD_MS` | `timing.tick_period_ms` |
/// | `BIPED_RETRY_BUDGET` | `bus.retry_budget` |
/// | `BIPED_SERIAL_PORT` | `bus.serial_port` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut RobotConfig) {
    if let Ok(v) = std::env::var("BIPED_TICK_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.timing.tick_period_ms = ms;
    }
    if let Ok(v) = std::env::var("BIPED_RETRY_BUDGET")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.bus.retry_budget = n;
    }
    if let Ok(v) = std::env::var("BIPED_SERIAL_PORT") {
        cfg.bus.serial_port = v;
    }
}

/// Save `cfg` to the default location, creating `~/.biped/` if necessary.
pub fn save(cfg: &RobotConfig) -> Result<PathBuf, String> {
    let path = config_path();
    save_to(cfg, &path)?;
    Ok(path)
}

pub(crate) fn save_to(cfg: &RobotConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only (rw-------): the file names the serial device we drive.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use biped_types::SafeStopAction;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&RobotConfig::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&RobotConfig::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, RobotConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robot.toml");
        fs::write(
            &path,
            "[timing]\ntick_period_ms = 10\n\n[safety]\nsafe_stop_action = \"hold_position\"\n",
        )
        .unwrap();
        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.timing.tick_period_ms, 10);
        assert_eq!(cfg.timing.max_consecutive_overruns, 5);
        assert_eq!(cfg.safety.safe_stop_action, SafeStopAction::HoldPosition);
        assert_eq!(cfg.joints.len(), 10);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn invalid_file_is_rejected_by_resolve() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robot.toml");
        fs::write(&path, "[timing]\npolicy_budget_fraction = 1.5\n").unwrap();
        assert!(resolve(Some(&path)).is_err());
    }

    #[test]
    fn config_path_points_to_biped_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".biped"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_tick_period() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("BIPED_TICK_PERIOD_MS", "10") };
        let mut cfg = RobotConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.timing.tick_period_ms, 10);
        unsafe { std::env::remove_var("BIPED_TICK_PERIOD_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_retry_budget() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("BIPED_RETRY_BUDGET", "many") };
        let mut cfg = RobotConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bus.retry_budget, 2);
        unsafe { std::env::remove_var("BIPED_RETRY_BUDGET") };
    }

    #[test]
    fn apply_env_overrides_changes_serial_port() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("BIPED_SERIAL_PORT", "/dev/ttyUSB1") };
        let mut cfg = RobotConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bus.serial_port, "/dev/ttyUSB1");
        unsafe { std::env::remove_var("BIPED_SERIAL_PORT") };
    }
}
