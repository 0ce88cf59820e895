pub mod settings;

pub use settings::{
    BackpressureSettings, BridgeSettings, CleanupSettings, DispatchSettings, RedoSettings,
    RestartSettings, SubprocessSettings, TransportSettings,
};

use std::path::{Path, PathBuf};

use crate::error::{BridgeError, BridgeResult};

/// Environment variable overriding the settings file location.
pub const CONFIG_ENV_VAR: &str = "RESOLVER_BRIDGE_CONFIG";

/// Returns the path of the settings file, if one can be determined.
///
/// 1. `$RESOLVER_BRIDGE_CONFIG` when set
/// 2. `<config dir>/resolver-bridge/resolver-bridge.toml`
pub fn settings_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("resolver-bridge").join("resolver-bridge.toml"))
}

/// Parse and validate settings from TOML text.
pub fn parse_settings(text: &str) -> BridgeResult<BridgeSettings> {
    let settings: BridgeSettings =
        toml::from_str(text).map_err(|e| BridgeError::config(e.to_string()))?;
    settings.validate()
}

/// Load settings from a TOML file.
pub fn load_settings(path: &Path) -> BridgeResult<BridgeSettings> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::config(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_settings(&text)
}

/// Load settings from the default location, falling back to built-in defaults
/// when no file exists there.
pub fn load_default_settings() -> BridgeResult<BridgeSettings> {
    match settings_path() {
        Some(path) if path.exists() => {
            log::debug!(
                target: "resolver_bridge::config",
                "Loading settings from {}",
                path.display()
            );
            load_settings(&path)
        }
        _ => BridgeSettings::default().validate(),
    }
}
