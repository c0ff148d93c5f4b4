// Kbdlay Settings Module
// Engine and device defaults loaded from a TOML file

#![cfg(feature = "settings-file")]

use std::path::{Path, PathBuf};

use crate::device::{DeviceState, Role};
use crate::transform::{EngineConfig, ModifierPolicy, MIN_RELAY_CAPACITY};

/// Settings that shape the engine and newly attached devices
///
/// Loaded from a TOML file (default: ~/.config/kbdlay/settings.toml):
///
/// ```toml
/// [engine]
/// modifier_policy = "bypass-on-chord"
///
/// [relay]
/// capacity = 128
///
/// [defaults]
/// role = "none"
/// state = "bypass-hard"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    modifier_policy: ModifierPolicy,
    relay_capacity: usize,
    default_role: Role,
    default_state: DeviceState,
    /// Path to the settings file (for reload)
    source_path: Option<PathBuf>,
}

/// Errors that can occur when loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid setting value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    #[serde(default)]
    engine: Option<EngineSection>,
    #[serde(default)]
    relay: Option<RelaySection>,
    #[serde(default)]
    defaults: Option<DefaultsSection>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EngineSection {
    #[serde(default)]
    modifier_policy: Option<ModifierPolicy>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelaySection {
    #[serde(default)]
    capacity: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DefaultsSection {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    state: Option<DeviceState>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// Settings matching `EngineConfig::default()`
    pub fn new() -> Self {
        let config = EngineConfig::default();
        Self {
            modifier_policy: config.modifier_policy,
            relay_capacity: config.relay_capacity,
            default_role: config.default_role,
            default_state: config.default_state,
            source_path: None,
        }
    }

    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(&path)?;
        let mut settings = Self::from_toml(&content)?;
        settings.source_path = Some(path.as_ref().to_path_buf());
        log::debug!("Loaded settings from {}", path.as_ref().display());
        Ok(settings)
    }

    /// Load settings from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let parsed: SettingsToml =
            toml::from_str(content).map_err(|e| SettingsError::TomlParse(e.to_string()))?;

        let mut settings = Self::new();

        if let Some(policy) = parsed.engine.and_then(|engine| engine.modifier_policy) {
            settings.modifier_policy = policy;
        }

        if let Some(capacity) = parsed.relay.and_then(|relay| relay.capacity) {
            settings.relay_capacity = parse_capacity(capacity)?;
        }

        if let Some(defaults) = parsed.defaults {
            if let Some(role) = defaults.role {
                settings.default_role = role;
            }
            if let Some(state) = defaults.state {
                settings.default_state = state;
            }
        }

        Ok(settings)
    }

    /// Get the default settings path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kbdlay").join("settings.toml"))
    }

    /// Load from default location (~/.config/kbdlay/settings.toml)
    pub fn load_default() -> Result<Self, SettingsError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::from_file(path);
            }
        }
        Ok(Self::new())
    }

    /// Reload settings from the original file
    pub fn reload(&mut self) -> Result<(), SettingsError> {
        match self.source_path {
            Some(ref path) => {
                *self = Self::from_file(path)?;
                Ok(())
            }
            None => Err(SettingsError::InvalidValue("No source path set".to_string())),
        }
    }

    pub fn modifier_policy(&self) -> ModifierPolicy {
        self.modifier_policy
    }

    pub fn relay_capacity(&self) -> usize {
        self.relay_capacity
    }

    pub fn default_role(&self) -> Role {
        self.default_role
    }

    pub fn default_state(&self) -> DeviceState {
        self.default_state
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Build the engine configuration these settings describe
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            modifier_policy: self.modifier_policy,
            relay_capacity: self.relay_capacity,
            default_role: self.default_role,
            default_state: self.default_state,
        }
    }
}

fn parse_capacity(value: i64) -> Result<usize, SettingsError> {
    usize::try_from(value)
        .ok()
        .filter(|capacity| *capacity >= MIN_RELAY_CAPACITY)
        .ok_or_else(|| {
            SettingsError::InvalidValue(format!(
                "relay capacity {} is below the minimum of {}",
                value, MIN_RELAY_CAPACITY
            ))
        })
}

/// Create default settings content for a new installation
pub fn default_settings_content() -> &'static str {
    r#"# Kbdlay Settings
# Place this file at: ~/.config/kbdlay/settings.toml

[engine]
# "permissive": rules apply while Ctrl/Alt/Win are held
# "bypass-on-chord": held Ctrl/Alt/Win pass keys through unchanged
modifier_policy = "permissive"

[relay]
# Events staged per delivery to the upstream consumer (minimum 3)
capacity = 256

[defaults]
# Applied to newly attached devices
# role: "none", "base" or "remap"
role = "none"
# state: "bypass-hard", "bypass-soft" or "active"
state = "bypass-hard"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = Settings::new();
        assert_eq!(settings.to_engine_config(), EngineConfig::default());
        assert!(settings.source_path().is_none());
    }

    #[test]
    fn test_settings_from_toml() {
        let toml = r#"
[engine]
modifier_policy = "bypass-on-chord"

[relay]
capacity = 64

[defaults]
role = "remap"
state = "bypass-soft"
"#;
        let settings = Settings::from_toml(toml).unwrap();
        assert_eq!(settings.modifier_policy(), ModifierPolicy::BypassOnChord);
        assert_eq!(settings.relay_capacity(), 64);
        assert_eq!(settings.default_role(), Role::Remap);
        assert_eq!(settings.default_state(), DeviceState::BypassSoft);
    }

    #[test]
    fn test_default_content_parses() {
        let settings = Settings::from_toml(default_settings_content()).unwrap();
        assert_eq!(settings, Settings::new());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml("[relay]\ncapacity = 16\n").unwrap();
        assert_eq!(settings.relay_capacity(), 16);
        assert_eq!(settings.modifier_policy(), ModifierPolicy::Permissive);
        assert_eq!(settings.default_state(), DeviceState::BypassHard);
    }

    #[test]
    fn test_rejects_small_capacity() {
        let err = Settings::from_toml("[relay]\ncapacity = 2\n").unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
        let err = Settings::from_toml("[relay]\ncapacity = -1\n").unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn test_rejects_unknown_role_and_policy() {
        let err = Settings::from_toml("[defaults]\nrole = \"jis\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
        let err = Settings::from_toml("[defaults]\nstate = \"on\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
        let err = Settings::from_toml("[engine]\nmodifier_policy = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
    }

    #[test]
    fn test_enum_fields_share_kebab_case_names() {
        // every name the default file documents must deserialize
        for (name, role) in [("none", Role::None), ("base", Role::Base), ("remap", Role::Remap)] {
            let toml = format!("[defaults]\nrole = \"{}\"\n", name);
            assert_eq!(Settings::from_toml(&toml).unwrap().default_role(), role);
            assert_eq!(<&'static str>::from(role), name);
        }
        for state in [DeviceState::BypassHard, DeviceState::BypassSoft, DeviceState::Active] {
            let toml = format!("[defaults]\nstate = \"{}\"\n", state);
            assert_eq!(Settings::from_toml(&toml).unwrap().default_state(), state);
        }
        // serde names are exact, like modifier_policy
        let err = Settings::from_toml("[defaults]\nrole = \"Remap\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
        let err = Settings::from_toml("[engine]\nmodifier_policy = \"Permissive\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = Settings::from_toml("[relay]\nsize = 4\n").unwrap_err();
        assert!(matches!(err, SettingsError::TomlParse(_)));
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let err = Settings::from_file("/nonexistent/kbdlay/settings.toml").unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
