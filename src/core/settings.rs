use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, TrainerError};

pub const MAX_EPOCHS: &str = "Maximum number of training epochs";
pub const MAX_SAMPLES_PER_LABEL: &str = "Maximum number of samples per label";
pub const PATCH_HEIGHT: &str = "Patch height";
pub const PATCH_WIDTH: &str = "Patch width";
pub const MAX_TIME: &str = "Maximum time (D-HH:MM)";
pub const MAX_MEMORY_MB: &str = "Maximum memory (MB)";
pub const CPUS: &str = "CPUs";
pub const NOTIFICATION_EMAIL: &str = "Slurm Notification Email";

/// A scalar training hyperparameter as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Integer(value) => write!(f, "{}", value),
            SettingValue::Text(value) => write!(f, "{:?}", value),
        }
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Integer(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

pub type Settings = BTreeMap<String, SettingValue>;

#[derive(Debug, Clone, Copy)]
pub enum SettingKind {
    Integer { minimum: i64, default: i64 },
    Text { default: &'static str },
    Duration { default: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub name: &'static str,
    pub kind: SettingKind,
    pub required: bool,
}

impl SettingSpec {
    pub fn default_value(&self) -> SettingValue {
        match self.kind {
            SettingKind::Integer { default, .. } => SettingValue::Integer(default),
            SettingKind::Text { default } | SettingKind::Duration { default } => {
                SettingValue::Text(default.to_string())
            }
        }
    }

    fn check(&self, value: &SettingValue) -> Result<()> {
        match (self.kind, value) {
            (SettingKind::Integer { minimum, .. }, SettingValue::Integer(v)) if *v < minimum => {
                Err(TrainerError::Validation(format!(
                    "setting '{}' must be at least {}, got {}",
                    self.name, minimum, v
                )))
            }
            (SettingKind::Integer { .. }, SettingValue::Integer(_)) => Ok(()),
            (SettingKind::Text { .. }, SettingValue::Text(_)) => Ok(()),
            (SettingKind::Duration { .. }, SettingValue::Text(v)) if is_slurm_duration(v) => Ok(()),
            (SettingKind::Duration { .. }, SettingValue::Text(v)) => Err(TrainerError::Validation(
                format!("setting '{}' must look like D-HH:MM, got {:?}", self.name, v),
            )),
            (_, other) => Err(TrainerError::Validation(format!(
                "setting '{}' has the wrong type: {}",
                self.name, other
            ))),
        }
    }
}

/// Hyperparameters the cluster side accepts, with their bounds and defaults.
pub static SETTINGS_SCHEMA: Lazy<BTreeMap<&'static str, SettingSpec>> = Lazy::new(|| {
    [
        SettingSpec {
            name: MAX_EPOCHS,
            kind: SettingKind::Integer { minimum: 1, default: 10 },
            required: true,
        },
        SettingSpec {
            name: PATCH_HEIGHT,
            kind: SettingKind::Integer { minimum: 64, default: 256 },
            required: true,
        },
        SettingSpec {
            name: PATCH_WIDTH,
            kind: SettingKind::Integer { minimum: 64, default: 256 },
            required: true,
        },
        SettingSpec {
            name: MAX_SAMPLES_PER_LABEL,
            kind: SettingKind::Integer { minimum: 100, default: 2000 },
            required: false,
        },
        SettingSpec {
            name: MAX_TIME,
            kind: SettingKind::Duration { default: "0-06:00" },
            required: false,
        },
        SettingSpec {
            name: MAX_MEMORY_MB,
            kind: SettingKind::Integer { minimum: 1024, default: 32768 },
            required: false,
        },
        SettingSpec {
            name: CPUS,
            kind: SettingKind::Integer { minimum: 1, default: 6 },
            required: false,
        },
        SettingSpec {
            name: NOTIFICATION_EMAIL,
            kind: SettingKind::Text { default: "" },
            required: false,
        },
    ]
    .into_iter()
    .map(|spec| (spec.name, spec))
    .collect()
});

/// Required settings filled with their defaults.
pub fn default_settings() -> Settings {
    SETTINGS_SCHEMA
        .values()
        .filter(|spec| spec.required)
        .map(|spec| (spec.name.to_string(), spec.default_value()))
        .collect()
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    for (name, value) in settings {
        let spec = SETTINGS_SCHEMA
            .get(name.as_str())
            .ok_or_else(|| TrainerError::Validation(format!("unknown setting '{}'", name)))?;
        spec.check(value)?;
    }

    if let Some(missing) = SETTINGS_SCHEMA
        .values()
        .find(|spec| spec.required && !settings.contains_key(spec.name))
    {
        return Err(TrainerError::Validation(format!(
            "missing required setting '{}'",
            missing.name
        )));
    }
    Ok(())
}

// Slurm's `--time` in days-hours:minutes form.
fn is_slurm_duration(value: &str) -> bool {
    let Some((days, clock)) = value.split_once('-') else {
        return false;
    };
    let Some((hours, minutes)) = clock.split_once(':') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(days)
        && hours.len() == 2
        && minutes.len() == 2
        && digits(hours)
        && digits(minutes)
        && hours.parse::<u8>().map_or(false, |h| h < 24)
        && minutes.parse::<u8>().map_or(false, |m| m < 60)
}
