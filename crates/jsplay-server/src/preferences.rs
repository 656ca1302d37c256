//! Editor preferences persisted as a small JSON file.
//!
//! Loading is lenient: a missing or unreadable file gives the defaults, an
//! unknown theme becomes `dracula`, and the font size is clamped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Smallest accepted editor font size.
pub const MIN_FONT_SIZE: u32 = 8;
/// Largest accepted editor font size.
pub const MAX_FONT_SIZE: u32 = 48;

/// Editor color theme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Theme {
    /// The default dark theme.
    #[default]
    Dracula,
    /// Atom One Dark.
    OneDark,
    /// Material Ocean.
    MaterialOcean,
    /// Visual Studio light.
    VsLight,
}

impl Theme {
    /// Parse a persisted theme name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "dracula" => Some(Self::Dracula),
            "one-dark" => Some(Self::OneDark),
            "material-ocean" => Some(Self::MaterialOcean),
            "vs-light" => Some(Self::VsLight),
            _ => None,
        }
    }
}

/// The preferences the UI edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Editor font size in points.
    pub font_size: u32,
    /// Whether editor autocompletion is on.
    pub autocomplete: bool,
    /// Editor theme.
    pub theme: Theme,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            font_size: 16,
            autocomplete: true,
            theme: Theme::Dracula,
        }
    }
}

impl Preferences {
    /// Build preferences from loosely-typed JSON, falling back to the
    /// default for every field that is missing or invalid.
    pub fn from_json(value: &Value) -> Self {
        let defaults = Self::default();
        let font_size = value
            .get("fontSize")
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite())
            .map(|n| n.round().clamp(MIN_FONT_SIZE as f64, MAX_FONT_SIZE as f64) as u32)
            .unwrap_or(defaults.font_size);
        let autocomplete = value
            .get("autocomplete")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.autocomplete);
        let theme = value
            .get("theme")
            .and_then(Value::as_str)
            .and_then(Theme::parse)
            .unwrap_or(defaults.theme);
        Self {
            font_size,
            autocomplete,
            theme,
        }
    }
}

/// File-backed preferences.
#[derive(Debug, Clone)]
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    /// A store over `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current preferences; defaults when the file is missing or unreadable.
    pub fn get(&self) -> Preferences {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Preferences::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "preferences: read failed");
                return Preferences::default();
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Preferences::from_json(&value),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "preferences: corrupt file, using defaults");
                Preferences::default()
            }
        }
    }

    /// Persist `preferences`. Returns `false` if the write failed.
    pub fn save(&self, preferences: &Preferences) -> bool {
        match self.write(preferences) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "preferences: saved");
                true
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "preferences: save failed");
                false
            }
        }
    }

    /// Overwrite the file with the defaults.
    pub fn reset(&self) -> bool {
        self.save(&Preferences::default())
    }

    /// Write to a sibling temp file, then rename over the target.
    fn write(&self, preferences: &Preferences) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(preferences)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}
