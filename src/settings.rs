use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::bus::Value;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct SettingSpec {
    pub default: Value,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Emitted on every accepted `set`, including writes that keep the value
/// unchanged; consumers are expected to compare old and new themselves.
#[derive(Debug, Clone)]
pub struct SettingChange {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

struct StoreInner {
    values: RwLock<FxHashMap<String, Value>>,
    specs: RwLock<FxHashMap<String, SettingSpec>>,
    file: Option<PathBuf>,
    events: mpsc::UnboundedSender<SettingChange>,
}

/// Key/value settings backed by a JSON file. The file is the persistence
/// target for counters and the sole source of truth for configuration.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

impl SettingsStore {
    pub fn new(file: Option<PathBuf>) -> (Self, mpsc::UnboundedReceiver<SettingChange>) {
        let mut values = FxHashMap::default();
        if let Some(path) = file.as_ref()
            && let Ok(contents) = fs::read_to_string(path)
        {
            match serde_json::from_str::<FxHashMap<String, Value>>(&contents) {
                Ok(loaded) => values = loaded,
                Err(e) => warn!("ignoring unreadable settings file {}: {e}", path.display()),
            }
        }

        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(StoreInner {
                    values: RwLock::new(values),
                    specs: RwLock::new(FxHashMap::default()),
                    file,
                    events,
                }),
            },
            rx,
        )
    }

    /// Declare a setting; a value already present (a previous run) wins over
    /// the default. Returns the effective value.
    pub fn declare(
        &self,
        path: &str,
        default: Value,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Value {
        self.inner
            .specs
            .write()
            .insert(path.to_string(), SettingSpec { default: default.clone(), min, max });
        self.inner
            .values
            .write()
            .entry(path.to_string())
            .or_insert(default)
            .clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.values.read().get(path).cloned()
    }

    /// Set a declared setting. Out-of-range writes are rejected and leave
    /// the stored value untouched.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), AppError> {
        let value = value.into();
        let spec = self
            .inner
            .specs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::Settings(format!("setting {path} not declared")))?;

        if let Some(v) = value.as_f64() {
            if spec.min.is_some_and(|min| v < min) || spec.max.is_some_and(|max| v > max) {
                return Err(AppError::InvalidValue(format!(
                    "value {value} out of range for {path}"
                )));
            }
        }

        let old = {
            let mut values = self.inner.values.write();
            values
                .insert(path.to_string(), value.clone())
                .unwrap_or(spec.default)
        };
        self.persist();

        let _ = self.inner.events.send(SettingChange {
            path: path.to_string(),
            old,
            new: value,
        });
        Ok(())
    }

    /// Write-through to disk; failure is logged, never fatal.
    fn persist(&self) {
        let Some(path) = self.inner.file.as_ref() else {
            return;
        };
        let contents = {
            let values = self.inner.values.read();
            match serde_json::to_string_pretty(&*values) {
                Ok(s) => s,
                Err(e) => {
                    error!("cannot serialize settings: {e}");
                    return;
                }
            }
        };
        let tmp = path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, contents).and_then(|_| fs::rename(&tmp, path)) {
            error!("cannot persist settings to {}: {e}", path.display());
        }
    }
}

/// Per-pin alias view over the store, mirroring the declaration order of the
/// pin's supported settings.
#[derive(Clone)]
pub struct SettingsDevice {
    store: SettingsStore,
    aliases: FxHashMap<&'static str, String>,
}

impl SettingsDevice {
    pub fn new(store: SettingsStore) -> Self {
        Self {
            store,
            aliases: FxHashMap::default(),
        }
    }

    pub fn add_setting(
        &mut self,
        alias: &'static str,
        path: String,
        default: Value,
        min: Option<f64>,
        max: Option<f64>,
    ) {
        self.store.declare(&path, default, min, max);
        self.aliases.insert(alias, path);
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.aliases.iter().map(|(alias, path)| (*alias, path.as_str()))
    }

    pub fn path_of(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn get(&self, alias: &str) -> Option<Value> {
        self.store.get(self.aliases.get(alias)?)
    }

    pub fn get_u32(&self, alias: &str) -> u32 {
        self.get(alias).and_then(|v| v.as_u32()).unwrap_or(0)
    }

    pub fn get_f64(&self, alias: &str) -> f64 {
        self.get(alias).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn get_bool(&self, alias: &str) -> bool {
        self.get_u32(alias) != 0
    }

    pub fn get_str(&self, alias: &str) -> String {
        self.get(alias)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn set(&self, alias: &str, value: impl Into<Value>) -> Result<(), AppError> {
        let path = self
            .aliases
            .get(alias)
            .ok_or_else(|| AppError::Settings(format!("unknown setting alias {alias}")))?;
        self.store.set(path, value)
    }
}
