use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{InputRole, TRANSLATIONS};
use crate::error::AppError;

/// A typed value held by a tree item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Text(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// A logic level, accepting only 0 or 1.
    pub fn as_level(&self) -> Option<u8> {
        match self.as_i64() {
            Some(0) => Some(0),
            Some(1) => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Display-text transform applied when an item is read as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    /// Translated state pair, `TRANSLATIONS[v / 2]` with `v % 2` picking a side.
    StateText,
    /// Input role label for a type ordinal.
    InputTypeText,
    /// Numeric value with a unit suffix.
    Quantity(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemUpdate {
    pub service: String,
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub value: Value,
    pub text: String,
    pub writable: bool,
}

struct Item {
    value: Value,
    writable: bool,
    text: TextFormat,
}

struct ServiceInner {
    name: String,
    items: RwLock<FxHashMap<String, Item>>,
}

struct BusInner {
    services: RwLock<FxHashMap<String, Arc<ServiceInner>>>,
    updates: broadcast::Sender<ItemUpdate>,
}

/// Hierarchical publish store: named services, each a map of paths to typed
/// items. Shared across threads; every value change is broadcast.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(broadcast_capacity);
        Self {
            inner: Arc::new(BusInner {
                services: RwLock::new(FxHashMap::default()),
                updates,
            }),
        }
    }

    /// Register a service; the returned handle owns it and removes it on drop.
    pub fn register(&self, name: &str) -> Service {
        let svc = Arc::new(ServiceInner {
            name: name.to_string(),
            items: RwLock::new(FxHashMap::default()),
        });
        self.inner
            .services
            .write()
            .insert(name.to_string(), svc.clone());
        Service {
            inner: svc,
            bus: self.inner.clone(),
        }
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.inner.services.read().contains_key(name)
    }

    pub fn service_names(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .services
            .read()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn get(&self, service: &str, path: &str) -> Option<Value> {
        let svc = self.inner.services.read().get(service)?.clone();
        let items = svc.items.read();
        items.get(path).map(|i| i.value.clone())
    }

    pub fn get_text(&self, service: &str, path: &str) -> Option<String> {
        let svc = self.inner.services.read().get(service)?.clone();
        let items = svc.items.read();
        items.get(path).map(|i| format_text(i))
    }

    pub fn is_writable(&self, service: &str, path: &str) -> Option<bool> {
        let svc = self.inner.services.read().get(service)?.clone();
        let items = svc.items.read();
        items.get(path).map(|i| i.writable)
    }

    pub fn snapshot(&self, service: &str) -> Option<FxHashMap<String, ItemView>> {
        let svc = self.inner.services.read().get(service)?.clone();
        let items = svc.items.read();
        Some(
            items
                .iter()
                .map(|(path, item)| {
                    (
                        path.clone(),
                        ItemView {
                            value: item.value.clone(),
                            text: format_text(item),
                            writable: item.writable,
                        },
                    )
                })
                .collect(),
        )
    }

    /// Set a path on another service, creating the item when absent. The
    /// target service must exist; peers that are not running are an error
    /// the caller is expected to log and move on from.
    pub fn set_remote(
        &self,
        service: &str,
        path: &str,
        value: impl Into<Value>,
    ) -> Result<(), AppError> {
        let svc = self
            .inner
            .services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| AppError::NotFoundService(service.to_string()))?;

        let value = value.into();
        {
            let mut items = svc.items.write();
            let item = items.entry(path.to_string()).or_insert(Item {
                value: value.clone(),
                writable: false,
                text: TextFormat::Plain,
            });
            if item.value == value {
                return Ok(());
            }
            item.value = value.clone();
        }
        let _ = self.inner.updates.send(ItemUpdate {
            service: svc.name.clone(),
            path: path.to_string(),
            value,
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemUpdate> {
        self.inner.updates.subscribe()
    }
}

fn format_text(item: &Item) -> String {
    match item.text {
        TextFormat::Plain => item.value.to_string(),
        TextFormat::StateText => {
            let v = item.value.as_u32().unwrap_or(0) as usize;
            match TRANSLATIONS.get(v / 2) {
                Some(&(no, yes)) => (if v % 2 == 0 { no } else { yes }).to_string(),
                None => item.value.to_string(),
            }
        }
        TextFormat::InputTypeText => item
            .value
            .as_u32()
            .and_then(|v| u8::try_from(v).ok())
            .and_then(InputRole::from_id)
            .map(|r| r.label().to_string())
            .unwrap_or_else(|| item.value.to_string()),
        TextFormat::Quantity(unit) => format!("{} {unit}", item.value),
    }
}

/// Owning handle for one registered service.
pub struct Service {
    inner: Arc<ServiceInner>,
    bus: Arc<BusInner>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_path(&self, path: &str, value: impl Into<Value>) {
        self.add_path_with(path, value, false, TextFormat::Plain);
    }

    pub fn add_path_with(
        &self,
        path: &str,
        value: impl Into<Value>,
        writable: bool,
        text: TextFormat,
    ) {
        self.inner.items.write().insert(
            path.to_string(),
            Item {
                value: value.into(),
                writable,
                text,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.items.read().get(path).map(|i| i.value.clone())
    }

    pub fn get_u32(&self, path: &str) -> u32 {
        self.get(path).and_then(|v| v.as_u32()).unwrap_or(0)
    }

    /// Update an item; a no-op for unknown paths and unchanged values.
    pub fn set(&self, path: &str, value: impl Into<Value>) {
        let value = value.into();
        {
            let mut items = self.inner.items.write();
            let Some(item) = items.get_mut(path) else {
                return;
            };
            if item.value == value {
                return;
            }
            item.value = value.clone();
        }
        let _ = self.bus.updates.send(ItemUpdate {
            service: self.inner.name.clone(),
            path: path.to_string(),
            value,
        });
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let mut services = self.bus.services.write();
        // Another handle may have re-registered the name in the meantime.
        let owned = services
            .get(&self.inner.name)
            .is_some_and(|current| Arc::ptr_eq(current, &self.inner));
        if owned {
            services.remove(&self.inner.name);
        }
    }
}
