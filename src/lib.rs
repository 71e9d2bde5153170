pub mod backend;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod pulse;
pub mod relay;
pub mod routes;
pub mod settings;

pub use bus::{Bus, ItemUpdate, Service, TextFormat, Value};
pub use config::{INPUT_ROLES, InputDecl, InputRole, IoKind, PinDecl, RELAY_ROLES, RelayDecl, RelayRole};
pub use controller::{Controller, SAVE_INTERVAL, WriteRequest};
pub use error::AppError;
pub use handler::{Handler, HandlerCtx, MAX_COUNT, Registry, TOUCH_ENABLED_PATH};
pub use pulse::{DebugSource, EdgeSource, PollingSource, PulseEvent, PulseSource};
pub use relay::{CHECK_INTERVAL, PULSE_LEN, Relay};
pub use routes::AppState;
pub use settings::{SettingChange, SettingsDevice, SettingsStore};

#[cfg(feature = "hardware-gpio")]
pub use backend::SysfsBackend;
pub use backend::{GpioBackend, MockBackend};
