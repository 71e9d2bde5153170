use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use log::warn;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time;

use crate::bus::{Bus, Service, TextFormat, Value};
use crate::config::{InputRole, IoKind, RelayRole};
use crate::relay::Relay;
use crate::settings::{SettingsDevice, SettingsStore};

/// Largest persisted counter value; the increment wraps past it to zero.
pub const MAX_COUNT: u32 = i32::MAX as u32;

/// Peers lose the generator selection when they reset, so it is rewritten
/// on a fixed cadence on top of the edge-driven updates.
pub const GENERATOR_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

pub const TOUCH_ENABLED_PATH: &str = "/Settings/Gui/TouchEnabled";

pub const PROCESS_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROCESS_VERSION: &str = env!("CARGO_PKG_VERSION");

const PRODUCT_ID_GENERIC: i64 = 0xFFFF;
const PRODUCT_ID_PULSE_METER: i64 = 0xA165;
const PRODUCT_ID_DIGITAL_INPUT: i64 = 0xA166;

fn next_count(count: u32) -> u32 {
    (count + 1) & MAX_COUNT
}

fn input_product_name(role: InputRole) -> &'static str {
    match role {
        InputRole::Disabled => "Disabled",
        InputRole::PulseMeter => "Generic pulse meter",
        InputRole::Door => "Door alarm",
        InputRole::BilgePump => "Bilge pump",
        InputRole::BilgeAlarm => "Bilge alarm",
        InputRole::BurglarAlarm => "Burglar alarm",
        InputRole::SmokeAlarm => "Smoke alarm",
        InputRole::FireAlarm => "Fire alarm",
        InputRole::Co2Alarm => "CO2 alarm",
        InputRole::Generator => "Generator",
        InputRole::GenericIo => "Generic I/O",
        InputRole::TouchEnable => "TouchEnable",
    }
}

/// Index into the state translation pairs for each role.
fn translation_index(role: InputRole) -> u32 {
    match role {
        InputRole::BilgePump => 1,           // off, on
        InputRole::Door => 3,                // open, closed
        InputRole::BilgeAlarm
        | InputRole::BurglarAlarm
        | InputRole::SmokeAlarm
        | InputRole::FireAlarm
        | InputRole::Co2Alarm => 4,          // ok, alarm
        InputRole::Generator => 5,           // running, stopped
        _ => 0,                              // low, high
    }
}

fn relay_service_class(role: RelayRole) -> &'static str {
    match role {
        RelayRole::Disabled => "relay",
        RelayRole::Alarm => "alarmrelay",
        RelayRole::GensetStartStop => "gensetstartstoprelay",
        RelayRole::Manual => "relay",
        RelayRole::TankPump => "tankpumprelay",
        RelayRole::Temperature => "temperaturerelay",
        RelayRole::ConnectedGensetHelper => "connectedgensethelperrelay",
    }
}

fn relay_product_name(role: RelayRole) -> &'static str {
    match role {
        RelayRole::Disabled => "Disabled",
        RelayRole::Alarm => "Alarm relay",
        RelayRole::GensetStartStop => "Genset start/stop relay",
        RelayRole::Manual => "Manual relay",
        RelayRole::TankPump => "Tank pump relay",
        RelayRole::Temperature => "Temperature relay",
        RelayRole::ConnectedGensetHelper => "Connected genset helper relay",
    }
}

// Service names cannot start with a digit; numbered pins get a prefix.
fn sanitize_pin_name(name: &str) -> String {
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("input_{name}")
    } else {
        name.to_string()
    }
}

fn device_instance(settings: &SettingsDevice) -> i64 {
    settings
        .get_str("instance")
        .split(':')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10)
}

/// Everything a constructor needs to bind a handler to one pin.
pub struct HandlerCtx {
    pub bus: Bus,
    pub base: String,
    pub pin_name: String,
    pub connection: String,
    pub settings: SettingsDevice,
    pub relay: Option<Rc<RefCell<Relay>>>,
}

/// Shared presentation state for handlers that publish a service.
struct ServiceCore {
    service: Option<Service>,
    settings: SettingsDevice,
    default_name: &'static str,
    level: u8,
}

impl ServiceCore {
    fn new(ctx: &HandlerCtx, class: &str, product_id: i64, default_name: &'static str) -> Self {
        let name = sanitize_pin_name(&ctx.pin_name);
        let service = ctx.bus.register(&format!("{}.{class}.{name}", ctx.base));

        service.add_path("/Mgmt/ProcessName", PROCESS_NAME);
        service.add_path("/Mgmt/ProcessVersion", PROCESS_VERSION);
        service.add_path("/Mgmt/Connection", ctx.connection.as_str());
        service.add_path("/DeviceInstance", device_instance(&ctx.settings));
        service.add_path("/ProductId", product_id);
        service.add_path("/Connected", 1i64);

        let custom = ctx.settings.get_str("name");
        let product = if custom.is_empty() {
            default_name.to_string()
        } else {
            custom.clone()
        };
        service.add_path("/ProductName", product);
        service.add_path_with("/CustomName", custom, true, TextFormat::Plain);

        Self {
            service: Some(service),
            settings: ctx.settings.clone(),
            default_name,
            level: 0,
        }
    }

    fn active(&self) -> bool {
        self.service.is_some()
    }

    fn service_name(&self) -> Option<String> {
        self.service.as_ref().map(|s| s.name().to_string())
    }

    fn set(&self, path: &str, value: impl Into<Value>) {
        if let Some(service) = &self.service {
            service.set(path, value);
        }
    }

    fn add_count(&self, initial: u32) {
        if let Some(service) = &self.service {
            service.add_path("/Count", initial);
        }
    }

    fn count(&self) -> u32 {
        self.service
            .as_ref()
            .map(|s| s.get_u32("/Count"))
            .unwrap_or_else(|| self.settings.get_u32("count"))
    }

    /// Rising edges bump the counter; repeated and falling levels never do.
    fn toggle_count(&mut self, level: u8) {
        if level != 0 && level != self.level {
            let count = self.count();
            self.set("/Count", next_count(count));
        }
        self.level = level;
    }

    fn save_count(&self) {
        if self.service.is_none() {
            return;
        }
        if let Err(e) = self.settings.set("count", self.count()) {
            warn!("cannot persist counter: {e}");
        }
    }

    fn set_display_name(&self, name: &str) {
        let product = if name.is_empty() {
            self.default_name
        } else {
            name
        };
        self.set("/ProductName", product);
        self.set("/CustomName", name);
    }

    fn deactivate(&mut self) {
        self.save_count();
        self.service = None;
    }

    /// Drop the service without touching the counter; relays have none.
    fn release(&mut self) {
        self.service = None;
    }
}

pub struct DisabledInput {
    settings: SettingsDevice,
    level: u8,
}

impl DisabledInput {
    pub fn new(settings: SettingsDevice) -> Self {
        Self { settings, level: 0 }
    }
}

pub struct PulseMeter {
    core: ServiceCore,
}

impl PulseMeter {
    fn new(ctx: &HandlerCtx) -> Self {
        let core = ServiceCore::new(
            ctx,
            "pulsemeter",
            PRODUCT_ID_PULSE_METER,
            input_product_name(InputRole::PulseMeter),
        );
        core.add_count(ctx.settings.get_u32("count"));
        if let Some(service) = &core.service {
            let aggregate = core.count() as f64 * ctx.settings.get_f64("rate");
            service.add_path_with(
                "/Aggregate",
                aggregate,
                false,
                TextFormat::Quantity("cubic meter"),
            );
        }
        Self { core }
    }

    fn toggle(&mut self, level: u8) {
        self.core.toggle_count(level);
        let aggregate = self.core.count() as f64 * self.core.settings.get_f64("rate");
        self.core.set("/Aggregate", aggregate);
    }
}

pub struct AlarmInput {
    core: ServiceCore,
    role: InputRole,
}

impl AlarmInput {
    fn new(ctx: &HandlerCtx, role: InputRole) -> Self {
        let core = ServiceCore::new(
            ctx,
            "digitalinput",
            PRODUCT_ID_DIGITAL_INPUT,
            input_product_name(role),
        );
        core.add_count(ctx.settings.get_u32("count"));

        let handler = Self { core, role };
        if let Some(service) = &handler.core.service {
            service.add_path("/InputState", 0u8);
            service.add_path_with("/State", handler.state_value(0), false, TextFormat::StateText);
            service.add_path("/Alarm", handler.alarm_value(0));
            service.add_path_with("/Type", role.id(), false, TextFormat::InputTypeText);
        }
        handler
    }

    fn state_value(&self, level: u8) -> u32 {
        let invert = self.core.settings.get_bool("invert") as u8;
        2 * translation_index(self.role) + (level ^ invert) as u32
    }

    /// Bit 0 of the alarm flag is reserved; the active flag lives in bit 1
    /// and must round-trip through the store unchanged.
    fn alarm_value(&self, level: u8) -> u32 {
        let invert = self.core.settings.get_bool("invertalarm") as u8;
        let armed = self.core.settings.get_bool("alarm");
        2 * (((level ^ invert) != 0 && armed) as u32)
    }

    fn toggle(&mut self, level: u8) {
        self.core.toggle_count(level);
        self.core.set("/InputState", level);
        self.core.set("/State", self.state_value(level));
        // Recomputed rather than latched so the flag drops as soon as the
        // alarm setting is cleared.
        self.core.set("/Alarm", self.alarm_value(level));
    }
}

pub struct GeneratorInput {
    inner: AlarmInput,
    bus: Bus,
    base: String,
    gpio: String,
    level_cell: Rc<Cell<u8>>,
    timer: Option<JoinHandle<()>>,
}

/// Tell every power-inverter peer, and the start/stop coordinator, which
/// input currently carries the generator and whether it runs.
fn select_generator(bus: &Bus, base: &str, gpio: &str, active: u8) {
    for svc in bus.service_names(&format!("{base}.vebus.")) {
        if let Err(e) = bus.set_remote(&svc, "/Ac/Control/RemoteGeneratorSelected", active) {
            warn!("generator selection broadcast to {svc}: {e}");
        }
    }
    let startstop = format!("{base}.generator.startstop0");
    if let Err(e) = bus
        .set_remote(&startstop, "/DigitalInput/Input", gpio)
        .and_then(|_| bus.set_remote(&startstop, "/DigitalInput/Running", active))
    {
        warn!("start/stop coordination: {e}");
    }
}

impl GeneratorInput {
    fn new(ctx: &HandlerCtx) -> Self {
        let inner = AlarmInput::new(ctx, InputRole::Generator);
        let level_cell = Rc::new(Cell::new(0u8));

        let bus = ctx.bus.clone();
        let base = ctx.base.clone();
        let gpio = ctx.pin_name.clone();
        let settings = ctx.settings.clone();
        let cell = level_cell.clone();
        let timer = actix_web::rt::spawn(async move {
            let mut tick = time::interval(GENERATOR_BROADCAST_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let invert = settings.get_bool("invert") as u8;
                select_generator(&bus, &base, &gpio, cell.get() ^ invert ^ 1);
            }
        });

        Self {
            inner,
            bus: ctx.bus.clone(),
            base: ctx.base.clone(),
            gpio: ctx.pin_name.clone(),
            level_cell,
            timer: Some(timer),
        }
    }

    fn active_level(&self, level: u8) -> u8 {
        // Same inversion sense as the displayed state; translation pair is
        // (running, stopped) so the selected level is inverted once more.
        let invert = self.inner.core.settings.get_bool("invert") as u8;
        level ^ invert ^ 1
    }

    fn toggle(&mut self, level: u8) {
        self.inner.toggle(level);
        self.level_cell.set(level);
        select_generator(&self.bus, &self.base, &self.gpio, self.active_level(level));
    }

    fn deactivate(&mut self) {
        self.inner.core.deactivate();
        // Peers must not keep chasing an input that no longer exists.
        select_generator(&self.bus, &self.base, &self.gpio, 0);
        let startstop = format!("{}.generator.startstop0", self.base);
        let _ = self.bus.set_remote(&startstop, "/DigitalInput/Input", 0u8);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct TouchEnable {
    store: SettingsStore,
    settings: SettingsDevice,
    level: u8,
}

impl TouchEnable {
    fn new(ctx: &HandlerCtx) -> Self {
        Self {
            store: ctx.settings.store().clone(),
            settings: ctx.settings.clone(),
            level: 0,
        }
    }

    fn toggle(&mut self, level: u8) {
        self.level = level;
        // The switch idles high and is pulled low when pressed; act on the
        // falling edge only.
        if level == 0 {
            let enabled = self
                .store
                .get(TOUCH_ENABLED_PATH)
                .and_then(|v| v.as_i64())
                .unwrap_or(1)
                != 0;
            if let Err(e) = self.store.set(TOUCH_ENABLED_PATH, (!enabled) as i64) {
                warn!("cannot toggle touch enable: {e}");
            }
        }
    }

    fn deactivate(&mut self) {
        // Fail safe: never leave the touch screen locked out.
        if let Err(e) = self.store.set(TOUCH_ENABLED_PATH, 1i64) {
            warn!("cannot restore touch enable: {e}");
        }
    }
}

pub enum InputHandler {
    Disabled(DisabledInput),
    Pulse(PulseMeter),
    Alarm(AlarmInput),
    Generator(GeneratorInput),
    Touch(TouchEnable),
}

impl InputHandler {
    pub fn toggle(&mut self, level: u8) {
        match self {
            InputHandler::Disabled(h) => h.level = level,
            InputHandler::Pulse(h) => h.toggle(level),
            InputHandler::Alarm(h) => h.toggle(level),
            InputHandler::Generator(h) => h.toggle(level),
            InputHandler::Touch(h) => h.toggle(level),
        }
    }

    /// Replay the last level so derived values are recomputed after a
    /// settings change; never counts twice.
    pub fn refresh(&mut self) {
        match self {
            InputHandler::Pulse(h) => {
                let level = h.core.level;
                h.toggle(level);
            }
            InputHandler::Alarm(h) => {
                let level = h.core.level;
                h.toggle(level);
            }
            InputHandler::Generator(h) => {
                let level = h.inner.core.level;
                h.toggle(level);
            }
            InputHandler::Disabled(_) | InputHandler::Touch(_) => {}
        }
    }

    /// Adopt a level without treating it as a transition.
    pub fn prime(&mut self, level: u8) {
        match self {
            InputHandler::Disabled(h) => h.level = level,
            InputHandler::Pulse(h) => h.core.level = level,
            InputHandler::Alarm(h) => h.core.level = level,
            InputHandler::Generator(h) => {
                h.inner.core.level = level;
                h.level_cell.set(level);
            }
            InputHandler::Touch(h) => h.level = level,
        }
    }

    pub fn deactivate(&mut self) {
        match self {
            InputHandler::Disabled(_) => {}
            InputHandler::Pulse(h) => h.core.deactivate(),
            InputHandler::Alarm(h) => h.core.deactivate(),
            InputHandler::Generator(h) => h.deactivate(),
            InputHandler::Touch(h) => h.deactivate(),
        }
    }

    pub fn save_count(&self) {
        match self {
            InputHandler::Pulse(h) => h.core.save_count(),
            InputHandler::Alarm(h) => h.core.save_count(),
            InputHandler::Generator(h) => h.inner.core.save_count(),
            InputHandler::Disabled(_) | InputHandler::Touch(_) => {}
        }
    }

    pub fn active(&self) -> bool {
        match self {
            InputHandler::Pulse(h) => h.core.active(),
            InputHandler::Alarm(h) => h.core.active(),
            InputHandler::Generator(h) => h.inner.core.active(),
            InputHandler::Disabled(_) | InputHandler::Touch(_) => false,
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            InputHandler::Pulse(h) => h.core.count(),
            InputHandler::Alarm(h) => h.core.count(),
            InputHandler::Generator(h) => h.inner.core.count(),
            InputHandler::Disabled(h) => h.settings.get_u32("count"),
            InputHandler::Touch(h) => h.settings.get_u32("count"),
        }
    }

    pub fn set_count(&mut self, count: u32) {
        match self {
            InputHandler::Pulse(h) => h.core.set("/Count", count),
            InputHandler::Alarm(h) => h.core.set("/Count", count),
            InputHandler::Generator(h) => h.inner.core.set("/Count", count),
            InputHandler::Disabled(_) | InputHandler::Touch(_) => {}
        }
    }

    pub fn set_display_name(&mut self, name: &str) {
        match self {
            InputHandler::Pulse(h) => h.core.set_display_name(name),
            InputHandler::Alarm(h) => h.core.set_display_name(name),
            InputHandler::Generator(h) => h.inner.core.set_display_name(name),
            InputHandler::Disabled(_) | InputHandler::Touch(_) => {}
        }
    }

    pub fn service_name(&self) -> Option<String> {
        match self {
            InputHandler::Pulse(h) => h.core.service_name(),
            InputHandler::Alarm(h) => h.core.service_name(),
            InputHandler::Generator(h) => h.inner.core.service_name(),
            InputHandler::Disabled(_) | InputHandler::Touch(_) => None,
        }
    }

    pub fn last_level(&self) -> u8 {
        match self {
            InputHandler::Disabled(h) => h.level,
            InputHandler::Pulse(h) => h.core.level,
            InputHandler::Alarm(h) => h.core.level,
            InputHandler::Generator(h) => h.inner.core.level,
            InputHandler::Touch(h) => h.level,
        }
    }
}

pub struct DisabledRelay {
    level: u8,
}

impl DisabledRelay {
    pub fn new() -> Self {
        Self { level: 0 }
    }
}

impl Default for DisabledRelay {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RelayOutput {
    core: ServiceCore,
    relay: Rc<RefCell<Relay>>,
}

impl RelayOutput {
    fn new(ctx: &HandlerCtx, role: RelayRole) -> Option<Self> {
        let relay = ctx.relay.clone()?;
        let core = ServiceCore::new(
            ctx,
            relay_service_class(role),
            PRODUCT_ID_GENERIC,
            relay_product_name(role),
        );
        if let Some(service) = &core.service {
            service.add_path_with("/State", 0u8, true, TextFormat::Plain);
        }
        Some(Self { core, relay })
    }

    /// Follow a state change reported by the hardware side.
    pub fn toggle(&mut self, level: u8) {
        if self.core.level != level {
            self.core.set("/State", level);
            self.core.level = level;
        }
    }

    /// An externally commanded state; only 0 and 1 are accepted.
    pub fn external_write(&mut self, value: &Value) -> bool {
        let Some(level) = value.as_level() else {
            return false;
        };
        self.relay.borrow_mut().set_state(level);
        // Remembered so the level is restored after a restart.
        if let Err(e) = self.core.settings.set("state", level) {
            warn!("cannot persist relay state: {e}");
        }
        self.core.level = level;
        self.core.set("/State", level);
        true
    }

    /// Re-apply a persisted level at startup, bypassing the toggle diff.
    pub fn restore(&mut self, level: u8) {
        self.relay.borrow_mut().set_state(level);
        self.core.level = level;
        self.core.set("/State", level);
    }
}

pub enum RelayHandler {
    Disabled(DisabledRelay),
    Output(RelayOutput),
}

impl RelayHandler {
    pub fn toggle(&mut self, level: u8) {
        match self {
            RelayHandler::Disabled(h) => h.level = level,
            RelayHandler::Output(h) => h.toggle(level),
        }
    }

    pub fn deactivate(&mut self) {
        match self {
            RelayHandler::Disabled(_) => {}
            RelayHandler::Output(h) => h.core.release(),
        }
    }

    pub fn active(&self) -> bool {
        match self {
            RelayHandler::Disabled(_) => false,
            RelayHandler::Output(h) => h.core.active(),
        }
    }

    pub fn set_display_name(&mut self, name: &str) {
        if let RelayHandler::Output(h) = self {
            h.core.set_display_name(name);
        }
    }

    pub fn service_name(&self) -> Option<String> {
        match self {
            RelayHandler::Disabled(_) => None,
            RelayHandler::Output(h) => h.core.service_name(),
        }
    }

    pub fn last_level(&self) -> u8 {
        match self {
            RelayHandler::Disabled(h) => h.level,
            RelayHandler::Output(h) => h.core.level,
        }
    }
}

pub enum Handler {
    Input(InputHandler),
    Relay(RelayHandler),
}

impl Handler {
    pub fn toggle(&mut self, level: u8) {
        match self {
            Handler::Input(h) => h.toggle(level),
            Handler::Relay(h) => h.toggle(level),
        }
    }

    pub fn refresh(&mut self) {
        if let Handler::Input(h) = self {
            h.refresh();
        }
    }

    pub fn prime(&mut self, level: u8) {
        if let Handler::Input(h) = self {
            h.prime(level);
        }
    }

    pub fn deactivate(&mut self) {
        match self {
            Handler::Input(h) => h.deactivate(),
            Handler::Relay(h) => h.deactivate(),
        }
    }

    pub fn save_count(&self) {
        if let Handler::Input(h) = self {
            h.save_count();
        }
    }

    pub fn active(&self) -> bool {
        match self {
            Handler::Input(h) => h.active(),
            Handler::Relay(h) => h.active(),
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            Handler::Input(h) => h.count(),
            Handler::Relay(_) => 0,
        }
    }

    pub fn set_count(&mut self, count: u32) {
        if let Handler::Input(h) = self {
            h.set_count(count);
        }
    }

    pub fn set_display_name(&mut self, name: &str) {
        match self {
            Handler::Input(h) => h.set_display_name(name),
            Handler::Relay(h) => h.set_display_name(name),
        }
    }

    pub fn service_name(&self) -> Option<String> {
        match self {
            Handler::Input(h) => h.service_name(),
            Handler::Relay(h) => h.service_name(),
        }
    }

    pub fn as_relay_output_mut(&mut self) -> Option<&mut RelayOutput> {
        match self {
            Handler::Relay(RelayHandler::Output(h)) => Some(h),
            _ => None,
        }
    }
}

pub type HandlerCtor = fn(&HandlerCtx) -> Option<Handler>;

/// Dispatch table from `(category, type id)` to a constructor, built once
/// at startup.
pub struct Registry {
    ctors: FxHashMap<(IoKind, u8), HandlerCtor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl Registry {
    pub fn with_builtin() -> Self {
        let mut r = Self {
            ctors: FxHashMap::default(),
        };

        r.add(IoKind::DigitalInput, InputRole::Disabled, |ctx| {
            Some(Handler::Input(InputHandler::Disabled(DisabledInput::new(
                ctx.settings.clone(),
            ))))
        });
        r.add(IoKind::DigitalInput, InputRole::PulseMeter, |ctx| {
            Some(Handler::Input(InputHandler::Pulse(PulseMeter::new(ctx))))
        });
        r.add(IoKind::DigitalInput, InputRole::Door, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::Door))))
        });
        r.add(IoKind::DigitalInput, InputRole::BilgePump, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::BilgePump))))
        });
        r.add(IoKind::DigitalInput, InputRole::BilgeAlarm, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::BilgeAlarm))))
        });
        r.add(IoKind::DigitalInput, InputRole::BurglarAlarm, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::BurglarAlarm))))
        });
        r.add(IoKind::DigitalInput, InputRole::SmokeAlarm, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::SmokeAlarm))))
        });
        r.add(IoKind::DigitalInput, InputRole::FireAlarm, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::FireAlarm))))
        });
        r.add(IoKind::DigitalInput, InputRole::Co2Alarm, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::Co2Alarm))))
        });
        r.add(IoKind::DigitalInput, InputRole::Generator, |ctx| {
            Some(Handler::Input(InputHandler::Generator(GeneratorInput::new(ctx))))
        });
        r.add(IoKind::DigitalInput, InputRole::GenericIo, |ctx| {
            Some(Handler::Input(InputHandler::Alarm(AlarmInput::new(ctx, InputRole::GenericIo))))
        });
        r.add(IoKind::DigitalInput, InputRole::TouchEnable, |ctx| {
            Some(Handler::Input(InputHandler::Touch(TouchEnable::new(ctx))))
        });

        r.add_relay(RelayRole::Disabled, |_ctx| {
            Some(Handler::Relay(RelayHandler::Disabled(DisabledRelay::new())))
        });
        r.add_relay(RelayRole::Alarm, |ctx| {
            RelayOutput::new(ctx, RelayRole::Alarm).map(|h| Handler::Relay(RelayHandler::Output(h)))
        });
        r.add_relay(RelayRole::GensetStartStop, |ctx| {
            RelayOutput::new(ctx, RelayRole::GensetStartStop)
                .map(|h| Handler::Relay(RelayHandler::Output(h)))
        });
        r.add_relay(RelayRole::Manual, |ctx| {
            RelayOutput::new(ctx, RelayRole::Manual).map(|h| Handler::Relay(RelayHandler::Output(h)))
        });
        r.add_relay(RelayRole::TankPump, |ctx| {
            RelayOutput::new(ctx, RelayRole::TankPump)
                .map(|h| Handler::Relay(RelayHandler::Output(h)))
        });
        r.add_relay(RelayRole::Temperature, |ctx| {
            RelayOutput::new(ctx, RelayRole::Temperature)
                .map(|h| Handler::Relay(RelayHandler::Output(h)))
        });
        r.add_relay(RelayRole::ConnectedGensetHelper, |ctx| {
            RelayOutput::new(ctx, RelayRole::ConnectedGensetHelper)
                .map(|h| Handler::Relay(RelayHandler::Output(h)))
        });

        r
    }

    fn add(&mut self, kind: IoKind, role: InputRole, ctor: HandlerCtor) {
        self.ctors.insert((kind, role.id()), ctor);
    }

    fn add_relay(&mut self, role: RelayRole, ctor: HandlerCtor) {
        self.ctors.insert((IoKind::Relay, role.id()), ctor);
    }

    /// `None` for an unknown type id; callers treat that as "do nothing".
    pub fn create(&self, kind: IoKind, type_id: u8, ctx: &HandlerCtx) -> Option<Handler> {
        if let Some(ctor) = self.ctors.get(&(kind, type_id)) {
            return ctor(ctx);
        }

        let declared = match kind {
            IoKind::DigitalInput => InputRole::from_id(type_id).is_some(),
            IoKind::Relay => RelayRole::from_id(type_id).is_some(),
        };
        if declared {
            debug_assert!(false, "no constructor for declared type id {type_id}");
            warn!(
                "no constructor registered for {} type {type_id}",
                kind.as_str()
            );
        }
        None
    }
}
