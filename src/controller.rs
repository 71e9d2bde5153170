use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rustc_hash::FxHashMap;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::bus::{Bus, Service, TextFormat, Value};
use crate::config::{INPUT_ROLES, InputDecl, InputRole, IoKind, RELAY_ROLES, RelayDecl, RelayRole};
use crate::error::AppError;
use crate::handler::{DisabledInput, DisabledRelay, Handler, HandlerCtx, InputHandler, MAX_COUNT, Registry, RelayHandler};
use crate::pulse::{PulseEvent, PulseSource};
use crate::relay::Relay;
use crate::settings::{SettingChange, SettingsDevice, SettingsStore};

/// Counters are flushed to the settings store on this cadence, and once
/// more during orderly shutdown.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// An externally requested write to a published path, routed through the
/// event context so nothing else ever mutates handler state.
pub struct WriteRequest {
    pub service: String,
    pub path: String,
    pub value: Value,
    pub reply: Option<oneshot::Sender<Result<(), AppError>>>,
}

enum SlotDecl {
    Input { path: PathBuf },
    Relay { relay: Rc<RefCell<Relay>> },
}

struct Slot {
    kind: IoKind,
    decl: SlotDecl,
    settings: SettingsDevice,
    handler: Handler,
}

/// Owns every pin slot and runs the single-threaded event loop. All
/// handler and relay state lives here; the poller thread and the HTTP
/// surface only talk to it through channels.
pub struct Controller {
    bus: Bus,
    store: SettingsStore,
    registry: Registry,
    pulses: Arc<dyn PulseSource>,
    base: String,
    ctl_name: String,
    ctl: Service,
    slots: FxHashMap<String, Slot>,
    // settings path -> (pin, alias), for routing change events
    setting_owners: FxHashMap<String, (String, &'static str)>,
}

fn devid_of(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

impl Controller {
    pub fn new(
        bus: Bus,
        store: SettingsStore,
        registry: Registry,
        pulses: Arc<dyn PulseSource>,
        base: String,
    ) -> Self {
        let ctl_name = format!("{base}.digitalinputs");
        let ctl = bus.register(&ctl_name);
        Self {
            bus,
            store,
            registry,
            pulses,
            base,
            ctl_name,
            ctl,
            slots: FxHashMap::default(),
            setting_owners: FxHashMap::default(),
        }
    }

    pub fn ctl_service(&self) -> &str {
        &self.ctl_name
    }

    pub fn is_active(&self, pin: &str) -> bool {
        self.slots.get(pin).is_some_and(|s| s.handler.active())
    }

    pub fn service_of(&self, pin: &str) -> Option<String> {
        self.slots.get(pin)?.handler.service_name()
    }

    fn declare_pin_settings(
        &mut self,
        kind: IoKind,
        name: &str,
        devid: &str,
        instance: Option<u32>,
    ) -> SettingsDevice {
        let group = kind.settings_group();
        let max_type = match kind {
            IoKind::DigitalInput => INPUT_ROLES.len(),
            IoKind::Relay => RELAY_ROLES.len(),
        } as f64
            - 1.0;

        let mut dev = SettingsDevice::new(self.store.clone());
        dev.add_setting(
            "type",
            format!("/Settings/{group}/{name}/Type"),
            Value::Int(0),
            Some(0.0),
            Some(max_type),
        );
        dev.add_setting(
            "rate",
            format!("/Settings/{group}/{name}/Multiplier"),
            Value::Float(0.001),
            Some(0.0),
            Some(1.0),
        );
        dev.add_setting(
            "name",
            format!("/Settings/{group}/{name}/CustomName"),
            Value::Text(String::new()),
            None,
            None,
        );
        dev.add_setting(
            "instance",
            format!("/Settings/Devices/{devid}/ClassAndInstance"),
            Value::Text(format!("{}:{}", kind.as_str(), instance.unwrap_or(10))),
            None,
            None,
        );

        match kind {
            IoKind::DigitalInput => {
                dev.add_setting(
                    "count",
                    format!("/Settings/{group}/{name}/Count"),
                    Value::Int(0),
                    Some(0.0),
                    Some(MAX_COUNT as f64),
                );
                dev.add_setting(
                    "invert",
                    format!("/Settings/{group}/{name}/InvertTranslation"),
                    Value::Int(0),
                    Some(0.0),
                    Some(1.0),
                );
                dev.add_setting(
                    "invertalarm",
                    format!("/Settings/{group}/{name}/InvertAlarm"),
                    Value::Int(0),
                    Some(0.0),
                    Some(1.0),
                );
                dev.add_setting(
                    "alarm",
                    format!("/Settings/{group}/{name}/AlarmSetting"),
                    Value::Int(0),
                    Some(0.0),
                    Some(1.0),
                );
            }
            IoKind::Relay => {
                dev.add_setting(
                    "state",
                    format!("/Settings/{group}/{name}/State"),
                    Value::Int(0),
                    Some(0.0),
                    Some(1.0),
                );
            }
        }

        for (alias, path) in dev.aliases() {
            self.setting_owners
                .insert(path.to_string(), (name.to_string(), alias));
        }
        dev
    }

    fn add_ctl_paths(&self, kind: IoKind, name: &str, label: &str, type_id: u32) {
        let io = kind.as_str();
        self.ctl
            .add_path(&format!("/Devices/{io}/{name}/Label"), label);
        self.ctl.add_path_with(
            &format!("/Devices/{io}/{name}/Type"),
            type_id,
            true,
            TextFormat::Plain,
        );
    }

    pub fn add_input(&mut self, decl: InputDecl) {
        let devid = devid_of(&decl.path, &decl.name);
        let settings =
            self.declare_pin_settings(IoKind::DigitalInput, &decl.name, &devid, decl.instance);
        let type_id = settings.get_u32("type");

        self.slots.insert(
            decl.name.clone(),
            Slot {
                kind: IoKind::DigitalInput,
                decl: SlotDecl::Input {
                    path: decl.path.clone(),
                },
                settings: settings.clone(),
                handler: Handler::Input(InputHandler::Disabled(DisabledInput::new(settings))),
            },
        );
        self.add_ctl_paths(IoKind::DigitalInput, &decl.name, &decl.label, type_id);
        self.register_pin(&decl.name);
    }

    pub fn add_relay(&mut self, decl: RelayDecl, relay: Relay) {
        let devid = devid_of(relay.connection(), &decl.name);
        let relay = Rc::new(RefCell::new(relay));
        let settings = self.declare_pin_settings(IoKind::Relay, &decl.name, &devid, decl.instance);
        let type_id = settings.get_u32("type");

        self.slots.insert(
            decl.name.clone(),
            Slot {
                kind: IoKind::Relay,
                decl: SlotDecl::Relay {
                    relay: relay.clone(),
                },
                settings: settings.clone(),
                handler: Handler::Relay(RelayHandler::Disabled(DisabledRelay::new())),
            },
        );
        self.add_ctl_paths(IoKind::Relay, &decl.name, &decl.label, type_id);
        self.register_pin(&decl.name);

        // Restore the last commanded level from the previous run. This is a
        // direct actuation, not a toggle; there is no prior instance to
        // diff against.
        let state = settings.get_u32("state") as u8;
        if let Some(slot) = self.slots.get_mut(&decl.name)
            && let Some(output) = slot.handler.as_relay_output_mut()
        {
            output.restore(state);
        }
    }

    /// Build and activate the handler for the pin's currently configured
    /// type, registering the line with the pulse source when enabled.
    fn register_pin(&mut self, pin: &str) {
        let Some(slot) = self.slots.get(pin) else {
            return;
        };
        let kind = slot.kind;
        let type_id = slot.settings.get_u32("type") as u8;
        let settings = slot.settings.clone();
        let (connection, relay, input_path) = match &slot.decl {
            SlotDecl::Input { path } => (path.display().to_string(), None, Some(path.clone())),
            SlotDecl::Relay { relay } => (
                relay.borrow().connection().display().to_string(),
                Some(relay.clone()),
                None,
            ),
        };

        info!("registering {} {pin} as type {type_id}", kind.as_str());

        let ctx = HandlerCtx {
            bus: self.bus.clone(),
            base: self.base.clone(),
            pin_name: pin.to_string(),
            connection,
            settings,
            relay,
        };
        let Some(mut handler) = self.registry.create(kind, type_id, &ctx) else {
            warn!("no handler for {} type {type_id}, leaving {pin} as is", kind.as_str());
            return;
        };

        if kind == IoKind::DigitalInput
            && type_id > 0
            && let Some(path) = input_path
        {
            match self.pulses.register(&path, pin) {
                Ok(level) => handler.prime(level),
                Err(e) => warn!("cannot watch {pin}: {e}"),
            }
            handler.refresh();
        }

        if let Some(slot) = self.slots.get_mut(pin) {
            slot.handler = handler;
        }
    }

    /// Tear the pin down: line watch removed first, then the handler
    /// deactivated (which persists its counter before anything is dropped).
    fn unregister_pin(&mut self, pin: &str) {
        info!("unregistering {pin}");
        if self.pulses.is_registered(pin) {
            self.pulses.unregister(pin);
        }
        if let Some(slot) = self.slots.get_mut(pin) {
            slot.handler.deactivate();
        }
    }

    pub fn on_pulse(&mut self, ev: &PulseEvent) {
        // The source resyncs once a second; an event may still arrive for a
        // pin that was just unregistered. Drop it.
        if let Some(slot) = self.slots.get_mut(&ev.pin) {
            slot.handler.toggle(ev.level);
        }
    }

    pub fn on_setting_change(&mut self, change: &SettingChange) {
        let Some((pin, alias)) = self.setting_owners.get(&change.path).cloned() else {
            return;
        };
        // Also fired when an attribute of the setting changed but not the
        // value itself.
        if change.old == change.new {
            return;
        }

        match alias {
            "type" => self.on_type_change(&pin, change),
            "rate" | "invert" | "alarm" | "invertalarm" => {
                if let Some(slot) = self.slots.get_mut(&pin) {
                    slot.handler.refresh();
                }
            }
            "name" => {
                if let Some(slot) = self.slots.get_mut(&pin) {
                    slot.handler
                        .set_display_name(change.new.as_str().unwrap_or_default());
                }
            }
            "count" => {
                // The handler's own periodic save also lands here; only an
                // actual divergence is adopted.
                let v = change.new.as_u32().unwrap_or(0);
                if let Some(slot) = self.slots.get_mut(&pin)
                    && slot.handler.active()
                    && slot.handler.count() != v
                {
                    slot.handler.set_count(v);
                    slot.handler.refresh();
                }
            }
            _ => {}
        }
    }

    fn on_type_change(&mut self, pin: &str, change: &SettingChange) {
        let new_t = change.new.as_u32().unwrap_or(0) as u8;
        let old_t = change.old.as_u32().unwrap_or(0) as u8;
        let (kind, active) = match self.slots.get(pin) {
            Some(slot) => (slot.kind, slot.handler.active()),
            None => return,
        };

        if new_t != 0 {
            if active || self.pulses.is_registered(pin) {
                self.unregister_pin(pin);
            }

            if kind == IoKind::DigitalInput {
                if new_t == InputRole::Generator.id() {
                    // At most one generator input; every other pin holding
                    // the role is forced back to disabled.
                    let others: Vec<String> = self
                        .slots
                        .iter()
                        .filter(|(name, s)| {
                            name.as_str() != pin
                                && s.kind == IoKind::DigitalInput
                                && s.settings.get_u32("type") as u8 == InputRole::Generator.id()
                        })
                        .map(|(name, _)| name.clone())
                        .collect();
                    for other in others {
                        if let Some(s) = self.slots.get(&other)
                            && let Err(e) = s.settings.set("type", 0u8)
                        {
                            warn!("cannot disable generator on {other}: {e}");
                        }
                        self.unregister_pin(&other);
                    }
                }

                // A fresh role starts from clean presentation settings.
                if let Some(slot) = self.slots.get(pin) {
                    for (alias, v) in [("count", 0u8), ("invert", 0), ("invertalarm", 0), ("alarm", 0)]
                    {
                        if let Err(e) = slot.settings.set(alias, v) {
                            warn!("cannot reset {alias} on {pin}: {e}");
                        }
                    }
                }
            }

            self.register_pin(pin);
        } else if old_t != 0 {
            self.unregister_pin(pin);
        }

        self.ctl
            .set(&format!("/Devices/{}/{pin}/Type", kind.as_str()), new_t);
    }

    pub fn on_external_write(&mut self, req: WriteRequest) {
        let result = self.apply_external_write(&req.service, &req.path, &req.value);
        if let Err(e) = &result {
            warn!("rejected write to {}{}: {e}", req.service, req.path);
        }
        if let Some(reply) = req.reply {
            let _ = reply.send(result);
        }
    }

    pub fn apply_external_write(
        &mut self,
        service: &str,
        path: &str,
        value: &Value,
    ) -> Result<(), AppError> {
        if service == self.ctl_name {
            return self.apply_type_write(path, value);
        }

        let Some(pin) = self.slots.iter().find_map(|(name, slot)| {
            (slot.handler.service_name().as_deref() == Some(service)).then(|| name.clone())
        }) else {
            return Err(AppError::NotFoundService(service.to_string()));
        };
        let slot = self
            .slots
            .get_mut(&pin)
            .ok_or_else(|| AppError::NotFoundPin(pin.clone()))?;

        match path {
            "/CustomName" => {
                let name = value
                    .as_str()
                    .ok_or_else(|| AppError::InvalidValue("name must be text".into()))?;
                slot.settings.set("name", name)
            }
            "/State" => {
                let output = slot
                    .handler
                    .as_relay_output_mut()
                    .ok_or_else(|| AppError::InvalidState(format!("{path} is not writable")))?;
                if output.external_write(value) {
                    Ok(())
                } else {
                    Err(AppError::InvalidValue("relay state must be 0 or 1".into()))
                }
            }
            _ => Err(AppError::InvalidValue(format!("{path} is not writable"))),
        }
    }

    /// Type writes on the control service; out-of-range ids are rejected
    /// with the original value retained.
    fn apply_type_write(&mut self, path: &str, value: &Value) -> Result<(), AppError> {
        let parts: Vec<&str> = path.split('/').collect();
        let (io, pin) = match parts.as_slice() {
            ["", "Devices", io, pin, "Type"] => (*io, *pin),
            _ => return Err(AppError::InvalidValue(format!("{path} is not writable"))),
        };
        let slot = self
            .slots
            .get(pin)
            .filter(|s| s.kind.as_str() == io)
            .ok_or_else(|| AppError::NotFoundPin(pin.to_string()))?;

        let id = value
            .as_u32()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| AppError::InvalidValue("type must be an integer".into()))?;
        let known = match slot.kind {
            IoKind::DigitalInput => InputRole::from_id(id).is_some(),
            IoKind::Relay => RelayRole::from_id(id).is_some(),
        };
        if !known {
            return Err(AppError::InvalidValue(format!("unknown type id {id}")));
        }
        slot.settings.set("type", id)
    }

    /// Fire-and-forget flush of every counter to the settings store.
    pub fn save_counters(&self) {
        for slot in self.slots.values() {
            slot.handler.save_count();
        }
    }

    async fn settle_relays(&mut self) {
        let relays: Vec<Rc<RefCell<Relay>>> = self
            .slots
            .values()
            .filter_map(|s| match &s.decl {
                SlotDecl::Relay { relay } => Some(relay.clone()),
                SlotDecl::Input { .. } => None,
            })
            .collect();
        for relay in relays {
            relay.borrow_mut().settle().await;
        }
    }

    /// The single-threaded event loop: pulses, settings changes, external
    /// writes, the persistence tick and termination signals. Returns once
    /// a signal arrives, or with an error when the pulse source dies.
    pub async fn run(
        &mut self,
        mut pulse_rx: mpsc::Receiver<PulseEvent>,
        mut settings_rx: mpsc::UnboundedReceiver<SettingChange>,
        mut write_rx: mpsc::Receiver<WriteRequest>,
    ) -> Result<(), AppError> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| AppError::Config(format!("signal handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| AppError::Config(format!("signal handler: {e}")))?;

        let mut save_tick = time::interval(SAVE_INTERVAL);
        save_tick.tick().await;

        let result = loop {
            tokio::select! {
                ev = pulse_rx.recv() => match ev {
                    Some(ev) => self.on_pulse(&ev),
                    None => {
                        error!("pulse source terminated");
                        break Err(AppError::Gpio("pulse source terminated".into()));
                    }
                },
                Some(change) = settings_rx.recv() => self.on_setting_change(&change),
                Some(req) = write_rx.recv() => self.on_external_write(req),
                _ = save_tick.tick() => self.save_counters(),
                _ = sigterm.recv() => break Ok(()),
                _ = sigint.recv() => break Ok(()),
            }
        };

        info!("shutting down, flushing counters");
        self.save_counters();
        self.settle_relays().await;
        result
    }
}
