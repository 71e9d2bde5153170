use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use diobridge::backend::{GpioBackend, MockBackend};
use diobridge::bus::{Bus, Value};
use diobridge::config::{InputDecl, InputRole, RelayDecl};
use diobridge::controller::Controller;
use diobridge::handler::{Registry, TOUCH_ENABLED_PATH};
use diobridge::pulse::{PollingSource, PulseEvent, PulseSource};
use diobridge::relay::Relay;
use diobridge::settings::{SettingChange, SettingsStore};

struct Fixture {
    controller: Controller,
    settings_rx: mpsc::UnboundedReceiver<SettingChange>,
    store: SettingsStore,
    bus: Bus,
    backend: Arc<MockBackend>,
    pulses: Arc<dyn PulseSource>,
}

fn fixture_with_file(file: Option<PathBuf>) -> Fixture {
    let (store, settings_rx) = SettingsStore::new(file);
    store.declare(TOUCH_ENABLED_PATH, Value::Int(1), Some(0.0), Some(1.0));
    let bus = Bus::new(16);
    let backend = Arc::new(MockBackend::default());
    let dyn_backend: Arc<dyn GpioBackend> = backend.clone();
    let pulses: Arc<dyn PulseSource> = Arc::new(PollingSource::new(dyn_backend));

    let controller = Controller::new(
        bus.clone(),
        store.clone(),
        Registry::with_builtin(),
        pulses.clone(),
        "test".to_string(),
    );

    Fixture {
        controller,
        settings_rx,
        store,
        bus,
        backend,
        pulses,
    }
}

fn fixture() -> Fixture {
    fixture_with_file(None)
}

impl Fixture {
    fn drain(&mut self) {
        while let Ok(change) = self.settings_rx.try_recv() {
            self.controller.on_setting_change(&change);
        }
    }

    fn add_input(&mut self, name: &str) {
        self.controller.add_input(InputDecl {
            name: name.to_string(),
            path: PathBuf::from(format!("/dev/gpio/{name}")),
            label: format!("Digital input {name}"),
            instance: None,
        });
        self.drain();
    }

    fn set_type(&mut self, pin: &str, group: &str, type_id: u8) {
        self.store
            .set(&format!("/Settings/{group}/{pin}/Type"), type_id)
            .unwrap();
        self.drain();
    }
}

#[actix_rt::test]
async fn type_change_activates_and_deactivates() {
    let mut fx = fixture();
    fx.add_input("in1");
    assert!(!fx.controller.is_active("in1"));
    assert!(!fx.pulses.is_registered("in1"));

    fx.set_type("in1", "DigitalInput", InputRole::Door.id());
    assert!(fx.controller.is_active("in1"));
    assert!(fx.pulses.is_registered("in1"));
    assert_eq!(
        fx.controller.service_of("in1").as_deref(),
        Some("test.digitalinput.in1")
    );
    assert_eq!(
        fx.bus.get("test.digitalinputs", "/Devices/digitalinput/in1/Type"),
        Some(Value::Int(2))
    );

    fx.set_type("in1", "DigitalInput", 0);
    assert!(!fx.controller.is_active("in1"));
    assert!(!fx.pulses.is_registered("in1"));
    assert!(!fx.bus.has_service("test.digitalinput.in1"));
    assert_eq!(
        fx.bus.get("test.digitalinputs", "/Devices/digitalinput/in1/Type"),
        Some(Value::Int(0))
    );
}

#[actix_rt::test]
async fn pulses_drive_the_active_handler() {
    let mut fx = fixture();
    fx.add_input("in1");
    fx.set_type("in1", "DigitalInput", InputRole::Door.id());

    for level in [1u8, 1, 0, 1] {
        fx.controller.on_pulse(&PulseEvent {
            pin: "in1".to_string(),
            level,
        });
    }

    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/Count"),
        Some(Value::Int(2))
    );
    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/InputState"),
        Some(Value::Int(1))
    );

    // A pulse for an unknown pin is dropped on the floor.
    fx.controller.on_pulse(&PulseEvent {
        pin: "ghost".to_string(),
        level: 1,
    });
}

#[actix_rt::test]
async fn type_change_resets_presentation_settings() {
    let mut fx = fixture();
    fx.add_input("in1");
    fx.set_type("in1", "DigitalInput", InputRole::Door.id());

    fx.store
        .set("/Settings/DigitalInput/in1/InvertTranslation", 1u8)
        .unwrap();
    fx.controller.on_pulse(&PulseEvent {
        pin: "in1".to_string(),
        level: 1,
    });
    fx.drain();
    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/Count"),
        Some(Value::Int(1))
    );

    // Moving to another role starts from clean settings.
    fx.set_type("in1", "DigitalInput", InputRole::SmokeAlarm.id());
    assert_eq!(fx.store.get("/Settings/DigitalInput/in1/Count"), Some(Value::Int(0)));
    assert_eq!(
        fx.store.get("/Settings/DigitalInput/in1/InvertTranslation"),
        Some(Value::Int(0))
    );
    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/Count"),
        Some(Value::Int(0))
    );
}

#[actix_rt::test]
async fn second_generator_disables_the_first() {
    let mut fx = fixture();
    fx.add_input("a");
    fx.add_input("b");

    fx.set_type("a", "DigitalInput", InputRole::Generator.id());
    assert!(fx.controller.is_active("a"));

    fx.set_type("b", "DigitalInput", InputRole::Generator.id());
    assert!(fx.controller.is_active("b"));
    assert!(!fx.controller.is_active("a"));
    assert!(!fx.pulses.is_registered("a"));
    assert_eq!(
        fx.store.get("/Settings/DigitalInput/a/Type"),
        Some(Value::Int(0))
    );
    assert_eq!(
        fx.bus.get("test.digitalinputs", "/Devices/digitalinput/a/Type"),
        Some(Value::Int(0))
    );
}

#[actix_rt::test]
async fn rate_change_refreshes_published_values() {
    let mut fx = fixture();
    fx.add_input("in1");
    fx.set_type("in1", "DigitalInput", InputRole::PulseMeter.id());

    for level in [1u8, 0, 1, 0] {
        fx.controller.on_pulse(&PulseEvent {
            pin: "in1".to_string(),
            level,
        });
    }
    assert_eq!(
        fx.bus.get("test.pulsemeter.in1", "/Aggregate"),
        Some(Value::Float(2.0 * 0.001))
    );

    fx.store
        .set("/Settings/DigitalInput/in1/Multiplier", 0.25f64)
        .unwrap();
    fx.drain();
    assert_eq!(
        fx.bus.get("test.pulsemeter.in1", "/Aggregate"),
        Some(Value::Float(0.5))
    );
    // Refreshing must not count the remembered level again.
    assert_eq!(
        fx.bus.get("test.pulsemeter.in1", "/Count"),
        Some(Value::Int(2))
    );
}

#[actix_rt::test]
async fn external_count_change_is_adopted_while_active() {
    let mut fx = fixture();
    fx.add_input("in1");
    fx.set_type("in1", "DigitalInput", InputRole::PulseMeter.id());

    fx.store
        .set("/Settings/DigitalInput/in1/Count", 42u32)
        .unwrap();
    fx.drain();
    assert_eq!(
        fx.bus.get("test.pulsemeter.in1", "/Count"),
        Some(Value::Int(42))
    );

    // While inactive the stored value is left alone.
    fx.set_type("in1", "DigitalInput", 0);
    fx.store
        .set("/Settings/DigitalInput/in1/Count", 7u32)
        .unwrap();
    fx.drain();
    assert_eq!(
        fx.store.get("/Settings/DigitalInput/in1/Count"),
        Some(Value::Int(7))
    );
}

#[actix_rt::test]
async fn name_change_updates_display_name() {
    let mut fx = fixture();
    fx.add_input("in1");
    fx.set_type("in1", "DigitalInput", InputRole::Door.id());

    fx.store
        .set("/Settings/DigitalInput/in1/CustomName", "Cabin door")
        .unwrap();
    fx.drain();

    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/ProductName"),
        Some(Value::Text("Cabin door".to_string()))
    );
    assert_eq!(
        fx.bus.get("test.digitalinput.in1", "/CustomName"),
        Some(Value::Text("Cabin door".to_string()))
    );
}

#[actix_rt::test]
async fn external_type_write_validates_range() {
    let mut fx = fixture();
    fx.add_input("in1");

    let err = fx
        .controller
        .apply_external_write(
            "test.digitalinputs",
            "/Devices/digitalinput/in1/Type",
            &Value::Int(99),
        )
        .unwrap_err();
    assert!(matches!(err, diobridge::AppError::InvalidValue(_)));
    assert_eq!(
        fx.store.get("/Settings/DigitalInput/in1/Type"),
        Some(Value::Int(0))
    );

    fx.controller
        .apply_external_write(
            "test.digitalinputs",
            "/Devices/digitalinput/in1/Type",
            &Value::Int(2),
        )
        .unwrap();
    fx.drain();
    assert!(fx.controller.is_active("in1"));
}

#[actix_rt::test]
async fn relay_state_restored_on_startup() {
    let path = PathBuf::from("/relays/relay_1");
    let mut fx = fixture();

    // A previous run left the relay enabled and commanded on.
    fx.store
        .declare("/Settings/Relay/1/Type", Value::Int(3), Some(0.0), Some(6.0));
    fx.store
        .declare("/Settings/Relay/1/State", Value::Int(1), Some(0.0), Some(1.0));

    let backend: Arc<dyn GpioBackend> = fx.backend.clone();
    let relay = Relay::from_paths("1", "1", std::slice::from_ref(&path), backend)
        .expect("monostable relay");
    fx.controller.add_relay(
        RelayDecl {
            name: "1".to_string(),
            paths: vec![path.clone()],
            label: "Relay 1".to_string(),
            instance: Some(1),
        },
        relay,
    );
    fx.drain();

    assert!(fx.controller.is_active("1"));
    assert_eq!(fx.backend.line_value(&path), 1);
    assert_eq!(
        fx.bus.get("test.relay.input_1", "/State"),
        Some(Value::Int(1))
    );
}

#[actix_rt::test]
async fn relay_state_write_actuates_and_persists() {
    let path = PathBuf::from("/relays/relay_1");
    let mut fx = fixture();

    let backend: Arc<dyn GpioBackend> = fx.backend.clone();
    let relay = Relay::from_paths("1", "1", std::slice::from_ref(&path), backend)
        .expect("monostable relay");
    fx.controller.add_relay(
        RelayDecl {
            name: "1".to_string(),
            paths: vec![path.clone()],
            label: "Relay 1".to_string(),
            instance: Some(1),
        },
        relay,
    );
    fx.drain();
    fx.set_type("1", "Relay", 3);
    assert!(fx.controller.is_active("1"));

    fx.controller
        .apply_external_write("test.relay.input_1", "/State", &Value::Int(1))
        .unwrap();
    assert_eq!(fx.backend.line_value(&path), 1);
    assert_eq!(fx.store.get("/Settings/Relay/1/State"), Some(Value::Int(1)));
    assert_eq!(
        fx.bus.get("test.relay.input_1", "/State"),
        Some(Value::Int(1))
    );

    let err = fx
        .controller
        .apply_external_write("test.relay.input_1", "/State", &Value::Int(5))
        .unwrap_err();
    assert!(matches!(err, diobridge::AppError::InvalidValue(_)));
    assert_eq!(fx.backend.line_value(&path), 1);
}

#[actix_rt::test]
async fn counters_round_trip_through_the_store_file() {
    let file = std::env::temp_dir().join(format!("diobridge-test-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&file);

    {
        let mut fx = fixture_with_file(Some(file.clone()));
        fx.add_input("in1");
        fx.set_type("in1", "DigitalInput", InputRole::PulseMeter.id());
        for level in [1u8, 0, 1, 0, 1, 0] {
            fx.controller.on_pulse(&PulseEvent {
                pin: "in1".to_string(),
                level,
            });
        }
        // The orderly-shutdown flush.
        fx.controller.save_counters();
        fx.drain();
        assert_eq!(
            fx.bus.get("test.pulsemeter.in1", "/Count"),
            Some(Value::Int(3))
        );
    }

    {
        let mut fx = fixture_with_file(Some(file.clone()));
        fx.add_input("in1");
        fx.drain();
        assert_eq!(
            fx.store.get("/Settings/DigitalInput/in1/Count"),
            Some(Value::Int(3))
        );
        assert_eq!(
            fx.bus.get("test.pulsemeter.in1", "/Count"),
            Some(Value::Int(3))
        );
    }

    let _ = std::fs::remove_file(&file);
}
