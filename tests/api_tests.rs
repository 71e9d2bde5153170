use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, test, web};
use serde_json::Value as Json;
use tokio::sync::mpsc;

use diobridge::backend::{GpioBackend, MockBackend};
use diobridge::bus::{Bus, Value};
use diobridge::config::{InputDecl, RelayDecl};
use diobridge::controller::Controller;
use diobridge::handler::{Registry, TOUCH_ENABLED_PATH};
use diobridge::pulse::{DebugSource, PulseSource};
use diobridge::relay::Relay;
use diobridge::routes::{AppState, api_scope};
use diobridge::settings::SettingsStore;

struct World {
    state: AppState,
    bus: Bus,
    store: SettingsStore,
    backend: Arc<MockBackend>,
    relay_path: PathBuf,
}

/// A daemon in miniature: one manual relay, one door input, and the event
/// context running as a background task fed by the write channel.
fn setup_world() -> World {
    let (store, mut settings_rx) = SettingsStore::new(None);
    store.declare(TOUCH_ENABLED_PATH, Value::Int(1), Some(0.0), Some(1.0));
    let bus = Bus::new(16);
    let backend = Arc::new(MockBackend::default());
    let pulses: Arc<dyn PulseSource> = Arc::new(DebugSource::new());

    let mut controller = Controller::new(
        bus.clone(),
        store.clone(),
        Registry::with_builtin(),
        pulses,
        "test".to_string(),
    );

    let relay_path = PathBuf::from("/relays/relay_1");
    let dyn_backend: Arc<dyn GpioBackend> = backend.clone();
    let relay = Relay::from_paths("1", "1", std::slice::from_ref(&relay_path), dyn_backend)
        .expect("monostable relay");
    controller.add_relay(
        RelayDecl {
            name: "1".to_string(),
            paths: vec![relay_path.clone()],
            label: "Relay 1".to_string(),
            instance: Some(1),
        },
        relay,
    );
    controller.add_input(InputDecl {
        name: "2".to_string(),
        path: PathBuf::from("/gpio/digital_input_2"),
        label: "Digital input 2".to_string(),
        instance: Some(2),
    });

    store.set("/Settings/Relay/1/Type", 3u8).unwrap();
    store.set("/Settings/DigitalInput/2/Type", 2u8).unwrap();
    while let Ok(change) = settings_rx.try_recv() {
        controller.on_setting_change(&change);
    }

    let (write_tx, mut write_rx) = mpsc::channel(16);
    actix_rt::spawn(async move {
        loop {
            tokio::select! {
                req = write_rx.recv() => match req {
                    Some(req) => controller.on_external_write(req),
                    None => break,
                },
                Some(change) = settings_rx.recv() => controller.on_setting_change(&change),
            }
        }
    });

    World {
        state: AppState {
            bus: bus.clone(),
            writes: write_tx,
        },
        bus,
        store,
        backend,
        relay_path,
    }
}

macro_rules! init_app {
    ($world:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($world.state.clone()))
                .service(api_scope("/api/v1")),
        )
        .await
    };
}

#[actix_rt::test]
async fn services_lists_everything_published() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::get().uri("/api/v1/services").to_request();
    let services: Vec<String> = test::call_and_read_body_json(&app, req).await;

    assert!(services.contains(&"test.digitalinputs".to_string()));
    assert!(services.contains(&"test.relay.input_1".to_string()));
    assert!(services.contains(&"test.digitalinput.input_2".to_string()));
}

#[actix_rt::test]
async fn service_snapshot_shows_items() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::get()
        .uri("/api/v1/service/test.relay.input_1")
        .to_request();
    let snapshot: Json = test::call_and_read_body_json(&app, req).await;

    assert_eq!(snapshot["/State"]["value"], 0);
    assert_eq!(snapshot["/State"]["writable"], true);
    assert_eq!(snapshot["/ProductName"]["value"], "Manual relay");
}

#[actix_rt::test]
async fn item_read_includes_display_text() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::get()
        .uri("/api/v1/service/test.digitalinput.input_2/Type")
        .to_request();
    let item: Json = test::call_and_read_body_json(&app, req).await;

    assert_eq!(item["value"], 2);
    assert_eq!(item["text"], "Door");
}

#[actix_rt::test]
async fn unknown_service_returns_404() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::get()
        .uri("/api/v1/service/test.nope")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get()
        .uri("/api/v1/service/test.relay.input_1/Missing")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post().uri("/api/v1/services").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::delete()
        .uri("/api/v1/service/test.relay.input_1/State")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn relay_state_write_reaches_the_coil() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post()
        .uri("/api/v1/service/test.relay.input_1/State")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    assert_eq!(world.backend.line_value(&world.relay_path), 1);
    assert_eq!(
        world.bus.get("test.relay.input_1", "/State"),
        Some(Value::Int(1))
    );
    assert_eq!(
        world.store.get("/Settings/Relay/1/State"),
        Some(Value::Int(1))
    );
}

#[actix_rt::test]
async fn out_of_range_state_write_is_rejected() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post()
        .uri("/api/v1/service/test.relay.input_1/State")
        .set_payload("5")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(world.backend.line_value(&world.relay_path), 0);
}

#[actix_rt::test]
async fn read_only_items_reject_writes() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post()
        .uri("/api/v1/service/test.relay.input_1/ProductId")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn type_write_on_control_service_reconfigures() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post()
        .uri("/api/v1/service/test.digitalinputs/Devices/digitalinput/2/Type")
        .set_payload("6")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // The settings change is applied by the background event context.
    actix_rt::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        world.store.get("/Settings/DigitalInput/2/Type"),
        Some(Value::Int(6))
    );
    assert_eq!(
        world
            .bus
            .get("test.digitalinputs", "/Devices/digitalinput/2/Type"),
        Some(Value::Int(6))
    );
}

#[actix_rt::test]
async fn custom_name_write_round_trips() {
    let world = setup_world();
    let app = init_app!(world);

    let req = test::TestRequest::post()
        .uri("/api/v1/service/test.digitalinput.input_2/CustomName")
        .set_payload(r#""Cabin door""#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    actix_rt::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        world.bus.get("test.digitalinput.input_2", "/ProductName"),
        Some(Value::Text("Cabin door".to_string()))
    );
}
