use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tokio::sync::mpsc;

use diobridge::config::{self, InputDecl, PinDecl};
use diobridge::controller::Controller;
use diobridge::handler::{Registry, TOUCH_ENABLED_PATH};
use diobridge::pulse::{DebugSource, EdgeSource, PollingSource, PulseSource};
use diobridge::relay::Relay;
use diobridge::routes::{AppState, api_scope};
use diobridge::settings::SettingsStore;
use diobridge::{Bus, GpioBackend, Value};

#[cfg(feature = "hardware-gpio")]
use diobridge::SysfsBackend;
#[cfg(not(feature = "hardware-gpio"))]
use diobridge::MockBackend;

const BROADCAST_CAPACITY: usize = 64;
const PULSE_QUEUE: usize = 64;
const WRITE_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    Edge,
    Poll,
    Debug,
}

struct Args {
    base: String,
    poll: PollMode,
    conf: Vec<PathBuf>,
    inputs: Vec<PathBuf>,
    relays: Vec<PathBuf>,
    settings: PathBuf,
    http: Option<String>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = Args {
            base: "diobridge".to_string(),
            poll: PollMode::Edge,
            conf: Vec::new(),
            inputs: Vec::new(),
            relays: Vec::new(),
            settings: PathBuf::from("/data/diobridge-settings.json"),
            http: None,
        };

        let mut it = std::env::args().skip(1).peekable();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--servicebase" => args.base = it.next().ok_or("--servicebase needs a value")?,
                "--poll" => {
                    args.poll = match it.next().as_deref() {
                        Some("edge") => PollMode::Edge,
                        Some("poll") => PollMode::Poll,
                        Some("debug") => PollMode::Debug,
                        other => return Err(format!("unknown poll mode {other:?}")),
                    }
                }
                "--conf" => args.conf.push(it.next().ok_or("--conf needs a value")?.into()),
                "--settings" => {
                    args.settings = it.next().ok_or("--settings needs a value")?.into()
                }
                "--http" => args.http = Some(it.next().ok_or("--http needs a value")?),
                "--inputs" => {
                    while let Some(p) = it.peek() {
                        if p.starts_with("--") {
                            break;
                        }
                        args.inputs.push(it.next().unwrap_or_default().into());
                    }
                }
                "--relays" => {
                    while let Some(p) = it.peek() {
                        if p.starts_with("--") {
                            break;
                        }
                        args.relays.push(it.next().unwrap_or_default().into());
                    }
                }
                other => return Err(format!("unknown argument {other}")),
            }
        }
        Ok(args)
    }
}

fn collect_pins(args: &Args) -> Result<Vec<PinDecl>, diobridge::AppError> {
    let mut pins = Vec::new();

    // Bare input paths are numbered from 1, matching their device instances.
    for (idx, path) in args.inputs.iter().enumerate() {
        let n = (idx + 1) as u32;
        pins.push(PinDecl::Input(InputDecl {
            name: n.to_string(),
            path: path.clone(),
            label: format!("Digital input {n}"),
            instance: Some(n),
        }));
    }

    for decl in config::group_relay_paths(&args.relays)? {
        pins.push(PinDecl::Relay(decl));
    }

    for conf in &args.conf {
        pins.extend(config::parse_config(conf)?);
    }

    Ok(pins)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let args = Args::parse().unwrap_or_else(|e| panic!("Argument error: {e}"));

    let (store, settings_rx) = SettingsStore::new(Some(args.settings.clone()));
    store.declare(TOUCH_ENABLED_PATH, Value::Int(1), Some(0.0), Some(1.0));

    let backend: Arc<dyn GpioBackend> = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(SysfsBackend::new())
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockBackend::default())
        }
    };

    let pulses: Arc<dyn PulseSource> = match args.poll {
        PollMode::Edge => Arc::new(EdgeSource::new(backend.clone())),
        PollMode::Poll => Arc::new(PollingSource::new(backend.clone())),
        PollMode::Debug => Arc::new(DebugSource::new()),
    };

    let bus = Bus::new(BROADCAST_CAPACITY);
    let mut controller = Controller::new(
        bus.clone(),
        store.clone(),
        Registry::with_builtin(),
        pulses.clone(),
        args.base.clone(),
    );

    for pin in collect_pins(&args).unwrap_or_else(|e| panic!("Failed to load pins: {e}")) {
        match pin {
            PinDecl::Input(decl) => controller.add_input(decl),
            PinDecl::Relay(decl) => {
                match Relay::from_paths(&decl.name, &decl.name, &decl.paths, backend.clone()) {
                    Some(relay) => controller.add_relay(decl, relay),
                    None => warn!("relay {} has no usable coil paths, skipping", decl.name),
                }
            }
        }
    }

    let (pulse_tx, pulse_rx) = mpsc::channel(PULSE_QUEUE);
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);

    // The blocking wait/poll loop gets its own thread; everything it finds
    // is funneled through the bounded channel into the event loop.
    let poll_source = pulses.clone();
    std::thread::spawn(move || {
        if let Err(e) = poll_source.run(pulse_tx) {
            error!("pulse source failed: {e}");
        }
    });

    if let Some(addr) = args.http.clone() {
        let state = AppState {
            bus: bus.clone(),
            writes: write_tx.clone(),
        };
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(api_scope("/api/v1"))
        })
        .bind(&addr)?
        .run();

        info!("Serving device tree on {addr}...");
        actix_web::rt::spawn(server);
    }

    controller
        .run(pulse_rx, settings_rx, write_rx)
        .await
        .map_err(std::io::Error::other)
}
