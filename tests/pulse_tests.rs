use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use diobridge::backend::{GpioBackend, MockBackend};
use diobridge::pulse::{DebugSource, EdgeSource, PollingSource, PulseEvent, PulseSource};

fn mock() -> (Arc<MockBackend>, Arc<dyn GpioBackend>) {
    let backend = Arc::new(MockBackend::default());
    let dyn_backend: Arc<dyn GpioBackend> = backend.clone();
    (backend, dyn_backend)
}

fn spawn_source(source: Arc<dyn PulseSource>) -> mpsc::Receiver<PulseEvent> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let _ = source.run(tx);
    });
    rx
}

async fn next_event(rx: &mut mpsc::Receiver<PulseEvent>, within: Duration) -> PulseEvent {
    timeout(within, rx.recv())
        .await
        .expect("event within deadline")
        .expect("source still running")
}

#[actix_rt::test]
async fn register_reports_the_initial_level() {
    let (mock, backend) = mock();
    let path = Path::new("/gpio/in1");
    mock.set_line_value(path, 1);

    let source = EdgeSource::new(backend);
    assert_eq!(source.register(path, "in1").unwrap(), 1);
    assert!(source.is_registered("in1"));
    assert!(mock.is_armed(path));

    source.unregister("in1");
    assert!(!source.is_registered("in1"));
    assert!(!mock.is_armed(path));
}

#[actix_rt::test]
async fn edge_source_reports_changes() {
    let (mock, backend) = mock();
    let path = PathBuf::from("/gpio/in1");

    let source = Arc::new(EdgeSource::new(backend));
    source.register(&path, "in1").unwrap();

    let dyn_source: Arc<dyn PulseSource> = source.clone();
    let mut rx = spawn_source(dyn_source);

    mock.set_line_value(&path, 1);
    let ev = next_event(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(
        ev,
        PulseEvent {
            pin: "in1".to_string(),
            level: 1
        }
    );

    mock.set_line_value(&path, 0);
    let ev = next_event(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(ev.level, 0);
}

#[actix_rt::test]
async fn resync_catches_changes_without_interrupts() {
    let (mock, backend) = mock();
    let path = PathBuf::from("/gpio/in1");

    let source = Arc::new(EdgeSource::new(backend));
    source.register(&path, "in1").unwrap();

    // No notification is ever delivered; only the once-a-second resync
    // may observe the level change.
    mock.suppress_edge_notifications(true);

    let dyn_source: Arc<dyn PulseSource> = source.clone();
    let mut rx = spawn_source(dyn_source);

    mock.set_line_value(&path, 1);
    let ev = next_event(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(ev.level, 1);
}

#[actix_rt::test]
async fn read_failures_skip_the_line_until_they_clear() {
    let (mock, backend) = mock();
    let path = PathBuf::from("/gpio/in1");

    let source = Arc::new(EdgeSource::new(backend));
    source.register(&path, "in1").unwrap();
    mock.set_read_error(&path, true);

    let dyn_source: Arc<dyn PulseSource> = source.clone();
    let mut rx = spawn_source(dyn_source);

    mock.set_line_value(&path, 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    mock.set_read_error(&path, false);
    let ev = next_event(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(ev.level, 1);
}

#[actix_rt::test]
async fn polling_source_reports_changes_each_interval() {
    let (mock, backend) = mock();
    let path = PathBuf::from("/gpio/in1");

    let source = Arc::new(PollingSource::new(backend));
    assert_eq!(source.register(&path, "in1").unwrap(), 0);

    let dyn_source: Arc<dyn PulseSource> = source.clone();
    let mut rx = spawn_source(dyn_source);

    mock.set_line_value(&path, 1);
    let ev = next_event(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(ev.level, 1);
}

#[actix_rt::test]
async fn debug_source_cycles_registered_pins() {
    let source = Arc::new(DebugSource::new());
    source.register(Path::new("ignored"), "a").unwrap();
    source.register(Path::new("ignored"), "b").unwrap();

    let dyn_source: Arc<dyn PulseSource> = source.clone();
    let mut rx = spawn_source(dyn_source);

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next_event(&mut rx, Duration::from_secs(2)).await);
    }

    assert!(seen.iter().any(|e| e.pin == "a"));
    assert!(seen.iter().any(|e| e.pin == "b"));
    assert_eq!(seen[0].level, 0);
    assert_eq!(seen[2].level, 1);
}
