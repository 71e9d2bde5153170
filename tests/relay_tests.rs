use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use diobridge::backend::{GpioBackend, MockBackend};
use diobridge::relay::Relay;

fn mock() -> (Arc<MockBackend>, Arc<dyn GpioBackend>) {
    let backend = Arc::new(MockBackend::default());
    let dyn_backend: Arc<dyn GpioBackend> = backend.clone();
    (backend, dyn_backend)
}

#[actix_rt::test]
async fn monostable_holds_the_coil() {
    let (mock, backend) = mock();
    let path = PathBuf::from("/relays/relay_1");
    let mut relay =
        Relay::from_paths("1", "1", std::slice::from_ref(&path), backend).expect("relay");

    assert!(matches!(relay, Relay::Monostable(_)));
    assert!(!relay.has_feedback());

    assert!(relay.set_state(1));
    assert_eq!(mock.line_value(&path), 1);

    assert!(relay.set_state(0));
    assert_eq!(mock.line_value(&path), 0);
}

#[actix_rt::test]
async fn coil_paths_are_discovered_by_suffix() {
    let (_, backend) = mock();
    let paths = vec![
        PathBuf::from("/relays/relay_2_in"),
        PathBuf::from("/relays/relay_2_res"),
        PathBuf::from("/relays/relay_2_set"),
    ];
    let relay = Relay::from_paths("2", "2", &paths, backend.clone()).expect("relay");

    assert!(matches!(relay, Relay::Bistable(_)));
    assert!(relay.has_feedback());
    assert_eq!(relay.connection(), PathBuf::from("/relays/relay_2_set"));

    // A lone feedback line is not a relay.
    assert!(Relay::from_paths("3", "3", &[PathBuf::from("/relays/relay_3_in")], backend).is_none());
}

#[actix_rt::test]
async fn bistable_confirms_via_feedback_and_releases() {
    let (mock, backend) = mock();
    let set = PathBuf::from("/relays/relay_2_set");
    let res = PathBuf::from("/relays/relay_2_res");
    let fb = PathBuf::from("/relays/relay_2_in");
    let paths = vec![set.clone(), res.clone(), fb.clone()];
    let mut relay = Relay::from_paths("2", "2", &paths, backend).expect("relay");

    // The contact closes a few poll cycles after the coil is pulsed.
    let feedback_mock = mock.clone();
    let feedback_path = fb.clone();
    actix_rt::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        feedback_mock.set_line_value(&feedback_path, 1);
    });

    assert!(relay.set_state(1));
    assert_eq!(mock.line_value(&set), 1);

    relay.settle().await;
    assert_eq!(relay.feedback_state(), Some(1));
    assert_eq!(mock.line_value(&set), 0);
    assert_eq!(mock.line_value(&res), 0);
}

#[actix_rt::test]
async fn bistable_releases_coils_after_timeout() {
    let (mock, backend) = mock();
    let set = PathBuf::from("/relays/relay_2_set");
    let res = PathBuf::from("/relays/relay_2_res");
    let fb = PathBuf::from("/relays/relay_2_in");
    let paths = vec![set.clone(), res.clone(), fb.clone()];
    let mut relay = Relay::from_paths("2", "2", &paths, backend).expect("relay");

    // Shorten the pulse so the retry budget drains quickly; the feedback
    // line never reports the target level.
    if let Relay::Bistable(r) = &mut relay {
        r.set_pulse_len(Duration::from_millis(300));
    }

    assert!(relay.set_state(1));
    relay.settle().await;

    assert_eq!(mock.line_value(&fb), 0);
    assert_eq!(mock.line_value(&set), 0);
    assert_eq!(mock.line_value(&res), 0);
}

#[actix_rt::test]
async fn bistable_without_feedback_waits_out_the_pulse() {
    let (mock, backend) = mock();
    let set = PathBuf::from("/relays/relay_2_set");
    let res = PathBuf::from("/relays/relay_2_res");
    let paths = vec![set.clone(), res.clone()];
    let mut relay = Relay::from_paths("2", "2", &paths, backend).expect("relay");

    if let Relay::Bistable(r) = &mut relay {
        r.set_pulse_len(Duration::from_millis(200));
    }

    assert!(relay.set_state(0));
    assert_eq!(mock.line_value(&res), 1);

    relay.settle().await;
    assert_eq!(mock.line_value(&set), 0);
    assert_eq!(mock.line_value(&res), 0);
}
