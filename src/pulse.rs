use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::backend::GpioBackend;
use crate::error::AppError;

/// Upper bound on how long a strategy blocks before it looks at the
/// registration map again; register/unregister calls are picked up within
/// one cycle even when no edge ever fires.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Aggregate cycle time of the debug source.
pub const DEBUG_CYCLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseEvent {
    pub pin: String,
    pub level: u8,
}

/// A source of `(pin, level)` change events. All strategies share the same
/// register/unregister semantics so handlers never know which one runs.
pub trait PulseSource: Send + Sync {
    /// Start watching a line; returns its current level.
    fn register(&self, path: &Path, pin: &str) -> Result<u8, AppError>;

    fn unregister(&self, pin: &str);

    fn is_registered(&self, pin: &str) -> bool;

    /// Blocking event loop, run on a dedicated thread. Returns `Ok` when
    /// the receiving side is gone and `Err` on an unrecoverable failure;
    /// either way the daemon is expected to shut down.
    fn run(&self, tx: mpsc::Sender<PulseEvent>) -> Result<(), AppError>;
}

struct LineState {
    path: PathBuf,
    level: u8,
}

type LineMap = Mutex<FxHashMap<String, LineState>>;

/// Re-read every registered line and emit the changes. Read failures skip
/// the line for this cycle; the next cycle retries. Returns false once the
/// receiver is dropped.
fn resync(
    backend: &Arc<dyn GpioBackend>,
    lines: &LineMap,
    tx: &mpsc::Sender<PulseEvent>,
) -> bool {
    let snapshot: Vec<(String, PathBuf, u8)> = lines
        .lock()
        .iter()
        .map(|(pin, s)| (pin.clone(), s.path.clone(), s.level))
        .collect();

    for (pin, path, level) in snapshot {
        let v = match backend.read_value(&path) {
            Ok(v) => v,
            Err(e) => {
                warn!("resync read failed for {pin}: {e}");
                continue;
            }
        };
        if v == level {
            continue;
        }
        // The line may have been unregistered while we were reading.
        if let Some(state) = lines.lock().get_mut(&pin) {
            state.level = v;
        } else {
            continue;
        }
        if tx.blocking_send(PulseEvent { pin, level: v }).is_err() {
            return false;
        }
    }
    true
}

/// Edge-notification strategy: arm every line for both edges, block on the
/// backend's multiplexed wait, then resync all lines by value. Interrupt
/// delivery buys latency; correctness comes from the resync.
pub struct EdgeSource {
    backend: Arc<dyn GpioBackend>,
    lines: LineMap,
}

impl EdgeSource {
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            backend,
            lines: Mutex::new(FxHashMap::default()),
        }
    }
}

impl PulseSource for EdgeSource {
    fn register(&self, path: &Path, pin: &str) -> Result<u8, AppError> {
        self.backend.arm_edge(path)?;
        let level = self.backend.read_value(path)?;
        self.lines.lock().insert(
            pin.to_string(),
            LineState {
                path: path.to_path_buf(),
                level,
            },
        );
        Ok(level)
    }

    fn unregister(&self, pin: &str) {
        if let Some(state) = self.lines.lock().remove(pin) {
            self.backend.release(&state.path);
        }
    }

    fn is_registered(&self, pin: &str) -> bool {
        self.lines.lock().contains_key(pin)
    }

    fn run(&self, tx: mpsc::Sender<PulseEvent>) -> Result<(), AppError> {
        loop {
            self.backend.wait_edge_events(POLL_TIMEOUT)?;
            if !resync(&self.backend, &self.lines, &tx) {
                return Ok(());
            }
        }
    }
}

/// Plain fixed-interval strategy for systems without usable interrupts.
pub struct PollingSource {
    backend: Arc<dyn GpioBackend>,
    lines: LineMap,
}

impl PollingSource {
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            backend,
            lines: Mutex::new(FxHashMap::default()),
        }
    }
}

impl PulseSource for PollingSource {
    fn register(&self, path: &Path, pin: &str) -> Result<u8, AppError> {
        let level = self.backend.read_value(path)?;
        self.lines.lock().insert(
            pin.to_string(),
            LineState {
                path: path.to_path_buf(),
                level,
            },
        );
        Ok(level)
    }

    fn unregister(&self, pin: &str) {
        self.lines.lock().remove(pin);
    }

    fn is_registered(&self, pin: &str) -> bool {
        self.lines.lock().contains_key(pin)
    }

    fn run(&self, tx: mpsc::Sender<PulseEvent>) -> Result<(), AppError> {
        loop {
            if !resync(&self.backend, &self.lines, &tx) {
                return Ok(());
            }
            thread::sleep(POLL_TIMEOUT);
        }
    }
}

/// Simulation strategy: cycles every registered pin between 0 and 1 with
/// no hardware behind it.
#[derive(Default)]
pub struct DebugSource {
    lines: Mutex<FxHashMap<String, u8>>,
}

impl DebugSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PulseSource for DebugSource {
    fn register(&self, _path: &Path, pin: &str) -> Result<u8, AppError> {
        self.lines.lock().insert(pin.to_string(), 0);
        Ok(0)
    }

    fn unregister(&self, pin: &str) {
        self.lines.lock().remove(pin);
    }

    fn is_registered(&self, pin: &str) -> bool {
        self.lines.lock().contains_key(pin)
    }

    fn run(&self, tx: mpsc::Sender<PulseEvent>) -> Result<(), AppError> {
        for level in [0u8, 1].into_iter().cycle() {
            let pins: Vec<String> = self.lines.lock().keys().cloned().collect();
            if pins.is_empty() {
                thread::sleep(DEBUG_CYCLE);
                continue;
            }
            let pace = DEBUG_CYCLE / pins.len() as u32;
            for pin in pins {
                if let Some(l) = self.lines.lock().get_mut(&pin) {
                    *l = level;
                } else {
                    continue;
                }
                if tx
                    .blocking_send(PulseEvent {
                        pin,
                        level,
                    })
                    .is_err()
                {
                    return Ok(());
                }
                thread::sleep(pace);
            }
        }
        Ok(())
    }
}
