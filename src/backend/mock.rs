use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use super::GpioBackend;
use crate::error::AppError;

#[derive(Default)]
struct MockLine {
    value: u8,
    armed: bool,
    fail_reads: bool,
}

#[derive(Default)]
struct MockState {
    lines: FxHashMap<PathBuf, MockLine>,
    pending: bool,
    // When false, value changes on armed lines no longer wake the edge
    // wait; exercises the resync fallback path.
    notify_edges: bool,
}

/// In-memory line backend. Lines spring into existence on first use with
/// level 0; tests drive them through `set_line_value`.
pub struct MockBackend {
    state: Mutex<MockState>,
    edge_signal: Condvar,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                lines: FxHashMap::default(),
                pending: false,
                notify_edges: true,
            }),
            edge_signal: Condvar::new(),
        }
    }
}

impl MockBackend {
    /// Externally drive a line level, as the hardware would.
    pub fn set_line_value(&self, path: &Path, value: u8) {
        let mut state = self.state.lock();
        let line = state.lines.entry(path.to_path_buf()).or_default();
        let changed = line.value != value;
        line.value = value;
        let armed = line.armed;
        if changed && armed && state.notify_edges {
            state.pending = true;
            self.edge_signal.notify_all();
        }
    }

    pub fn line_value(&self, path: &Path) -> u8 {
        let mut state = self.state.lock();
        state.lines.entry(path.to_path_buf()).or_default().value
    }

    pub fn suppress_edge_notifications(&self, suppress: bool) {
        self.state.lock().notify_edges = !suppress;
    }

    pub fn set_read_error(&self, path: &Path, fail: bool) {
        let mut state = self.state.lock();
        state.lines.entry(path.to_path_buf()).or_default().fail_reads = fail;
    }

    pub fn is_armed(&self, path: &Path) -> bool {
        self.state
            .lock()
            .lines
            .get(path)
            .is_some_and(|l| l.armed)
    }
}

impl GpioBackend for MockBackend {
    fn read_value(&self, path: &Path) -> Result<u8, AppError> {
        let mut state = self.state.lock();
        let line = state.lines.entry(path.to_path_buf()).or_default();
        if line.fail_reads {
            return Err(AppError::Gpio(format!(
                "injected read failure on {}",
                path.display()
            )));
        }
        Ok(line.value)
    }

    fn write_value(&self, path: &Path, value: u8) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let line = state.lines.entry(path.to_path_buf()).or_default();
        let changed = line.value != value;
        line.value = value;
        let armed = line.armed;
        if changed && armed && state.notify_edges {
            state.pending = true;
            self.edge_signal.notify_all();
        }
        Ok(())
    }

    fn arm_edge(&self, path: &Path) -> Result<(), AppError> {
        let mut state = self.state.lock();
        state.lines.entry(path.to_path_buf()).or_default().armed = true;
        Ok(())
    }

    fn release(&self, path: &Path) {
        let mut state = self.state.lock();
        if let Some(line) = state.lines.get_mut(path) {
            line.armed = false;
        }
    }

    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, AppError> {
        let mut state = self.state.lock();
        if !state.pending {
            self.edge_signal.wait_for(&mut state, timeout);
        }
        let fired = state.pending;
        state.pending = false;
        Ok(fired)
    }
}
