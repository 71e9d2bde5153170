use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;
use tokio::time;

use crate::backend::GpioBackend;

/// Default coil pulse length for bistable relays.
pub const PULSE_LEN: Duration = Duration::from_millis(2000);
/// Feedback poll interval while a pulse is active.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// One physical relay output. Monostable relays hold their single coil at
/// the requested level; bistable relays pulse one of two coils and must
/// never be left with a coil energized.
pub enum Relay {
    Monostable(MonostableRelay),
    Bistable(BistableRelay),
}

impl Relay {
    /// Build a relay from the line paths sharing its basename. The set coil
    /// is the path ending in `_set` or in the relay id itself, `_res` is
    /// the reset coil and `_in` an optional feedback input.
    pub fn from_paths(
        id: &str,
        name: &str,
        paths: &[PathBuf],
        backend: Arc<dyn GpioBackend>,
    ) -> Option<Relay> {
        let mut set = None;
        let mut reset = None;
        let mut fb = None;
        for path in paths {
            let s = path.to_string_lossy();
            if s.ends_with("_in") {
                fb = Some(path.clone());
            } else if s.ends_with("_res") {
                reset = Some(path.clone());
            } else if s.ends_with("_set") || s.ends_with(id) {
                set = Some(path.clone());
            }
        }

        match (set, reset) {
            (Some(set), None) => Some(Relay::Monostable(MonostableRelay {
                name: name.to_string(),
                path: set,
                fb,
                backend,
            })),
            (Some(set), Some(reset)) => Some(Relay::Bistable(BistableRelay {
                name: name.to_string(),
                set_path: set,
                reset_path: reset,
                fb,
                backend,
                pulse_len: PULSE_LEN,
                state: 0,
                confirm: None,
            })),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Relay::Monostable(r) => &r.name,
            Relay::Bistable(r) => &r.name,
        }
    }

    /// The primary coil path, used as the connection identity.
    pub fn connection(&self) -> &Path {
        match self {
            Relay::Monostable(r) => &r.path,
            Relay::Bistable(r) => &r.set_path,
        }
    }

    pub fn has_feedback(&self) -> bool {
        match self {
            Relay::Monostable(r) => r.fb.is_some(),
            Relay::Bistable(r) => r.fb.is_some(),
        }
    }

    /// Current level reported by the feedback line, if there is one and it
    /// can be read.
    pub fn feedback_state(&self) -> Option<u8> {
        let (fb, backend) = match self {
            Relay::Monostable(r) => (r.fb.as_ref()?, &r.backend),
            Relay::Bistable(r) => (r.fb.as_ref()?, &r.backend),
        };
        match backend.read_value(fb) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("feedback read failed: {e}");
                None
            }
        }
    }

    /// Drive the relay to `level`. Success reflects the coil write only;
    /// feedback confirmation runs asynchronously for bistable relays.
    pub fn set_state(&mut self, level: u8) -> bool {
        match self {
            Relay::Monostable(r) => r.set_state(level),
            Relay::Bistable(r) => r.set_state(level),
        }
    }

    /// Wait for a pending bistable pulse to finish; used by orderly
    /// shutdown so coils are released before exit.
    pub async fn settle(&mut self) {
        if let Relay::Bistable(r) = self
            && let Some(handle) = r.confirm.take()
        {
            let _ = handle.await;
        }
    }
}

pub struct MonostableRelay {
    name: String,
    path: PathBuf,
    fb: Option<PathBuf>,
    backend: Arc<dyn GpioBackend>,
}

impl MonostableRelay {
    fn set_state(&mut self, level: u8) -> bool {
        if let Err(e) = self.backend.write_value(&self.path, level) {
            warn!("relay {}: {e}", self.name);
            return false;
        }
        true
    }
}

pub struct BistableRelay {
    name: String,
    set_path: PathBuf,
    reset_path: PathBuf,
    fb: Option<PathBuf>,
    backend: Arc<dyn GpioBackend>,
    pulse_len: Duration,
    state: u8,
    confirm: Option<JoinHandle<()>>,
}

impl BistableRelay {
    /// Override the coil pulse length; the feedback retry budget follows
    /// as `pulse_len / CHECK_INTERVAL`.
    pub fn set_pulse_len(&mut self, pulse_len: Duration) {
        self.pulse_len = pulse_len;
    }

    fn set_state(&mut self, level: u8) -> bool {
        let coil = if level != 0 {
            &self.set_path
        } else {
            &self.reset_path
        };
        if let Err(e) = self.backend.write_value(coil, 1) {
            warn!("relay {}: {e}", self.name);
            return false;
        }

        // A second request inside the pulse window supersedes the previous
        // confirm cycle; its own cleanup releases both coils.
        if let Some(handle) = self.confirm.take() {
            handle.abort();
        }
        self.state = level;

        let backend = self.backend.clone();
        let set_path = self.set_path.clone();
        let reset_path = self.reset_path.clone();
        let fb = self.fb.clone();
        let name = self.name.clone();
        let pulse_len = self.pulse_len;

        self.confirm = Some(actix_web::rt::spawn(async move {
            match fb {
                Some(fb) => {
                    let budget =
                        (pulse_len.as_millis() / CHECK_INTERVAL.as_millis()).max(1) as u32;
                    let mut retries = 0;
                    loop {
                        time::sleep(CHECK_INTERVAL).await;
                        if backend.read_value(&fb).ok() == Some(level) {
                            break;
                        }
                        retries += 1;
                        if retries >= budget {
                            warn!("relay {name} failed to reach state {level}");
                            break;
                        }
                    }
                }
                None => time::sleep(pulse_len).await,
            }

            // Release both coils, confirmed or not.
            for path in [&set_path, &reset_path] {
                if let Err(e) = backend.write_value(path, 0) {
                    warn!("relay {name} coil release: {e}");
                }
            }
        }));
        true
    }
}
