use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::GpioBackend;
use crate::error::AppError;

/// Sysfs-style line access: `<line>/value` read/write plus `<line>/edge`
/// to arm interrupt notification, multiplexed with `poll(2)` on `POLLPRI`.
pub struct SysfsBackend {
    // value-file descriptor per armed line
    armed: Mutex<FxHashMap<PathBuf, File>>,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsBackend {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(FxHashMap::default()),
        }
    }

    // Line paths are often symlinks under /dev/gpio; resolve them so the
    // armed map has one entry per physical line.
    fn resolve(path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn parse_level(buf: &[u8], path: &Path) -> Result<u8, AppError> {
        match buf.first() {
            Some(b'0') => Ok(0),
            Some(b'1') => Ok(1),
            _ => Err(AppError::Gpio(format!(
                "unexpected value in {}",
                path.display()
            ))),
        }
    }

    fn read_fd(file: &mut File, path: &Path) -> Result<u8, AppError> {
        file.seek(SeekFrom::Start(0))
            .map_err(|e| AppError::Gpio(format!("seek {}: {e}", path.display())))?;
        let mut buf = [0u8; 4];
        let n = file
            .read(&mut buf)
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", path.display())))?;
        Self::parse_level(&buf[..n], path)
    }
}

impl GpioBackend for SysfsBackend {
    fn read_value(&self, path: &Path) -> Result<u8, AppError> {
        let resolved = Self::resolve(path);

        if let Some(file) = self.armed.lock().get_mut(&resolved) {
            return Self::read_fd(file, &resolved);
        }

        let buf = fs::read(resolved.join("value"))
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", resolved.display())))?;
        Self::parse_level(&buf, &resolved)
    }

    fn write_value(&self, path: &Path, value: u8) -> Result<(), AppError> {
        let resolved = Self::resolve(path);
        let mut file = OpenOptions::new()
            .write(true)
            .open(resolved.join("value"))
            .map_err(|e| AppError::Gpio(format!("open {}: {e}", resolved.display())))?;
        file.write_all(if value != 0 { b"1" } else { b"0" })
            .map_err(|e| AppError::Gpio(format!("write {}: {e}", resolved.display())))
    }

    fn arm_edge(&self, path: &Path) -> Result<(), AppError> {
        let resolved = Self::resolve(path);

        // Not every line supports edge notification; the caller's resync
        // loop still picks changes up by value.
        if let Err(e) = fs::write(resolved.join("edge"), b"both") {
            warn!("cannot arm edge on {}: {e}", resolved.display());
        }

        let mut file = File::open(resolved.join("value"))
            .map_err(|e| AppError::Gpio(format!("open {}: {e}", resolved.display())))?;
        // Flush the current level so a pending interrupt does not fire
        // immediately for the pre-registration state.
        let _ = Self::read_fd(&mut file, &resolved);

        self.armed.lock().insert(resolved, file);
        Ok(())
    }

    fn release(&self, path: &Path) {
        self.armed.lock().remove(&Self::resolve(path));
    }

    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, AppError> {
        // Snapshot the descriptors so register/release calls from the event
        // context never wait for a poll in flight. A line released during
        // the wait shows up as POLLNVAL and is ignored.
        let fds: Vec<i32> = self
            .armed
            .lock()
            .values()
            .map(|f| f.as_raw_fd())
            .collect();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: (libc::POLLPRI | libc::POLLERR) as i16,
                revents: 0,
            })
            .collect();

        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(AppError::Gpio(format!("poll failed: {err}")));
        }
        if ret == 0 {
            return Ok(false);
        }

        // Consume the notification so the next wait blocks again; levels
        // are reported by the caller's resync, not from here.
        let mut armed = self.armed.lock();
        for pfd in pollfds.iter().filter(|p| p.revents & libc::POLLPRI as i16 != 0) {
            if let Some((path, file)) = armed
                .iter_mut()
                .find(|(_, f)| f.as_raw_fd() == pfd.fd)
                .map(|(p, f)| (p.clone(), f))
                && let Err(e) = Self::read_fd(file, &path)
            {
                warn!("flush after edge on {}: {e}", path.display());
            }
        }
        Ok(true)
    }
}
