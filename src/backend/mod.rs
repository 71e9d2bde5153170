#[cfg(feature = "hardware-gpio")]
pub mod sysfs;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use sysfs::SysfsBackend;
pub use mock::MockBackend;

use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

/// Raw access to GPIO lines exposed as directories holding `value` and
/// `edge` files. One backend instance serves every line in the process.
pub trait GpioBackend: Send + Sync {
    fn read_value(&self, path: &Path) -> Result<u8, AppError>;

    fn write_value(&self, path: &Path, value: u8) -> Result<(), AppError>;

    /// Arm edge notification for a line so `wait_edge_events` covers it.
    /// Lines that cannot be armed are still readable; callers fall back to
    /// resyncing by value.
    fn arm_edge(&self, path: &Path) -> Result<(), AppError>;

    fn release(&self, path: &Path);

    /// Block until an armed line signals an edge, or the timeout elapses.
    /// Returns whether an event fired. An `Err` is unrecoverable.
    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, AppError>;
}
