//! Scoped write access to code pages

use tracing::{debug, error};

use crate::error::Result;
use crate::host::WriteProtection;

/// Keeps code pages writable while alive.
///
/// Protection is restored when the guard is dropped, including on early
/// returns and `?` propagation. Use [`WritableGuard::release`] to observe a
/// failing restore instead of only logging it.
pub struct WritableGuard<'a> {
    protection: &'a mut dyn WriteProtection,
    active: bool,
}

impl<'a> WritableGuard<'a> {
    pub fn acquire(protection: &'a mut dyn WriteProtection) -> Result<Self> {
        protection.set_writable(true)?;
        debug!("Code pages writable");
        Ok(Self {
            protection,
            active: true,
        })
    }

    /// Restore protection now and report the outcome
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.protection.set_writable(false)?;
        debug!("Code pages protected");
        Ok(())
    }
}

impl Drop for WritableGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.protection.set_writable(false) {
            Ok(()) => debug!("Code pages protected"),
            Err(e) => error!("Failed to restore write protection: {}", e),
        }
    }
}
