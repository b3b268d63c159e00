use std::ffi::c_void;

use tracing::debug;
use windows::Win32::System::Memory::{PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect};

use crate::error::{Error, Result};
use crate::host::WriteProtection;

/// Write-protection toggle over one code range of the current process.
///
/// Enabling switches the range to `PAGE_EXECUTE_READWRITE`; restoring puts
/// back the protection reported for the first page of the range.
#[derive(Debug)]
pub struct PageProtection {
    address: usize,
    size: usize,
    saved: Option<PAGE_PROTECTION_FLAGS>,
}

impl PageProtection {
    pub fn new(address: u64, size: usize) -> Self {
        Self {
            address: address as usize,
            size,
            saved: None,
        }
    }

    fn protect(&self, flags: PAGE_PROTECTION_FLAGS) -> Result<PAGE_PROTECTION_FLAGS> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe { VirtualProtect(self.address as *const c_void, self.size, flags, &mut old) }
            .map_err(|e| {
                Error::WriteProtectionToggleFailed(format!(
                    "VirtualProtect({:#x}, {:#x}) failed: {}",
                    self.address, self.size, e
                ))
            })?;
        Ok(old)
    }
}

impl WriteProtection for PageProtection {
    fn set_writable(&mut self, writable: bool) -> Result<()> {
        if writable {
            if self.saved.is_some() {
                return Err(Error::WriteProtectionToggleFailed(
                    "pages are already writable".to_string(),
                ));
            }
            let old = self.protect(PAGE_EXECUTE_READWRITE)?;
            debug!("Range {:#x}+{:#x} writable (was {:#x})", self.address, self.size, old.0);
            self.saved = Some(old);
        } else if let Some(old) = self.saved.take() {
            self.protect(old)?;
        }
        Ok(())
    }
}
