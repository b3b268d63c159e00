//! Test doubles for the host services

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::host::{CodeRedirect, HostServices, WriteProtection};

/// Addresses handed out for trampolines start here
const TRAMPOLINE_BASE: u64 = 0x7F00_0000;
const TRAMPOLINE_STRIDE: u64 = 0x40;

pub type Behavior = fn(u32) -> u32;

#[derive(Debug, Default)]
pub struct MockProtection {
    pub writable: bool,
    pub enables: usize,
    pub restores: usize,
    pub fail_enable: bool,
    pub fail_restore: bool,
}

impl WriteProtection for MockProtection {
    fn set_writable(&mut self, writable: bool) -> Result<()> {
        if writable {
            if self.fail_enable {
                return Err(Error::WriteProtectionToggleFailed("enable refused".to_string()));
            }
            assert!(!self.writable, "write protection toggled re-entrantly");
            self.enables += 1;
        } else {
            self.restores += 1;
            if self.fail_restore {
                return Err(Error::WriteProtectionToggleFailed("restore refused".to_string()));
            }
        }
        self.writable = writable;
        Ok(())
    }
}

/// Redirect primitive over a table of callable "functions".
///
/// Redirecting moves the target's behavior to a fresh trampoline address and
/// makes the target behave like the replacement.
#[derive(Debug, Default)]
pub struct MockRedirect {
    pub functions: HashMap<u64, Behavior>,
    pub installed: Vec<(u64, u64)>,
    pub fail: bool,
}

impl MockRedirect {
    pub fn define(&mut self, address: u64, behavior: Behavior) {
        self.functions.insert(address, behavior);
    }

    pub fn call(&self, address: u64, arg: u32) -> u32 {
        let behavior = self
            .functions
            .get(&address)
            .unwrap_or_else(|| panic!("no function at {:#x}", address));
        behavior(arg)
    }
}

impl CodeRedirect for MockRedirect {
    fn redirect(&mut self, target: u64, replacement: u64) -> Result<u64> {
        if self.fail {
            return Err(Error::RedirectInstallFailed {
                address: target,
                message: "redirect refused".to_string(),
            });
        }
        let original = self.functions.get(&target).copied();
        let new = self.functions.get(&replacement).copied();
        let (Some(original), Some(new)) = (original, new) else {
            return Err(Error::RedirectInstallFailed {
                address: target,
                message: "unknown function".to_string(),
            });
        };

        let trampoline = TRAMPOLINE_BASE + self.installed.len() as u64 * TRAMPOLINE_STRIDE;
        self.functions.insert(trampoline, original);
        self.functions.insert(target, new);
        self.installed.push((target, replacement));
        Ok(trampoline)
    }
}

#[derive(Debug, Default)]
pub struct MockHost {
    pub symbols: HashMap<String, u64>,
    pub protection: MockProtection,
    pub redirect: MockRedirect,
}

impl MockHost {
    pub fn with_symbol(mut self, name: &str, address: u64) -> Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    pub fn services(&mut self) -> HostServices<'_> {
        HostServices::new(&self.symbols, &mut self.protection, &mut self.redirect)
    }
}

/// Builds a zero-filled module buffer with byte sequences placed at offsets
#[derive(Debug, Clone)]
pub struct MockImageBuilder {
    bytes: Vec<u8>,
}

impl MockImageBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn fill(mut self, byte: u8) -> Self {
        self.bytes.fill(byte);
        self
    }

    pub fn place(mut self, offset: usize, data: &[u8]) -> Self {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
