//! Services provided by the host loader
//!
//! The engine never looks symbols up, toggles page protection or installs
//! redirects by itself. The embedding application implements these traits
//! and hands them over bundled in [`HostServices`] for one load event.

use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::error::Result;

/// Symbol lookup inside a loaded module
pub trait SymbolTable {
    fn lookup(&self, module: &str, name: &str) -> Option<u64>;
}

/// Global toggle for writing to code pages.
///
/// Implementations should report failures as
/// [`Error::WriteProtectionToggleFailed`](crate::Error::WriteProtectionToggleFailed).
/// Callers go through [`WritableGuard`](crate::WritableGuard) rather than
/// calling this directly.
pub trait WriteProtection {
    fn set_writable(&mut self, writable: bool) -> Result<()>;
}

/// Installs a redirect from `target` to `replacement` and returns a callable
/// address that still performs the original behavior.
///
/// Implementations should report failures as
/// [`Error::RedirectInstallFailed`](crate::Error::RedirectInstallFailed).
pub trait CodeRedirect {
    fn redirect(&mut self, target: u64, replacement: u64) -> Result<u64>;
}

/// Symbol table for modules that ship without one
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolTable for NoSymbols {
    fn lookup(&self, _module: &str, _name: &str) -> Option<u64> {
        None
    }
}

/// A flat name -> address map, independent of the module identifier
impl<S: BuildHasher> SymbolTable for HashMap<String, u64, S> {
    fn lookup(&self, _module: &str, name: &str) -> Option<u64> {
        self.get(name).copied()
    }
}

/// The host services available during one load notification
pub struct HostServices<'h> {
    pub symbols: &'h dyn SymbolTable,
    pub protection: &'h mut dyn WriteProtection,
    pub redirect: &'h mut dyn CodeRedirect,
}

impl<'h> HostServices<'h> {
    pub fn new(
        symbols: &'h dyn SymbolTable,
        protection: &'h mut dyn WriteProtection,
        redirect: &'h mut dyn CodeRedirect,
    ) -> Self {
        Self {
            symbols,
            protection,
            redirect,
        }
    }
}
