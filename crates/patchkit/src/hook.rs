//! Function redirection with trampoline preservation

use tracing::debug;

use crate::error::{Error, Result};
use crate::host::CodeRedirect;
use crate::image::ModuleImage;
use crate::resolve::{ResolveTarget, Resolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    target: ResolveTarget,
    replacement: u64,
    original: Option<String>,
}

impl HookSpec {
    pub fn new(target: ResolveTarget, replacement: u64) -> Self {
        Self {
            target,
            replacement,
            original: None,
        }
    }

    /// Record the trampoline under `key` so later requests can call or patch it
    pub fn keep_original(mut self, key: impl Into<String>) -> Self {
        self.original = Some(key.into());
        self
    }

    pub fn target(&self) -> &ResolveTarget {
        &self.target
    }

    pub fn replacement(&self) -> u64 {
        self.replacement
    }

    pub fn original_key(&self) -> Option<&str> {
        self.original.as_deref()
    }
}

/// Resolve the hook target and redirect it to the replacement.
///
/// Returns the trampoline address that still runs the original code. A
/// trampoline of zero or equal to the replacement is treated as a failed
/// install, although the target has already been redirected by then.
pub fn install_hook(
    resolver: &Resolver<'_>,
    image: &ModuleImage<'_>,
    spec: &HookSpec,
    redirect: &mut dyn CodeRedirect,
) -> Result<u64> {
    let target = resolver.resolve(&spec.target, image)?;
    redirect_resolved(target, spec, redirect)
}

/// Second half of [`install_hook`] for a target that is already resolved.
///
/// An unusable trampoline is reported only after the host primitive
/// returned, so the redirect may already be live when this fails.
pub fn redirect_resolved(
    target: u64,
    spec: &HookSpec,
    redirect: &mut dyn CodeRedirect,
) -> Result<u64> {
    let trampoline = redirect.redirect(target, spec.replacement)?;

    if trampoline == 0 || trampoline == spec.replacement {
        return Err(Error::RedirectInstallFailed {
            address: target,
            message: format!("unusable trampoline {:#x}", trampoline),
        });
    }

    debug!(
        "Routed `{}` {:#x} -> {:#x} (original at {:#x})",
        spec.target.label(),
        target,
        spec.replacement,
        trampoline
    );
    Ok(trampoline)
}
