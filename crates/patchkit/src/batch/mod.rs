//! Ordered, all-or-nothing execution of resolve / patch / hook requests
//!
//! Later requests routinely consume addresses produced by earlier ones, so
//! the first failing mandatory request aborts the rest of the batch. The
//! [`ResolutionTable`] is owned by the caller and keeps whatever was written
//! before the failure.
//!
//! ```text
//! Pending -> Resolving -> Resolved -> Applying -> Applied
//!                 \            \           \
//!                  +------------+-----------+--> Failed
//! ```

mod resolution;

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::hook::{HookSpec, redirect_resolved};
use crate::host::HostServices;
use crate::image::ModuleImage;
use crate::patch::{PatchSite, PatchSpec, apply_patch};
use crate::resolve::{ResolveTarget, Resolver};

pub use resolution::ResolutionTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Resolve a target and store its address under `key`
    Resolve { key: String, target: ResolveTarget },
    /// Apply a patch to a site of the module
    Patch {
        name: String,
        site: PatchSite,
        spec: PatchSpec,
    },
    /// Redirect a function, optionally storing the trampoline
    Hook(HookSpec),
}

impl Request {
    pub fn resolve(key: impl Into<String>, target: ResolveTarget) -> Self {
        Request::Resolve {
            key: key.into(),
            target,
        }
    }

    pub fn patch(name: impl Into<String>, site: PatchSite, spec: PatchSpec) -> Self {
        Request::Patch {
            name: name.into(),
            site,
            spec,
        }
    }

    pub fn hook(spec: HookSpec) -> Self {
        Request::Hook(spec)
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Resolve { .. } => RequestKind::Resolve,
            Request::Patch { .. } => RequestKind::Patch,
            Request::Hook(_) => RequestKind::Hook,
        }
    }

    /// Name used in logs and failure reports
    pub fn name(&self) -> String {
        match self {
            Request::Resolve { key, .. } => key.clone(),
            Request::Patch { name, .. } => name.clone(),
            Request::Hook(spec) => spec.target().label(),
        }
    }

    /// A failure of this request is logged and the batch carries on
    pub fn optional(self) -> Entry {
        Entry::from(self).optional()
    }

    /// Only run this request when `enabled` holds
    pub fn when(self, enabled: bool) -> Entry {
        Entry::from(self).when(enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Resolve,
    Patch,
    Hook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Resolving,
    Resolved,
    Applying,
    Applied,
    Failed,
    Skipped,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Skipped)
    }

    fn can_advance_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Pending, Skipped)
                | (Resolving, Resolved)
                | (Resolved, Applying)
                | (Applying, Applied)
                | (Resolving | Resolved | Applying, Failed)
        )
    }
}

/// Tracks one request through its states
struct Progress<'a> {
    name: &'a str,
    state: RequestState,
}

impl<'a> Progress<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            state: RequestState::Pending,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        trace!("`{}`: {} -> {}", self.name, self.state, next);
        self.state = next;
    }
}

/// A request together with its batch flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub request: Request,
    pub mandatory: bool,
    pub enabled: bool,
}

impl From<Request> for Entry {
    fn from(request: Request) -> Self {
        Self {
            request,
            mandatory: true,
            enabled: true,
        }
    }
}

impl Entry {
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn when(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub index: usize,
    pub name: String,
    pub kind: RequestKind,
    pub state: RequestState,
}

/// Terminal state of every request the batch reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub module: String,
    pub outcomes: Vec<Outcome>,
}

impl BatchReport {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            outcomes: Vec::new(),
        }
    }

    pub fn count(&self, state: RequestState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn applied(&self) -> usize {
        self.count(RequestState::Applied)
    }

    pub fn skipped(&self) -> usize {
        self.count(RequestState::Skipped)
    }

    /// Optional requests that failed
    pub fn failed(&self) -> usize {
        self.count(RequestState::Failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<Entry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: impl Into<Entry>) -> &mut Self {
        self.entries.push(entry.into());
        self
    }

    pub fn with(mut self, entry: impl Into<Entry>) -> Self {
        self.entries.push(entry.into());
        self
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Execute every entry in order against `image`.
    ///
    /// Stops at the first failing mandatory request and returns
    /// [`Error::RequestFailed`] with its index and name. Nothing after it runs.
    /// Platform failures ([`Error::is_platform`]) stop the batch even for
    /// optional requests.
    pub fn run(
        &self,
        image: &mut ModuleImage<'_>,
        host: &mut HostServices<'_>,
        resolved: &mut ResolutionTable,
    ) -> Result<BatchReport> {
        info!(
            "Applying {} request(s) to {}",
            self.entries.len(),
            image.id()
        );
        let mut report = BatchReport::new(image.id());

        for (index, entry) in self.entries.iter().enumerate() {
            let name = entry.request.name();
            let mut progress = Progress::new(&name);

            if !entry.enabled {
                debug!("Skipping disabled request #{} ({})", index, name);
                progress.advance(RequestState::Skipped);
            } else {
                match execute(&entry.request, image, host, resolved, &mut progress) {
                    Ok(()) => debug!("Applied request #{} ({})", index, name),
                    Err(e) => {
                        progress.advance(RequestState::Failed);
                        if entry.mandatory || e.is_platform() {
                            error!("Request #{} ({}) failed: {}", index, name, e);
                            return Err(Error::RequestFailed {
                                index,
                                name,
                                source: Box::new(e),
                            });
                        }
                        warn!("Optional request #{} ({}) failed: {}", index, name, e);
                    }
                }
            }

            report.outcomes.push(Outcome {
                index,
                kind: entry.request.kind(),
                state: progress.state,
                name,
            });
        }

        info!(
            "Finished {}: {} applied, {} skipped, {} optional failure(s)",
            report.module,
            report.applied(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }
}

impl FromIterator<Entry> for Batch {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<Entry> for Batch {
    fn extend<I: IntoIterator<Item = Entry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

fn execute(
    request: &Request,
    image: &mut ModuleImage<'_>,
    host: &mut HostServices<'_>,
    resolved: &mut ResolutionTable,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let resolver = Resolver::new(host.symbols);
    progress.advance(RequestState::Resolving);

    match request {
        Request::Resolve { key, target } => {
            resolved.ensure_vacant(key)?;
            let address = resolver.resolve(target, image)?;
            progress.advance(RequestState::Resolved);
            progress.advance(RequestState::Applying);
            resolved.insert(key.as_str(), address)?;
        }
        Request::Patch { site, spec, .. } => {
            let region = site.region(image, resolved)?;
            progress.advance(RequestState::Resolved);
            progress.advance(RequestState::Applying);
            apply_patch(region, spec, &mut *host.protection)?;
        }
        Request::Hook(spec) => {
            if let Some(key) = spec.original_key() {
                resolved.ensure_vacant(key)?;
            }
            let target = resolver.resolve(spec.target(), image)?;
            progress.advance(RequestState::Resolved);
            progress.advance(RequestState::Applying);
            let trampoline = redirect_resolved(target, spec, &mut *host.redirect)?;
            if let Some(key) = spec.original_key() {
                resolved.insert(key, trampoline)?;
            }
        }
    }

    progress.advance(RequestState::Applied);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHost, MockImageBuilder};
    use crate::pattern::BytePattern;

    const BASE: u64 = 0x20_0000;
    const WRAPPER: u64 = 0x99_0000;

    fn original_behavior(x: u32) -> u32 {
        x ^ 0xFF
    }

    fn wrapped_behavior(x: u32) -> u32 {
        x + 7
    }

    fn image_bytes() -> Vec<u8> {
        MockImageBuilder::new(0x100)
            .place(0x20, &[0x55, 0x48, 0x89, 0xE5, 0x31, 0xC0])
            .place(0x80, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3])
            .build()
    }

    fn prologue() -> BytePattern {
        BytePattern::parse("55 48 89 E5 31 C0").unwrap()
    }

    #[test]
    fn test_failure_aborts_but_keeps_earlier_side_effects() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default();
        let mut resolved = ResolutionTable::new();

        let missing = BytePattern::parse("DE AD BE EF").unwrap();
        let batch = Batch::new()
            .with(Request::resolve("init", ResolveTarget::pattern(prologue())))
            .with(Request::patch(
                "missing",
                PatchSite::Module,
                PatchSpec::scan(missing, vec![0; 4]).unwrap(),
            ))
            .with(Request::resolve("never", ResolveTarget::pattern(prologue())));

        let err = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap_err();
        match err {
            Error::RequestFailed {
                index,
                name,
                source,
            } => {
                assert_eq!(index, 1);
                assert_eq!(name, "missing");
                assert!(matches!(*source, Error::InsufficientOccurrences { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(resolved.get("init"), Some(BASE + 0x20));
        assert_eq!(resolved.get("never"), None);
    }

    #[test]
    fn test_optional_failure_continues() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default();
        let mut resolved = ResolutionTable::new();

        let batch = Batch::new()
            .with(Request::resolve("cosmetic", ResolveTarget::symbol("_backlight")).optional())
            .with(Request::resolve("init", ResolveTarget::pattern(prologue())));

        let report = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.applied(), 1);
        assert!(!report.is_clean());
        assert_eq!(report.outcomes[0].state, RequestState::Failed);
        assert_eq!(resolved.get("init"), Some(BASE + 0x20));
    }

    #[test]
    fn test_optional_platform_failure_still_aborts() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default();
        host.protection.fail_enable = true;
        let mut resolved = ResolutionTable::new();

        let batch = Batch::new()
            .with(Request::resolve("init", ResolveTarget::pattern(prologue())))
            .with(
                Request::patch(
                    "cosmetic nop",
                    PatchSite::At {
                        key: "init".to_string(),
                        offset: 4,
                    },
                    PatchSpec::exact(vec![0x90, 0x90]).unwrap(),
                )
                .optional(),
            )
            .with(Request::resolve("later", ResolveTarget::pattern(prologue())));

        let err = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap_err();
        assert!(matches!(err, Error::RequestFailed { index: 1, .. }));
        assert!(matches!(err.root_cause(), Error::WriteProtectionToggleFailed(_)));
        assert_eq!(resolved.get("later"), None);
        assert_eq!(bytes[0x24..0x26], [0x31, 0xC0]);
    }

    #[test]
    fn test_optional_hook_redirect_failure_aborts() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default();
        host.redirect.fail = true;
        let mut resolved = ResolutionTable::new();

        let batch = Batch::new()
            .with(
                Request::hook(HookSpec::new(ResolveTarget::pattern(prologue()), WRAPPER))
                    .optional(),
            )
            .with(Request::resolve("later", ResolveTarget::pattern(prologue())));

        let err = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap_err();
        assert!(err.is_platform());
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_disabled_request_is_skipped() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default();
        let mut resolved = ResolutionTable::new();

        let batch: Batch = [
            Request::resolve("a", ResolveTarget::symbol("_missing")).when(false),
            Request::resolve("b", ResolveTarget::pattern(prologue())).into(),
        ]
        .into_iter()
        .collect();

        let report = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap();
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.outcomes[0].state, RequestState::Skipped);
        assert_eq!(resolved.get("a"), None);
    }

    #[test]
    fn test_hook_trampoline_feeds_later_patch() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default().with_symbol("_init", BASE + 0x20);
        host.redirect.define(BASE + 0x20, original_behavior);
        host.redirect.define(WRAPPER, wrapped_behavior);
        let mut resolved = ResolutionTable::new();

        let batch = Batch::new()
            .with(Request::hook(
                HookSpec::new(ResolveTarget::symbol("_init"), WRAPPER).keep_original("orgInit"),
            ))
            .with(Request::resolve(
                "getValue",
                ResolveTarget::pattern(BytePattern::parse("B8 ?? 00 00 00 C3").unwrap()),
            ))
            .with(Request::patch(
                "return 5",
                PatchSite::At {
                    key: "getValue".to_string(),
                    offset: 1,
                },
                PatchSpec::exact(vec![0x05]).unwrap(),
            ));

        let report = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap();
        assert_eq!(report.applied(), 3);

        let trampoline = resolved.require("orgInit").unwrap();
        assert_eq!(host.redirect.call(BASE + 0x20, 1), 8);
        assert_eq!(host.redirect.call(trampoline, 1), 0xFE);
        assert_eq!(bytes[0x80..0x86], [0xB8, 0x05, 0x00, 0x00, 0x00, 0xC3]);
        assert!(!host.protection.writable);
    }

    #[test]
    fn test_patch_window_after_resolve() {
        let mut bytes = MockImageBuilder::new(0x40)
            .place(0x00, &[0x74, 0x05])
            .place(0x20, &[0x74, 0x05])
            .build();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default().with_symbol("_setupCursors", BASE + 0x18);
        let mut resolved = ResolutionTable::new();

        // je -> jmp, but only inside the resolved function
        let batch = Batch::new()
            .with(Request::resolve("setupCursors", ResolveTarget::symbol("_setupCursors")))
            .with(Request::patch(
                "always jump",
                PatchSite::Window {
                    key: "setupCursors".to_string(),
                    len: 0x20,
                },
                PatchSpec::scan(BytePattern::parse("74 ??").unwrap(), vec![0xEB, 0x00])
                    .unwrap()
                    .replace_mask(vec![0xFF, 0x00])
                    .unwrap(),
            ));

        batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap();
        assert_eq!(bytes[0x00..0x02], [0x74, 0x05]);
        assert_eq!(bytes[0x20..0x22], [0xEB, 0x05]);
    }

    #[test]
    fn test_duplicate_original_key_fails_before_redirect() {
        let mut bytes = image_bytes();
        let mut image = ModuleImage::new("mod", BASE, &mut bytes);
        let mut host = MockHost::default().with_symbol("_init", BASE + 0x20);
        host.redirect.define(BASE + 0x20, original_behavior);
        host.redirect.define(WRAPPER, wrapped_behavior);
        let mut resolved = ResolutionTable::new();
        resolved.insert("orgInit", 0x1).unwrap();

        let batch = Batch::new().with(Request::hook(
            HookSpec::new(ResolveTarget::symbol("_init"), WRAPPER).keep_original("orgInit"),
        ));
        let err = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::DuplicateKey(_)));
        assert!(host.redirect.installed.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        assert!(RequestState::Pending.can_advance_to(RequestState::Resolving));
        assert!(RequestState::Applying.can_advance_to(RequestState::Failed));
        assert!(!RequestState::Pending.can_advance_to(RequestState::Applied));
        assert!(!RequestState::Applied.can_advance_to(RequestState::Failed));
        assert!(RequestState::Skipped.is_terminal());
        assert_eq!(RequestState::Resolving.to_string(), "resolving");
    }
}
