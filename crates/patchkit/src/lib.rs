//! # patchkit
//!
//! Runtime code patching for modules loaded by a host loader.
//!
//! This crate provides:
//! - Masked byte pattern matching over module images
//! - Address resolution by symbol with pattern fallback
//! - Masked binary patches, at an exact site or by scanning for occurrences
//! - Function hooks that keep a callable trampoline to the original code
//! - Ordered all-or-nothing batches driven from code or JSON patch tables
//!
//! The host loader supplies symbol lookup, page protection and the redirect
//! primitive through the traits in [`host`].

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hook;
pub mod host;
pub mod image;
pub mod patch;
pub mod pattern;
pub mod platform;
pub mod protect;
pub mod resolve;

#[cfg(test)]
mod mock;

pub use batch::{Batch, BatchReport, Entry, Outcome, Request, RequestKind, RequestState, ResolutionTable};
pub use config::{EntryKind, PatchTable, Replacements, TableEntry, TargetSpec, load_table, save_table};
pub use dispatch::LoadDispatcher;
pub use error::{Error, Result};
pub use hook::{HookSpec, install_hook, redirect_resolved};
pub use host::{CodeRedirect, HostServices, NoSymbols, SymbolTable, WriteProtection};
pub use image::ModuleImage;
pub use patch::{PatchSite, PatchSpec, apply_patch};
pub use pattern::{BytePattern, Matches, find_all, find_pattern, format_pattern, parse_hex_bytes, parse_tokens};
pub use protect::WritableGuard;
pub use resolve::{RelativeTarget, ResolveTarget, Resolver};
