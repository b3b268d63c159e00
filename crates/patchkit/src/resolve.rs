//! Symbol-first address resolution with pattern fallback

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::SymbolTable;
use crate::image::ModuleImage;
use crate::pattern::{BytePattern, find_pattern};

/// Where a 32-bit displacement sits inside a pattern match.
///
/// The resolved address becomes `match + next_offset + disp`, with `disp`
/// read little-endian from `match + disp_offset`. Used when the pattern
/// matches a call or RIP-relative reference rather than the target itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeTarget {
    pub disp_offset: usize,
    pub next_offset: usize,
}

impl RelativeTarget {
    fn apply(&self, image: &ModuleImage<'_>, match_offset: usize) -> Result<u64> {
        let disp_addr = image.address_at(checked_offset(match_offset, self.disp_offset)?)?;
        let raw = image.region(disp_addr, 4)?;
        let disp = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

        let next_ip = image.address_at(checked_offset(match_offset, self.next_offset)?)?;
        let target = next_ip.checked_add_signed(disp as i64).ok_or(Error::OutOfImage {
            address: next_ip,
            len: 1,
        })?;
        if !image.contains(target) {
            return Err(Error::OutOfImage {
                address: target,
                len: 1,
            });
        }
        Ok(target)
    }
}

fn checked_offset(match_offset: usize, delta: usize) -> Result<usize> {
    match_offset.checked_add(delta).ok_or(Error::OutOfImage {
        address: match_offset as u64,
        len: delta,
    })
}

/// A symbol name, a pattern, or both. At least one is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveTarget {
    name: Option<Cow<'static, str>>,
    pattern: Option<BytePattern>,
    relative: Option<RelativeTarget>,
}

impl ResolveTarget {
    pub fn symbol(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: Some(name.into()),
            pattern: None,
            relative: None,
        }
    }

    pub fn pattern(pattern: BytePattern) -> Self {
        Self {
            name: None,
            pattern: Some(pattern),
            relative: None,
        }
    }

    pub fn symbol_or_pattern(name: impl Into<Cow<'static, str>>, pattern: BytePattern) -> Self {
        Self {
            name: Some(name.into()),
            pattern: Some(pattern),
            relative: None,
        }
    }

    /// Build from optional parts, as read from a configuration table
    pub fn from_parts(name: Option<String>, pattern: Option<BytePattern>) -> Result<Self> {
        if name.is_none() && pattern.is_none() {
            return Err(Error::InvalidTarget(
                "neither a symbol nor a pattern was given".to_string(),
            ));
        }
        Ok(Self {
            name: name.map(Cow::Owned),
            pattern,
            relative: None,
        })
    }

    /// Follow a displacement inside the pattern match. Has no effect on the
    /// symbolic path.
    pub fn relative(mut self, relative: RelativeTarget) -> Self {
        self.relative = Some(relative);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn byte_pattern(&self) -> Option<&BytePattern> {
        self.pattern.as_ref()
    }

    /// Human-readable label for logs and failure reports
    pub fn label(&self) -> String {
        match (&self.name, &self.pattern) {
            (Some(name), _) => name.to_string(),
            (None, Some(pattern)) => format!("<{}>", pattern),
            (None, None) => "<empty>".to_string(),
        }
    }
}

pub struct Resolver<'a> {
    symbols: &'a dyn SymbolTable,
}

impl<'a> Resolver<'a> {
    pub fn new(symbols: &'a dyn SymbolTable) -> Self {
        Self { symbols }
    }

    /// Resolve `target` to an absolute address inside `image`.
    ///
    /// The symbol table is consulted first and wins whenever it knows the
    /// name. Otherwise the whole image is scanned for the pattern.
    pub fn resolve(&self, target: &ResolveTarget, image: &ModuleImage<'_>) -> Result<u64> {
        let symbolic = match target.name() {
            Some(name) => match self.lookup(image, name) {
                Ok(address) => return Ok(address),
                Err(e) => Some(e),
            },
            None => None,
        };

        let Some(pattern) = target.byte_pattern() else {
            return Err(symbolic.unwrap_or_else(|| Error::InvalidTarget(target.label())));
        };

        if let Some(e) = &symbolic {
            debug!("{}. Attempting to use pattern.", e);
        }

        let offset = find_pattern(image.bytes(), pattern, 0)
            .ok_or_else(|| Error::PatternNotFound(target.label()))?;

        let address = match &target.relative {
            Some(relative) => relative.apply(image, offset)?,
            None => image.address_at(offset)?,
        };
        debug!("Resolved `{}` at {:#x} using pattern", target.label(), address);
        Ok(address)
    }

    fn lookup(&self, image: &ModuleImage<'_>, name: &str) -> Result<u64> {
        match self.symbols.lookup(image.id(), name) {
            Some(address) => {
                debug!("Resolved `{}` at {:#x} using symbol", name, address);
                Ok(address)
            }
            None => Err(Error::SymbolNotFound(name.to_string())),
        }
    }
}
