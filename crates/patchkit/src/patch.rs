//! Masked find-and-replace over module bytes

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::ResolutionTable;
use crate::error::{Error, Result};
use crate::host::WriteProtection;
use crate::image::ModuleImage;
use crate::pattern::{BytePattern, find_all};
use crate::protect::WritableGuard;

/// Which bytes of a module a patch operates on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchSite {
    /// Scan the whole image
    #[default]
    Module,
    /// Scan `len` bytes starting at a resolved key, clipped to the image end
    Window { key: String, len: usize },
    /// Overwrite at a resolved key plus `offset`, without searching
    At {
        key: String,
        #[serde(default)]
        offset: usize,
    },
}

impl PatchSite {
    /// The slice of `image` this site covers
    pub fn region<'i>(
        &self,
        image: &'i mut ModuleImage<'_>,
        resolved: &ResolutionTable,
    ) -> Result<&'i mut [u8]> {
        match self {
            PatchSite::Module => Ok(image.bytes_mut()),
            PatchSite::Window { key, len } => {
                let start = resolved.require(key)?;
                let tail = image.tail_mut(start)?;
                let len = (*len).min(tail.len());
                Ok(&mut tail[..len])
            }
            PatchSite::At { key, offset } => {
                let base = resolved.require(key)?;
                let start = base
                    .checked_add(*offset as u64)
                    .ok_or(Error::OutOfImage {
                        address: base,
                        len: *offset,
                    })?;
                image.tail_mut(start)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    find: Option<BytePattern>,
    replace: Cow<'static, [u8]>,
    replace_mask: Option<Cow<'static, [u8]>>,
    skip: usize,
    count: usize,
}

impl PatchSpec {
    /// Overwrite bytes at the start of the region without searching
    pub fn exact(replace: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let replace = replace.into();
        if replace.is_empty() {
            return Err(Error::InvalidPatch("replacement is empty".to_string()));
        }
        Ok(Self {
            find: None,
            replace,
            replace_mask: None,
            skip: 0,
            count: 1,
        })
    }

    /// Replace occurrences of `find`. Defaults to the first occurrence only.
    pub fn scan(find: BytePattern, replace: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let replace = replace.into();
        if replace.len() != find.len() {
            return Err(Error::InvalidPatch(format!(
                "replacement length {} does not match pattern length {}",
                replace.len(),
                find.len()
            )));
        }
        Ok(Self {
            find: Some(find),
            replace,
            replace_mask: None,
            skip: 0,
            count: 1,
        })
    }

    /// Leave the first `skip` occurrences untouched
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Patch `count` occurrences after the skipped ones. Zero patches every
    /// remaining occurrence, requiring at least one.
    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Only write the bits set in `mask`
    pub fn replace_mask(mut self, mask: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let mask = mask.into();
        if mask.len() != self.replace.len() {
            return Err(Error::InvalidPatch(format!(
                "replacement mask length {} does not match replacement length {}",
                mask.len(),
                self.replace.len()
            )));
        }
        self.replace_mask = Some(mask);
        Ok(self)
    }

    pub fn is_exact(&self) -> bool {
        self.find.is_none()
    }

    pub fn find(&self) -> Option<&BytePattern> {
        self.find.as_ref()
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replace
    }
}

/// Apply `spec` to `region` and return the number of sites written.
///
/// Scanning mode locates every required occurrence before writing, so a
/// shortfall leaves the region untouched. Writes happen while a
/// [`WritableGuard`] is held.
pub fn apply_patch(
    region: &mut [u8],
    spec: &PatchSpec,
    protection: &mut dyn WriteProtection,
) -> Result<usize> {
    let Some(find) = &spec.find else {
        let len = spec.replace.len();
        if region.len() < len {
            return Err(Error::InvalidPatch(format!(
                "replacement of {} bytes exceeds the {}-byte region",
                len,
                region.len()
            )));
        }
        let guard = WritableGuard::acquire(protection)?;
        write_masked(&mut region[..len], &spec.replace, spec.replace_mask.as_deref());
        guard.release()?;
        debug!("Applied exact patch of {} bytes", len);
        return Ok(1);
    };

    let sites = select_occurrences(region, find, spec.skip, spec.count)?;
    let guard = WritableGuard::acquire(protection)?;
    for &offset in &sites {
        write_masked(
            &mut region[offset..offset + find.len()],
            &spec.replace,
            spec.replace_mask.as_deref(),
        );
        debug!("Patched occurrence at offset {:#x}", offset);
    }
    guard.release()?;
    Ok(sites.len())
}

fn select_occurrences(
    region: &[u8],
    find: &BytePattern,
    skip: usize,
    count: usize,
) -> Result<Vec<usize>> {
    let total = find_all(region, find, 0).count();
    let available = total.saturating_sub(skip);
    let wanted = if count == 0 { available.max(1) } else { count };

    if available < wanted {
        return Err(Error::InsufficientOccurrences {
            required: skip.saturating_add(wanted),
            found: total,
        });
    }
    Ok(find_all(region, find, 0).skip(skip).take(wanted).collect())
}

/// `dst = (dst & !mask) | (replace & mask)`; no mask writes every byte
fn write_masked(dst: &mut [u8], replace: &[u8], mask: Option<&[u8]>) {
    match mask {
        None => dst.copy_from_slice(replace),
        Some(mask) => {
            for ((d, &r), &m) in dst.iter_mut().zip(replace).zip(mask) {
                *d = (*d & !m) | (r & m);
            }
        }
    }
}
