//! Loaded module images
//!
//! A [`ModuleImage`] borrows the mapped bytes of one loaded module for the
//! duration of a load notification. Addresses are absolute (`base + offset`).

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ModuleImage<'a> {
    id: &'a str,
    base: u64,
    bytes: &'a mut [u8],
}

impl<'a> ModuleImage<'a> {
    pub fn new(id: &'a str, base: u64, bytes: &'a mut [u8]) -> Self {
        Self { id, base, bytes }
    }

    /// Wrap a module that is mapped into the current address space.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` mapped bytes that stay resident and are not
    /// accessed through any other reference while the image is alive. Writes
    /// additionally require the pages to be made writable first.
    pub unsafe fn from_raw_parts(id: &'a str, base: *mut u8, size: usize) -> Self {
        let bytes = unsafe { std::slice::from_raw_parts_mut(base, size) };
        Self {
            id,
            base: base as u64,
            bytes,
        }
    }

    pub fn id(&self) -> &str {
        self.id
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    pub fn contains(&self, address: u64) -> bool {
        self.offset_of(address, 1).is_ok()
    }

    /// Absolute address of an offset into the image. The offset itself may
    /// lie past the end; only address-space overflow is rejected.
    pub fn address_at(&self, offset: usize) -> Result<u64> {
        u64::try_from(offset)
            .ok()
            .and_then(|offset| self.base.checked_add(offset))
            .ok_or(Error::OutOfImage {
                address: self.base,
                len: offset,
            })
    }

    /// Offset of `address`, checking that `len` bytes from there are mapped.
    pub fn offset_of(&self, address: u64, len: usize) -> Result<usize> {
        let out_of_image = || Error::OutOfImage { address, len };
        let offset = address.checked_sub(self.base).ok_or_else(out_of_image)?;
        let offset = usize::try_from(offset).map_err(|_| out_of_image())?;
        let end = offset.checked_add(len).ok_or_else(out_of_image)?;
        if end > self.bytes.len() {
            return Err(out_of_image());
        }
        Ok(offset)
    }

    pub fn region(&self, address: u64, len: usize) -> Result<&[u8]> {
        let offset = self.offset_of(address, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn region_mut(&mut self, address: u64, len: usize) -> Result<&mut [u8]> {
        let offset = self.offset_of(address, len)?;
        Ok(&mut self.bytes[offset..offset + len])
    }

    /// Everything from `address` up to the end of the image
    pub fn tail_mut(&mut self, address: u64) -> Result<&mut [u8]> {
        let offset = self.offset_of(address, 0)?;
        Ok(&mut self.bytes[offset..])
    }
}
