//! Byte patterns and masked matching
//!
//! A pattern is a fixed byte sequence with an optional parallel bit mask.
//! A mask byte of `0xFF` requires an exact byte, `0x00` ignores the byte,
//! anything in between compares only the covered bits.

mod matcher;

use std::borrow::Cow;

use crate::error::{Error, Result};

pub use matcher::{Matches, find_all, find_pattern};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    bytes: Cow<'static, [u8]>,
    mask: Option<Cow<'static, [u8]>>,
}

impl BytePattern {
    /// Create an exact pattern. Fails on an empty byte sequence.
    pub fn new(bytes: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidPattern("pattern is empty".to_string()));
        }
        Ok(Self { bytes, mask: None })
    }

    /// Attach a bit mask. The mask must be exactly as long as the pattern.
    pub fn with_mask(mut self, mask: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let mask = mask.into();
        if mask.len() != self.bytes.len() {
            return Err(Error::InvalidPattern(format!(
                "mask length {} does not match pattern length {}",
                mask.len(),
                self.bytes.len()
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Parse a pattern such as `"48 8D 0D ?? ?? ?? ??"`.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = parse_tokens(text)?;
        let bytes: Vec<u8> = tokens.iter().map(|b| b.unwrap_or(0)).collect();
        let pattern = Self::new(bytes)?;

        if tokens.iter().all(Option::is_some) {
            return Ok(pattern);
        }
        let mask: Vec<u8> = tokens
            .iter()
            .map(|b| if b.is_some() { 0xFF } else { 0x00 })
            .collect();
        pattern.with_mask(mask)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mask(&self) -> Option<&[u8]> {
        self.mask.as_deref()
    }

    /// True when every byte must match exactly
    pub fn is_exact(&self) -> bool {
        self.mask
            .as_deref()
            .is_none_or(|mask| mask.iter().all(|&m| m == 0xFF))
    }

    /// Compare the pattern against a window of exactly `len()` bytes.
    pub fn matches(&self, window: &[u8]) -> bool {
        debug_assert_eq!(window.len(), self.bytes.len());
        match self.mask.as_deref() {
            None => window == &self.bytes[..],
            Some(mask) => window
                .iter()
                .zip(self.bytes.iter())
                .zip(mask)
                .all(|((&b, &p), &m)| b & m == p & m),
        }
    }
}

impl std::fmt::Display for BytePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_pattern(self))
    }
}

/// Parse hex tokens separated by whitespace. `??` and `?` become `None`.
pub fn parse_tokens(text: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in text.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidPattern(format!("Invalid pattern token '{}': {}", token, e))
        })?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidPattern("pattern is empty".to_string()));
    }

    Ok(bytes)
}

/// Parse a plain hex byte string (no wildcards), e.g. a mask.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    parse_tokens(text)?
        .into_iter()
        .map(|b| b.ok_or_else(|| Error::InvalidPattern(format!("wildcard not allowed in '{}'", text))))
        .collect()
}

/// Format a pattern back into token form. Fully ignored bytes print as `??`.
pub fn format_pattern(pattern: &BytePattern) -> String {
    let mask = pattern.mask();
    pattern
        .bytes()
        .iter()
        .enumerate()
        .map(|(i, b)| match mask.map(|m| m[i]) {
            Some(0) => "??".to_string(),
            _ => format!("{:02X}", b),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
