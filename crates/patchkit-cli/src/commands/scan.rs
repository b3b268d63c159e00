//! `patchkit scan`

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use patchkit::{BytePattern, find_all, find_pattern, format_pattern, parse_hex_bytes};

use super::hex_utils::{format_hex_address, parse_hex_address};

pub fn run(image: &Path, pattern: &str, mask: Option<&str>, all: bool, base: &str) -> Result<()> {
    let base = parse_hex_address(base)?;
    let bytes = fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let pattern = build_pattern(pattern, mask)?;

    println!(
        "Scanning {} ({} bytes) for {}",
        image.display(),
        bytes.len(),
        format_pattern(&pattern).cyan()
    );

    let offsets = matches(&bytes, &pattern, all);
    if offsets.is_empty() {
        bail!("Pattern not found");
    }

    for &offset in &offsets {
        println!(
            "  {} offset {:#x}  address {}",
            "match".green(),
            offset,
            format_hex_address(match_address(base, offset)?)
        );
    }
    if all {
        println!("{} match(es)", offsets.len());
    }
    Ok(())
}

fn build_pattern(pattern: &str, mask: Option<&str>) -> Result<BytePattern> {
    let parsed = BytePattern::parse(pattern)?;
    Ok(match mask {
        Some(mask) => parsed.with_mask(parse_hex_bytes(mask)?)?,
        None => parsed,
    })
}

fn match_address(base: u64, offset: usize) -> Result<u64> {
    match base.checked_add(offset as u64) {
        Some(address) => Ok(address),
        None => bail!(
            "Base {} plus offset {:#x} overflows the address space",
            format_hex_address(base),
            offset
        ),
    }
}

fn matches(bytes: &[u8], pattern: &BytePattern, all: bool) -> Vec<usize> {
    if all {
        find_all(bytes, pattern, 0).collect()
    } else {
        find_pattern(bytes, pattern, 0).into_iter().collect()
    }
}
