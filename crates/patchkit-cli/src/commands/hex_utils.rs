//! Hex address parsing and formatting utilities.

use anyhow::{Result, bail};

/// Parse a hex address such as `0xFFFFFF7F_80001000`.
///
/// The `0x` prefix is optional and `_` may separate digit groups.
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|&c| c != '_')
        .collect();
    if digits.is_empty() {
        bail!("Invalid hex address: {:?}", s);
    }
    u64::from_str_radix(&digits, 16)
        .map_err(|e| anyhow::anyhow!("Invalid hex address {:?}: {}", s, e))
}

/// Format an address as a hex string with 0x prefix.
pub fn format_hex_address(addr: u64) -> String {
    format!("0x{:X}", addr)
}
