//! JSON patch tables
//!
//! A table describes the requests for one module release:
//!
//! ```json
//! {
//!   "module": "com.apple.kext.AMDRadeonX6000Framebuffer",
//!   "label": "13.4",
//!   "entries": [
//!     { "kind": "resolve", "key": "capsTable", "symbol": "__ZL20CAIL_ASIC_CAPS_TABLE",
//!       "pattern": "6E 00 00 00 ?? ?? ?? ?? 00 00 00 00" },
//!     { "kind": "hook", "symbol": "_dce_driver_set_backlight",
//!       "replacement": "wrapDceDriverSetBacklight", "original": "orgDceDriverSetBacklight" },
//!     { "kind": "patch", "name": "skip asic check", "find": "74 ?? 48 8B", "replace": "EB ?? 48 8B",
//!       "count": 1, "mandatory": false }
//!   ]
//! }
//! ```
//!
//! A `??` token in `replace` keeps the original byte.

mod replacements;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, Entry, Request};
use crate::error::{Error, Result};
use crate::hook::HookSpec;
use crate::patch::{PatchSite, PatchSpec};
use crate::pattern::{BytePattern, parse_hex_bytes, parse_tokens};
use crate::resolve::{RelativeTarget, ResolveTarget};

pub use replacements::Replacements;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTable {
    pub module: String,
    #[serde(default)]
    pub label: String,
    pub entries: Vec<TableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    #[serde(default = "default_true")]
    pub mandatory: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: EntryKind,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Resolve {
        key: String,
        #[serde(flatten)]
        target: TargetSpec,
    },
    Patch {
        name: String,
        #[serde(default)]
        site: PatchSite,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        find: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        find_mask: Option<String>,
        replace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace_mask: Option<String>,
        #[serde(default)]
        skip: usize,
        #[serde(default = "default_count")]
        count: usize,
    },
    Hook {
        #[serde(flatten)]
        target: TargetSpec,
        replacement: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<String>,
    },
}

fn default_count() -> usize {
    1
}

/// Symbol and/or pattern as written in a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative: Option<RelativeTarget>,
}

impl TargetSpec {
    pub fn to_target(&self) -> Result<ResolveTarget> {
        let pattern = self
            .pattern
            .as_deref()
            .map(|text| parse_pattern_with_mask(text, self.mask.as_deref()))
            .transpose()?;
        let target = ResolveTarget::from_parts(self.symbol.clone(), pattern)?;
        Ok(match self.relative {
            Some(relative) => target.relative(relative),
            None => target,
        })
    }
}

impl PatchTable {
    /// Names of every replacement function the table's hooks refer to
    pub fn replacement_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match &entry.kind {
            EntryKind::Hook { replacement, .. } => Some(replacement.as_str()),
            _ => None,
        })
    }

    /// Build the batch for this table, looking hook replacements up by name
    pub fn to_batch(&self, replacements: &Replacements) -> Result<Batch> {
        self.entries
            .iter()
            .map(|entry| entry.to_entry(replacements))
            .collect()
    }
}

impl TableEntry {
    pub fn to_entry(&self, replacements: &Replacements) -> Result<Entry> {
        let request = match &self.kind {
            EntryKind::Resolve { key, target } => Request::resolve(key.clone(), target.to_target()?),
            EntryKind::Patch {
                name,
                site,
                find,
                find_mask,
                replace,
                replace_mask,
                skip,
                count,
            } => {
                let spec = build_patch(
                    find.as_deref(),
                    find_mask.as_deref(),
                    replace,
                    replace_mask.as_deref(),
                )?;
                Request::patch(name.clone(), site.clone(), spec.skip(*skip).count(*count))
            }
            EntryKind::Hook {
                target,
                replacement,
                original,
            } => {
                let address = replacements.require(replacement)?;
                let spec = HookSpec::new(target.to_target()?, address);
                Request::hook(match original {
                    Some(key) => spec.keep_original(key.clone()),
                    None => spec,
                })
            }
        };

        let mut entry = Entry::from(request).when(self.enabled);
        entry.mandatory = self.mandatory;
        Ok(entry)
    }
}

fn parse_pattern_with_mask(text: &str, mask: Option<&str>) -> Result<BytePattern> {
    let pattern = BytePattern::parse(text)?;
    match mask {
        Some(mask) => pattern.with_mask(parse_hex_bytes(mask)?),
        None => Ok(pattern),
    }
}

fn build_patch(
    find: Option<&str>,
    find_mask: Option<&str>,
    replace: &str,
    replace_mask: Option<&str>,
) -> Result<PatchSpec> {
    let tokens = parse_tokens(replace).map_err(|e| Error::InvalidPatch(e.to_string()))?;
    let bytes: Vec<u8> = tokens.iter().map(|b| b.unwrap_or(0)).collect();

    let spec = match find {
        Some(find) => PatchSpec::scan(parse_pattern_with_mask(find, find_mask)?, bytes)?,
        None => PatchSpec::exact(bytes)?,
    };

    match replace_mask {
        Some(mask) => spec.replace_mask(parse_hex_bytes(mask)?),
        None if tokens.iter().any(Option::is_none) => {
            let mask: Vec<u8> = tokens
                .iter()
                .map(|b| if b.is_some() { 0xFF } else { 0x00 })
                .collect();
            spec.replace_mask(mask)
        }
        None => Ok(spec),
    }
}

pub fn load_table<P: AsRef<Path>>(path: P) -> Result<PatchTable> {
    let content = fs::read_to_string(&path)?;
    let table = serde_json::from_str(&content)?;
    Ok(table)
}

pub fn save_table<P: AsRef<Path>>(path: P, table: &PatchTable) -> Result<()> {
    let content = serde_json::to_string_pretty(table)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ResolutionTable;
    use crate::image::ModuleImage;
    use crate::mock::{MockHost, MockImageBuilder};
    use tempfile::NamedTempFile;

    const TABLE: &str = r#"{
        "module": "com.example.gpu",
        "label": "test",
        "entries": [
            { "kind": "resolve", "key": "init", "symbol": "_init", "pattern": "55 48 89 E5" },
            { "kind": "patch", "name": "force path", "find": "74 ?? 31 C0", "replace": "EB ?? 31 C0" },
            { "kind": "patch", "name": "nop at init", "site": { "type": "at", "key": "init", "offset": 4 },
              "replace": "90 90" },
            { "kind": "hook", "pattern": "41 57 41 56", "replacement": "wrapDetect",
              "original": "orgDetect", "mandatory": false },
            { "kind": "resolve", "key": "unused", "symbol": "_unused", "enabled": false }
        ]
    }"#;

    fn detect(x: u32) -> u32 {
        x
    }

    fn wrap_detect(x: u32) -> u32 {
        x + 1
    }

    #[test]
    fn test_parse_table_and_build_batch() {
        let table: PatchTable = serde_json::from_str(TABLE).unwrap();
        assert_eq!(table.entries.len(), 5);
        assert_eq!(table.replacement_names().collect::<Vec<_>>(), vec!["wrapDetect"]);

        let mut replacements = Replacements::new();
        replacements.register("wrapDetect", 0xAB_0000);
        let batch = table.to_batch(&replacements).unwrap();
        assert_eq!(batch.len(), 5);
        assert!(!batch.entries()[3].mandatory);
        assert!(!batch.entries()[4].enabled);
    }

    #[test]
    fn test_table_batch_runs_against_image() {
        let table: PatchTable = serde_json::from_str(TABLE).unwrap();
        let mut replacements = Replacements::new();
        replacements.register("wrapDetect", 0xAB_0000);
        let batch = table.to_batch(&replacements).unwrap();

        let mut bytes = MockImageBuilder::new(0x80)
            .fill(0xCC)
            .place(0x10, &[0x55, 0x48, 0x89, 0xE5, 0x00, 0x00])
            .place(0x30, &[0x74, 0x09, 0x31, 0xC0])
            .place(0x50, &[0x41, 0x57, 0x41, 0x56])
            .build();
        let mut image = ModuleImage::new("com.example.gpu", 0x4000, &mut bytes);
        let mut host = MockHost::default();
        host.redirect.define(0x4050, detect);
        host.redirect.define(0xAB_0000, wrap_detect);
        let mut resolved = ResolutionTable::new();

        let report = batch
            .run(&mut image, &mut host.services(), &mut resolved)
            .unwrap();
        assert_eq!(report.applied(), 4);
        assert_eq!(report.skipped(), 1);
        assert_eq!(bytes[0x14..0x16], [0x90, 0x90]);
        assert_eq!(bytes[0x30..0x34], [0xEB, 0x09, 0x31, 0xC0]);
        assert!(resolved.get("orgDetect").is_some());
    }

    #[test]
    fn test_unknown_replacement_rejected() {
        let table: PatchTable = serde_json::from_str(TABLE).unwrap();
        let err = table.to_batch(&Replacements::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownReplacement(name) if name == "wrapDetect"));
    }

    #[test]
    fn test_entry_without_symbol_or_pattern_rejected() {
        let json = r#"{ "module": "m", "entries": [ { "kind": "resolve", "key": "x" } ] }"#;
        let table: PatchTable = serde_json::from_str(json).unwrap();
        let err = table.to_batch(&Replacements::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[test]
    fn test_explicit_masks() {
        let spec = build_patch(
            Some("B8 10 00 00"),
            Some("FF F0 FF FF"),
            "B8 07 00 00",
            Some("00 0F 00 00"),
        )
        .unwrap();
        assert_eq!(spec.find().unwrap().mask().unwrap(), [0xFF, 0xF0, 0xFF, 0xFF]);
        assert!(build_patch(Some("B8 10"), None, "B8", None).is_err());
    }

    #[test]
    fn test_save_and_load_table() {
        let temp_file = NamedTempFile::new().unwrap();
        let table: PatchTable = serde_json::from_str(TABLE).unwrap();

        save_table(temp_file.path(), &table).unwrap();
        let loaded = load_table(temp_file.path()).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_load_missing_table() {
        let err = load_table("/nonexistent/table.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
