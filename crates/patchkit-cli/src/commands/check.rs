//! `patchkit check`
//!
//! Runs a patch table against an in-memory copy of a module image with an
//! offline host: symbols come from an optional JSON map, write protection is
//! a no-op, and hooks are recorded against synthetic trampolines.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use patchkit::{
    BatchReport, CodeRedirect, HostServices, LoadDispatcher, ModuleImage, PatchTable,
    Replacements, RequestState, WriteProtection, load_table,
};
use tracing::debug;

use super::hex_utils::{format_hex_address, parse_hex_address};

/// Synthetic addresses handed out for replacement functions
const REPLACEMENT_BASE: u64 = 0xFFFF_FF00_0000_0000;
/// Synthetic addresses handed out as trampolines
const TRAMPOLINE_BASE: u64 = 0xFFFF_FE00_0000_0000;

struct NoProtection;

impl WriteProtection for NoProtection {
    fn set_writable(&mut self, _writable: bool) -> patchkit::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordedHook {
    target: u64,
    replacement: u64,
    trampoline: u64,
}

#[derive(Default)]
struct RecordingRedirect {
    hooks: Vec<RecordedHook>,
}

impl CodeRedirect for RecordingRedirect {
    fn redirect(&mut self, target: u64, replacement: u64) -> patchkit::Result<u64> {
        let trampoline = TRAMPOLINE_BASE + self.hooks.len() as u64 * 0x40;
        debug!("Recorded hook {:#x} -> {:#x}", target, replacement);
        self.hooks.push(RecordedHook {
            target,
            replacement,
            trampoline,
        });
        Ok(trampoline)
    }
}

struct CheckRun {
    result: patchkit::Result<Option<BatchReport>>,
    hooks: Vec<RecordedHook>,
    resolved: Vec<(String, u64)>,
}

pub fn run(
    image: &Path,
    table: &Path,
    base: &str,
    symbols: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let base = parse_hex_address(base)?;
    let table = load_table(table)
        .with_context(|| format!("Failed to load patch table {}", table.display()))?;
    let mut bytes = fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let symbols = match symbols {
        Some(path) => load_symbols(path)?,
        None => HashMap::new(),
    };

    println!(
        "Checking {} [{}] against {} ({} bytes at {})",
        table.module.bold(),
        table.label,
        image.display(),
        bytes.len(),
        format_hex_address(base)
    );

    let run = check(&mut bytes, &table, base, &symbols)?;

    for hook in &run.hooks {
        println!(
            "  hook {} -> {} (original via {})",
            format_hex_address(hook.target),
            format_hex_address(hook.replacement),
            format_hex_address(hook.trampoline)
        );
    }
    for (key, address) in &run.resolved {
        println!("  {} = {}", key.cyan(), format_hex_address(*address));
    }

    match run.result {
        Ok(Some(report)) => print_report(&report),
        Ok(None) => bail!("No batch ran for {}", table.module),
        Err(e) => {
            println!("{} {}", "FAILED".red().bold(), e);
            bail!("Patch table {} failed", table.module);
        }
    }

    if let Some(output) = output {
        fs::write(output, &bytes)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("Wrote patched image to {}", output.display());
    }
    Ok(())
}

fn load_symbols(path: &Path) -> Result<HashMap<String, u64>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read symbols {}", path.display()))?;
    let raw: HashMap<String, String> = serde_json::from_str(&content)?;
    raw.into_iter()
        .map(|(name, address)| Ok((name, parse_hex_address(&address)?)))
        .collect()
}

fn synthetic_replacements(table: &PatchTable) -> Replacements {
    let mut replacements = Replacements::new();
    for (i, name) in table.replacement_names().enumerate() {
        replacements.register(name, REPLACEMENT_BASE + i as u64 * 0x100);
    }
    replacements
}

fn check(
    bytes: &mut [u8],
    table: &PatchTable,
    base: u64,
    symbols: &HashMap<String, u64>,
) -> Result<CheckRun> {
    let batch = table.to_batch(&synthetic_replacements(table))?;
    let mut dispatcher = LoadDispatcher::new();
    dispatcher.register(table.module.clone(), batch);

    let mut protection = NoProtection;
    let mut redirect = RecordingRedirect::default();
    let result = {
        let mut image = ModuleImage::new(&table.module, base, bytes);
        let mut host = HostServices::new(symbols, &mut protection, &mut redirect);
        dispatcher.on_module_loaded(&mut image, &mut host)
    };

    let mut resolved: Vec<(String, u64)> = dispatcher
        .resolved(&table.module)
        .map(|t| t.iter().map(|(k, v)| (k.to_string(), v)).collect())
        .unwrap_or_default();
    resolved.sort();

    Ok(CheckRun {
        result,
        hooks: redirect.hooks,
        resolved,
    })
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let state = match outcome.state {
            RequestState::Applied => outcome.state.green().to_string(),
            RequestState::Skipped => outcome.state.dimmed().to_string(),
            _ => outcome.state.yellow().to_string(),
        };
        println!(
            "  #{:<3} {:<8} {:<40} {}",
            outcome.index,
            outcome.kind.to_string(),
            outcome.name,
            state
        );
    }
    println!(
        "{} applied, {} skipped, {} optional failure(s)",
        report.applied(),
        report.skipped(),
        report.failed()
    );
}
