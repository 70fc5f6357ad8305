//! Region administration commands.
//!
//! `init`, `info`, `reset` and `dump` operate on a shared chunk region
//! file; none of them needs a running host.

use crate::model::UnitKey;
use crate::output::write_dump;
use crate::report::RegionDump;
use crate::store::{ProfilerStore, RegionInfo, ResetScope};
use crate::utils::config::{StoreConfig, REPORT_SCHEMA_VERSION};
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Create (or validate) a shared region file
///
/// **Public** - called from main.rs
pub fn execute_init(region: &Path, capacity: usize, units: usize) -> Result<RegionInfo> {
    if capacity == 0 || units == 0 {
        anyhow::bail!("capacity and units must be greater than 0");
    }

    info!("Step 1/2: Opening region {}...", region.display());
    let config = StoreConfig::shared(region)
        .with_capacity(capacity)
        .with_unit_capacity(units);
    let store = ProfilerStore::shared_with(region, &config)
        .with_context(|| format!("Failed to open region {}", region.display()))?;

    info!("Step 2/2: Flushing region...");
    let region_info = store.info();
    store.close().context("Failed to flush region")?;

    print_info(region, &region_info);
    Ok(region_info)
}

/// Print region capacity and usage
pub fn execute_info(region: &Path) -> Result<RegionInfo> {
    let store = attach(region)?;
    let region_info = store.info();

    print_info(region, &region_info);
    Ok(region_info)
}

/// Remove stored chunks and call statistics of one procedure, or all of them
pub fn execute_reset(region: &Path, unit: Option<UnitKey>) -> Result<usize> {
    let store = attach(region)?;

    let scope = match unit {
        Some(key) => ResetScope::Unit(key),
        None => ResetScope::All,
    };
    let removed = store.reset(scope).context("Failed to reset chunks")?;
    let removed_units = store
        .stats()
        .reset(unit)
        .context("Failed to reset call statistics")?;
    store.close().context("Failed to flush region")?;

    println!("✓ Removed {} chunks, {} call statistics", removed, removed_units);
    Ok(removed)
}

/// Write every stored chunk to a JSON file
pub fn execute_dump(region: &Path, output: &Path) -> Result<RegionDump> {
    let store = attach(region)?;

    let dump = RegionDump {
        version: REPORT_SCHEMA_VERSION.to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        info: store.info(),
        chunks: store.dump().context("Failed to read chunks")?,
        units: store.stats().snapshot().context("Failed to read call statistics")?,
    };

    write_dump(&dump, output).context("Failed to write region dump")?;
    println!("✓ Dump written to: {}", output.display());
    Ok(dump)
}

fn attach(region: &Path) -> Result<ProfilerStore> {
    ProfilerStore::attach(region)
        .with_context(|| format!("Failed to attach to region {}", region.display()))
}

fn print_info(region: &Path, region_info: &RegionInfo) {
    println!("Region: {}", region.display());
    println!("  Format version: {}", region_info.format_version);
    println!("  Capacity:       {} chunks", region_info.capacity);
    println!("  Used:           {} chunks", region_info.used_chunks);
    println!("  Free:           {} chunks", region_info.free_chunks);
    println!(
        "  Procedures:     {} of {}",
        region_info.used_units, region_info.unit_capacity
    );
}
