use std::path::Path;

use serde_json::json;

use crate::error::Result;
use crate::report::CellAssignment;

/// Write the extended mapping result: the per-cell assignments, the
/// flat sorted union of marker genes used, the echoed config, the run
/// log, and a metadata block.
pub fn write_mapping_json(
    path: &Path,
    results: &[CellAssignment],
    marker_genes: &[String],
    config: &serde_json::Value,
    log_messages: &[String],
) -> Result<()> {
    let payload = json!({
        "results": results,
        "marker_genes": marker_genes,
        "config": config,
        "log": log_messages,
        "metadata": {
            "timestamp": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    std::fs::write(path, serde_json::to_string(&payload)?)?;
    Ok(())
}
