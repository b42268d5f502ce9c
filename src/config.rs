use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::diffexp::MarkerThresholds;
use crate::error::{MapperError, Result};
use crate::matrix::Normalization;

fn default_n_processors() -> usize {
    num_cpus::get()
}

fn default_rows_at_a_time() -> usize {
    5000
}

fn default_max_gb() -> f64 {
    10.0
}

fn default_raw() -> Normalization {
    Normalization::Raw
}

fn default_log2cpm() -> Normalization {
    Normalization::Log2Cpm
}

fn default_n_per_utility() -> usize {
    15
}

fn default_behemoth_cutoff() -> usize {
    10_000_000
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_bootstrap_factor() -> f64 {
    0.9
}

fn default_bootstrap_iteration() -> usize {
    100
}

fn default_rng_seed() -> u64 {
    11_235_813
}

/// Config for the `precompute` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct PrecomputeConfig {
    pub reference_path: PathBuf,
    pub taxonomy_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default = "default_n_processors")]
    pub n_processors: usize,
    #[serde(default = "default_rows_at_a_time")]
    pub rows_at_a_time: usize,
    #[serde(default = "default_raw")]
    pub normalization: Normalization,
    #[serde(default = "default_max_gb")]
    pub max_gb: f64,
}

/// Config for the `reference-markers` tool. The taxonomy rides along
/// in the stats file, so `taxonomy_path` is only needed to override
/// it; `query_path` restricts candidate genes to a query vocabulary.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceMarkerConfig {
    pub precomputed_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub taxonomy_path: Option<PathBuf>,
    #[serde(default)]
    pub query_path: Option<PathBuf>,
    #[serde(default)]
    pub drop_level: Option<String>,
    #[serde(default = "default_n_processors")]
    pub n_processors: usize,
    #[serde(default = "default_max_gb")]
    pub max_gb: f64,
    #[serde(flatten)]
    pub thresholds: MarkerThresholds,
}

/// Config for the `query-markers` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryMarkerConfig {
    pub reference_marker_path: PathBuf,
    pub query_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub taxonomy_path: Option<PathBuf>,
    #[serde(default)]
    pub precomputed_path: Option<PathBuf>,
    #[serde(default = "default_n_per_utility")]
    pub n_per_utility: usize,
    #[serde(default = "default_n_processors")]
    pub n_processors: usize,
    #[serde(default = "default_behemoth_cutoff")]
    pub behemoth_cutoff: usize,
}

/// Config for the `map` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct MapConfig {
    pub query_path: PathBuf,
    pub precomputed_stats_path: PathBuf,
    pub query_marker_cache_path: PathBuf,
    #[serde(default)]
    pub taxonomy_path: Option<PathBuf>,
    #[serde(default)]
    pub extended_result_path: Option<PathBuf>,
    #[serde(default)]
    pub csv_result_path: Option<PathBuf>,
    #[serde(default)]
    pub results_output_dir: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_n_processors")]
    pub n_processors: usize,
    #[serde(default = "default_bootstrap_factor")]
    pub bootstrap_factor: f64,
    #[serde(default = "default_bootstrap_iteration")]
    pub bootstrap_iteration: usize,
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
    #[serde(default = "default_log2cpm")]
    pub normalization: Normalization,
    #[serde(default = "default_max_gb")]
    pub max_gb: f64,
}

/// Read a config file as raw JSON, kept around so the result file can
/// echo it verbatim.
pub fn load_config_value(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Err(MapperError::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|err| MapperError::Config(format!("config file is not valid JSON: {err}")))
}

/// Deserialize a typed config out of the raw value; missing or
/// ill-typed required keys surface as config errors.
pub fn config_from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|err| MapperError::Config(format!("invalid config: {err}")))
}

/// Require that a configured input path exists before any work starts.
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(MapperError::Config(format!(
            "{what} {} does not exist",
            path.display()
        )))
    }
}
