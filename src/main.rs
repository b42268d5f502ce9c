use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cellarbor::assignment::{BootstrapParams, ElectionParams, run_type_assignment_on_h5ad};
use cellarbor::config::{
    MapConfig, PrecomputeConfig, QueryMarkerConfig, ReferenceMarkerConfig, config_from_value,
    load_config_value, require_file,
};
use cellarbor::diffexp::find_markers_for_all_pairs;
use cellarbor::diffexp::markers::ReferenceMarkerParams;
use cellarbor::error::{MapperError, Result};
use cellarbor::report::{write_mapping_csv, write_mapping_json};
use cellarbor::runlog::RunLog;
use cellarbor::selection::{MarkerCache, create_marker_cache};
use cellarbor::sparse::read_index_column;
use cellarbor::stats::precompute::PrecomputeParams;
use cellarbor::stats::{ClusterStats, precompute_summary_stats};
use cellarbor::taxonomy::TaxonomyTree;

#[derive(Parser, Debug)]
#[command(name = "cellarbor", version, about = "Hierarchical cell-type mapping")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Precompute per-cluster summary statistics from a reference h5ad.
    Precompute(ToolArgs),
    /// Score every leaf pair and write the reference marker file.
    ReferenceMarkers(ToolArgs),
    /// Select per-parent markers intersected with a query vocabulary.
    QueryMarkers(ToolArgs),
    /// Assign query cells to taxonomy nodes by bootstrapped voting.
    Map(ToolArgs),
}

#[derive(Args, Debug, Clone)]
struct ToolArgs {
    #[arg(long = "config_path")]
    config_path: PathBuf,
    /// Overrides the config's primary output artifact.
    #[arg(long = "result_path")]
    result_path: Option<PathBuf>,
    #[arg(long = "log_path")]
    log_path: Option<PathBuf>,
    #[arg(long = "local_tmp")]
    local_tmp: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Precompute(args) => with_runlog(args, run_precompute),
        Command::ReferenceMarkers(args) => with_runlog(args, run_reference_markers),
        Command::QueryMarkers(args) => with_runlog(args, run_query_markers),
        Command::Map(args) => with_runlog(args, run_map),
    }
}

/// Every tool shares the log contract: accumulate messages, flush them
/// to `--log_path`, and on failure append the error chain before
/// re-raising.
fn with_runlog(
    args: &ToolArgs,
    tool: impl FnOnce(&ToolArgs, &mut RunLog) -> Result<()>,
) -> Result<()> {
    let mut log = RunLog::new(args.log_path.as_deref());
    match tool(args, &mut log) {
        Ok(()) => {
            log.write_log()?;
            Ok(())
        }
        Err(err) => {
            log.record_failure(&err);
            let _ = log.write_log();
            Err(err)
        }
    }
}

fn run_precompute(args: &ToolArgs, log: &mut RunLog) -> Result<()> {
    let value = load_config_value(&args.config_path)?;
    let config: PrecomputeConfig = config_from_value(&value)?;
    require_file(&config.reference_path, "reference file")?;
    require_file(&config.taxonomy_path, "taxonomy file")?;
    let tree = TaxonomyTree::from_json_file(&config.taxonomy_path)?;
    let output_path = args
        .result_path
        .clone()
        .unwrap_or_else(|| config.output_path.clone());
    let params = PrecomputeParams {
        n_workers: config.n_processors,
        rows_at_a_time: config.rows_at_a_time,
        max_gb: config.max_gb,
        scratch_dir: args.local_tmp.clone(),
    };
    precompute_summary_stats(
        &config.reference_path,
        &tree,
        config.normalization,
        &output_path,
        &params,
        log,
    )
}

/// Taxonomy lookup shared by the downstream tools: an explicit file
/// wins, else the tree embedded in the stats file.
fn resolve_taxonomy(
    taxonomy_path: Option<&PathBuf>,
    stats: Option<&ClusterStats>,
) -> Result<TaxonomyTree> {
    if let Some(path) = taxonomy_path {
        require_file(path, "taxonomy file")?;
        return TaxonomyTree::from_json_file(path);
    }
    stats
        .and_then(|s| s.taxonomy.clone())
        .ok_or_else(|| {
            MapperError::Config(
                "no taxonomy_path configured and the stats file carries no taxonomy".into(),
            )
        })
}

fn run_reference_markers(args: &ToolArgs, log: &mut RunLog) -> Result<()> {
    let value = load_config_value(&args.config_path)?;
    let config: ReferenceMarkerConfig = config_from_value(&value)?;
    require_file(&config.precomputed_path, "precomputed stats file")?;
    let stats = ClusterStats::read_from_file(&config.precomputed_path)?;
    let mut tree = resolve_taxonomy(config.taxonomy_path.as_ref(), Some(&stats))?;
    if let Some(level) = &config.drop_level {
        log.info(format!("dropping taxonomy level {level}"));
        tree = tree.drop_level(level)?;
    }
    let gene_list = match &config.query_path {
        Some(path) => {
            require_file(path, "query file")?;
            let file = hdf5::File::open(path)?;
            Some(read_index_column(&file, "var")?)
        }
        None => None,
    };
    let output_path = args
        .result_path
        .clone()
        .unwrap_or_else(|| config.output_path.clone());
    let params = ReferenceMarkerParams {
        thresholds: config.thresholds.clone(),
        n_workers: config.n_processors,
        max_gb: config.max_gb,
        scratch_dir: args.local_tmp.clone(),
    };
    find_markers_for_all_pairs(
        &stats,
        &tree,
        &output_path,
        gene_list.as_deref(),
        &params,
        log,
    )
}

fn run_query_markers(args: &ToolArgs, log: &mut RunLog) -> Result<()> {
    let value = load_config_value(&args.config_path)?;
    let config: QueryMarkerConfig = config_from_value(&value)?;
    require_file(&config.reference_marker_path, "reference marker file")?;
    require_file(&config.query_path, "query file")?;
    let stats = match &config.precomputed_path {
        Some(path) => {
            require_file(path, "precomputed stats file")?;
            Some(ClusterStats::read_from_file(path)?)
        }
        None => None,
    };
    let tree = resolve_taxonomy(config.taxonomy_path.as_ref(), stats.as_ref())?;
    let query_gene_names = {
        let file = hdf5::File::open(&config.query_path)?;
        read_index_column(&file, "var")?
    };
    let output_path = args
        .result_path
        .clone()
        .unwrap_or_else(|| config.output_path.clone());
    create_marker_cache(
        &output_path,
        &config.reference_marker_path,
        &query_gene_names,
        &tree,
        config.n_per_utility,
        config.n_processors,
        config.behemoth_cutoff,
        log,
    )
}

fn run_map(args: &ToolArgs, log: &mut RunLog) -> Result<()> {
    let value = load_config_value(&args.config_path)?;
    let config: MapConfig = config_from_value(&value)?;
    require_file(&config.query_path, "query file")?;
    require_file(&config.precomputed_stats_path, "precomputed stats file")?;
    require_file(&config.query_marker_cache_path, "query marker cache")?;
    let result_path = args
        .result_path
        .clone()
        .or_else(|| config.extended_result_path.clone())
        .ok_or_else(|| {
            MapperError::Config("no result path given on the command line or in the config".into())
        })?;

    let stats = ClusterStats::read_from_file(&config.precomputed_stats_path)?;
    let tree = resolve_taxonomy(config.taxonomy_path.as_ref(), Some(&stats))?;
    let cache = MarkerCache::read_from_file(&config.query_marker_cache_path)?;

    let params = ElectionParams {
        bootstrap: BootstrapParams {
            factor: config.bootstrap_factor,
            iterations: config.bootstrap_iteration,
        },
        chunk_size: config.chunk_size,
        n_workers: config.n_processors,
        rng_seed: config.rng_seed,
        normalization: config.normalization,
        max_gb: config.max_gb,
        scratch_dir: args.local_tmp.clone(),
        results_output_dir: config.results_output_dir.clone(),
    };
    let results =
        run_type_assignment_on_h5ad(&config.query_path, &stats, &cache, &tree, &params, log)?;

    let mut marker_genes: Vec<String> = cache
        .all_query_markers
        .iter()
        .map(|&idx| cache.query_gene_names[idx].clone())
        .collect();
    marker_genes.sort();

    write_mapping_json(&result_path, &results, &marker_genes, &value, log.messages())?;
    log.info(format!("wrote mapping result {}", result_path.display()));

    if let Some(csv_path) = &config.csv_result_path {
        if config.results_output_dir.is_some() {
            log.warn(
                "skipping CSV output: results were streamed to per-chunk files".to_string(),
            );
        } else {
            let basename = result_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            write_mapping_csv(csv_path, &results, tree.hierarchy(), &basename)?;
            log.info(format!("wrote mapping csv {}", csv_path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_tool_flags() {
        let cli = Cli::parse_from([
            "cellarbor",
            "map",
            "--config_path",
            "config.json",
            "--result_path",
            "out.json",
            "--log_path",
            "run.log",
            "--local_tmp",
            "/tmp/scratch",
        ]);
        let Command::Map(args) = cli.command else {
            panic!("expected map subcommand");
        };
        assert_eq!(args.config_path, PathBuf::from("config.json"));
        assert_eq!(args.result_path, Some(PathBuf::from("out.json")));
        assert_eq!(args.log_path, Some(PathBuf::from("run.log")));
        assert_eq!(args.local_tmp, Some(PathBuf::from("/tmp/scratch")));
    }

    #[test]
    fn test_cli_requires_config_path() {
        let parsed = Cli::try_parse_from(["cellarbor", "precompute"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let args = ToolArgs {
            config_path: PathBuf::from("/definitely/not/here.json"),
            result_path: None,
            log_path: None,
            local_tmp: None,
        };
        let mut log = RunLog::new(None);
        let err = run_precompute(&args, &mut log).unwrap_err();
        assert!(matches!(err, MapperError::Config(_)));
    }
}
