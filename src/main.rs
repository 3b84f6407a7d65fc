use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};

use phantom_thermometry::analysis::{AnalysisRequest, run_analysis};
use phantom_thermometry::cli::{Cli, Method};
use phantom_thermometry::config::load_config;
use phantom_thermometry::error::ThermometryError;
use phantom_thermometry::project::{dataset_dir, default_output_dir, resolve_project_root};
use phantom_thermometry::report::format_table;

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(cli: &Cli) -> Result<()> {
    let root = resolve_project_root(cli.data_root.as_deref())?;
    let data_dir = dataset_dir(&root, cli.dataset);
    println!("Constructed data directory path: {}", data_dir.display());
    if !data_dir.is_dir() {
        return Err(ThermometryError::DataDirNotFound(data_dir).into());
    }

    let (mut config, config_file) = load_config(cli.config.as_deref(), &data_dir)?;
    if let Some(iterations) = cli.bootstrap_iterations {
        if cli.method != Method::RegionwiseBootstrap {
            warn!(
                "--bootstrap-iterations {iterations} is ignored by method {}",
                cli.method
            );
        }
        config.analysis.bootstrap_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.analysis.seed = seed;
    }

    let output_dir = cli
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(&root, cli.dataset));
    info!(
        "Analyzing {} dataset with the {} method, results in {}",
        cli.dataset,
        cli.method,
        output_dir.display()
    );

    let report = run_analysis(&AnalysisRequest {
        dataset: cli.dataset,
        method: cli.method,
        data_dir,
        output_dir,
        config,
        config_file,
        runs: cli.runs.clone(),
        write_images: !cli.no_images,
    })?;

    print!("{}", format_table(&report));
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("analysis failed: {e:?}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
