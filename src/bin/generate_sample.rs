use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use phantom_thermometry::cli::Dataset;
use phantom_thermometry::project::dataset_dir;
use phantom_thermometry::synthetic::{PhantomSpec, TableFormat, write_phantom_dataset};

/// Write a synthetic ethylene glycol phantom dataset with known vial temperatures.
#[derive(Parser, Debug)]
#[command(name = "generate_sample")]
struct Args {
    /// Field strength of the simulated scanner, '1.5T' or '3T'
    #[arg(value_enum)]
    dataset: Dataset,

    /// Project root; the dataset is written to <root>/data/<dataset>
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Noise seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Series table format
    #[arg(long, value_enum, default_value_t = TableFormat::Csv)]
    format: TableFormat,
}

fn run(args: &Args) -> Result<()> {
    let dir = dataset_dir(&args.root, args.dataset);
    let spec = PhantomSpec::default_for(args.dataset);
    let written = write_phantom_dataset(&dir, &spec, args.seed, args.format)?;

    println!("Wrote {} files to {}", written.len(), dir.display());
    for run in &spec.runs {
        let temps: Vec<String> = spec
            .vials
            .iter()
            .zip(&run.temperatures_c)
            .map(|(vial, t)| format!("vial {} = {t:.1} °C", vial.label))
            .collect();
        println!("  run {}: {}", run.run, temps.join(", "));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
