use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Builder, Int64Array, ListBuilder, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::Parser;

use phantom_thermometry::data::loader::load_series_table;
use phantom_thermometry::data::model::SeriesTable;
use phantom_thermometry::data::selection::unique_echo_trains;
use phantom_thermometry::report::write_echo_times;

/// List a series table and export each distinct echo train, in seconds, to
/// `unique_te_<i>.txt` next to the table.
#[derive(Parser, Debug)]
#[command(name = "export_unique_te")]
struct Args {
    /// Series table (.csv, .json or .parquet)
    table: PathBuf,
}

fn table_batch(table: &SeriesTable) -> Result<RecordBatch> {
    let mut te_builder = ListBuilder::new(Float64Builder::new());
    for record in &table.records {
        te_builder.values().append_slice(&record.te_ms);
        te_builder.append(true);
    }

    let patient_name: ArrayRef = Arc::new(StringArray::from_iter_values(
        table.records.iter().map(|r| r.patient_name.as_str()),
    ));
    let study_id: ArrayRef = Arc::new(StringArray::from_iter_values(
        table.records.iter().map(|r| r.study_id.as_str()),
    ));
    let series_no: ArrayRef =
        Arc::new(Int64Array::from_iter_values(table.records.iter().map(|r| r.series_no)));
    let run: ArrayRef = Arc::new(Int64Array::from_iter_values(table.records.iter().map(|r| r.run)));
    let te_ms: ArrayRef = Arc::new(te_builder.finish());

    let columns = [
        ("patient_name", patient_name),
        ("study_id", study_id),
        ("series_no", series_no),
        ("run", run),
        ("te_ms", te_ms),
    ];
    RecordBatch::try_from_iter(columns).context("building record batch")
}

fn export(table_path: &Path) -> Result<()> {
    if !table_path.is_file() {
        anyhow::bail!("The file '{}' was not found.", table_path.display());
    }
    let table = load_series_table(table_path)?;
    println!("Successfully loaded {} records.\n", table.len());
    println!("{}", pretty_format_batches(&[table_batch(&table)?])?);

    let out_dir = table_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let trains = unique_echo_trains(&table.records);
    println!(
        "\nFound {} unique te_ms arrays. Exporting to '{}'...",
        trains.len(),
        out_dir.display()
    );
    for (i, train) in trains.iter().enumerate() {
        let path = out_dir.join(format!("unique_te_{}.txt", i + 1));
        let te_s: Vec<f64> = train.iter().map(|te| te / 1000.0).collect();
        write_echo_times(&path, &te_s)?;
        println!(" -> Saved {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match export(&args.table) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
