use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use phantom_thermometry::cli::Dataset;
use phantom_thermometry::project::dataset_dir;
use phantom_thermometry::synthetic::{PhantomSpec, TableFormat, write_phantom_dataset};
use tempfile::TempDir;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_phantom-thermometry"));
    cmd.env_remove("RUST_LOG")
        .env_remove("PHANTOM_THERMOMETRY_DATA_ROOT");
    cmd
}

fn run(root: &Path, out: &Path, args: &[&str]) -> Output {
    bin()
        .arg("--data-root")
        .arg(root)
        .arg("-o")
        .arg(out)
        .args(args)
        .output()
        .unwrap()
}

fn phantom(dataset: Dataset, format: TableFormat) -> (TempDir, PhantomSpec) {
    let root = TempDir::new().unwrap();
    let spec = PhantomSpec::default_for(dataset);
    write_phantom_dataset(&dataset_dir(root.path(), dataset), &spec, 11, format).unwrap();
    (root, spec)
}

#[derive(Debug, serde::Deserialize)]
struct Row {
    run: i64,
    label: i64,
    n_voxels: usize,
    method: String,
    temperature_c: Option<f64>,
    std_c: Option<f64>,
    ci_low_c: Option<f64>,
    ci_high_c: Option<f64>,
    n_samples: Option<usize>,
}

fn read_rows(path: &Path) -> Vec<Row> {
    csv::Reader::from_path(path)
        .unwrap()
        .deserialize()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn assert_temperatures(rows: &[Row], expected: &[f64], tolerance: f64) {
    assert_eq!(rows.len(), expected.len());
    for (row, want) in rows.iter().zip(expected) {
        let got = row.temperature_c.unwrap();
        assert!(
            (got - want).abs() < tolerance,
            "run {} label {}: {got:.2} °C, expected {want} °C",
            row.run,
            row.label
        );
    }
}

#[test]
fn help_lists_methods() {
    let output = bin().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--method"));
    assert!(stdout.contains("regionwise_bootstrap"));
    assert!(stdout.contains("--bootstrap-iterations"));
}

#[test]
fn invalid_values_are_usage_errors() {
    let output = bin().arg("7T").output().unwrap();
    assert_eq!(output.status.code(), Some(2));

    let output = bin().args(["3T", "--method", "pixelwise"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("pixelwise"));
}

#[test]
fn missing_data_directory_exits_with_one() {
    let root = TempDir::new().unwrap();
    let output = bin()
        .arg("1.5T")
        .arg("--data-root")
        .arg(root.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("Constructed data directory path:"), "{stdout}");
    assert!(stderr.contains("Error: Data directory not found at"), "{stderr}");
    assert_eq!(stderr.matches("Data directory not found").count(), 1, "{stderr}");
}

#[test]
fn regionwise_recovers_phantom_temperatures() {
    let (root, spec) = phantom(Dataset::T3, TableFormat::Csv);
    let out = root.path().join("results");

    let output = run(root.path(), &out, &["3T"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    for phantom_run in &spec.runs {
        let prefix = format!("run-{:02}_thermometry", phantom_run.run);
        let rows = read_rows(&out.join(format!("{prefix}_regions.csv")));
        assert_temperatures(&rows, &phantom_run.temperatures_c, 1.0);
        assert!(rows.iter().all(|r| r.method == "regionwise" && r.n_voxels == 29));
        assert!(out.join(format!("{prefix}_temperature.nii.gz")).is_file());
        assert!(out.join(format!("{prefix}_slice-000.png")).is_file());
    }
    assert!(out.join("run-01_series-001_te_s.txt").is_file());

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("thermometry_summary.json")).unwrap())
            .unwrap();
    assert_eq!(summary["dataset"], "3T");
    assert_eq!(summary["runs"].as_array().unwrap().len(), 2);
    assert_eq!(summary["runs"][0]["frequency_source"], "sidecar_imaging_frequency");
    assert_eq!(summary["runs"][0]["echo_times_s"].as_array().unwrap().len(), 24);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Constructed data directory path:"));
}

#[test]
fn voxelwise_on_selected_run_without_images() {
    let (root, spec) = phantom(Dataset::T1_5, TableFormat::Parquet);
    let out = root.path().join("results");

    let output = run(
        root.path(),
        &out,
        &["1.5T", "-m", "VOXELWISE", "--run", "2", "--no-images"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let rows = read_rows(&out.join("run-02_thermometry_regions.csv"));
    assert_temperatures(&rows, &spec.runs[1].temperatures_c, 1.5);
    for row in &rows {
        assert_eq!(row.n_samples, Some(29));
        assert!(row.std_c.unwrap() < 2.0);
    }
    assert!(!out.join("run-01_thermometry_regions.csv").exists());
    assert!(!out.join("run-02_thermometry_slice-000.png").exists());
}

#[test]
fn bootstrap_reports_intervals_reproducibly() {
    let (root, spec) = phantom(Dataset::T3, TableFormat::Json);
    let out_a = root.path().join("a");
    let out_b = root.path().join("b");
    let args = [
        "3T",
        "--method",
        "regionwise_bootstrap",
        "--bootstrap-iterations",
        "20",
        "--seed",
        "5",
        "--run",
        "1",
    ];

    let output = run(root.path(), &out_a, &args);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let output = run(root.path(), &out_b, &args);
    assert!(output.status.success());

    let csv_a = out_a.join("run-01_thermometry_regions.csv");
    let rows = read_rows(&csv_a);
    assert_temperatures(&rows, &spec.runs[0].temperatures_c, 1.0);
    for row in &rows {
        assert_eq!(row.n_samples, Some(20));
        assert!(row.ci_low_c.unwrap() <= row.ci_high_c.unwrap());
    }
    assert_eq!(
        fs::read_to_string(&csv_a).unwrap(),
        fs::read_to_string(out_b.join("run-01_thermometry_regions.csv")).unwrap()
    );
}

#[test]
fn unknown_run_and_bad_config_fail() {
    let (root, _) = phantom(Dataset::T3, TableFormat::Csv);
    let out = root.path().join("results");

    let output = run(root.path(), &out, &["3T", "--run", "9"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("run 9"));

    let config = root.path().join("bad.toml");
    fs::write(&config, "[fit]\nunknown_key = 1\n").unwrap();
    let output = run(root.path(), &out, &["3T", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
}
