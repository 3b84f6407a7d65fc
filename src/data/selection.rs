use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use super::model::{BidsSidecar, SeriesRecord, SeriesTable};
use crate::error::ThermometryError;

// ---------------------------------------------------------------------------
// Sidecar matching
// ---------------------------------------------------------------------------

/// Attach image files to series rows.
///
/// A row matches the first sidecar (in the given order) with the same study id
/// and series number; the image path is derived from the sidecar file name.
/// Returns the number of rows left without an image.
pub fn attach_nifti_files(table: &mut SeriesTable, sidecars: &[BidsSidecar]) -> usize {
    let mut unmatched = 0;
    for record in &mut table.records {
        match find_sidecar(record, sidecars) {
            Some(sidecar) => record.nifti_file = Some(sidecar.image_path()),
            None => {
                warn!(
                    "No matching sidecar found for study {}, series {}",
                    record.study_id, record.series_no
                );
                unmatched += 1;
            }
        }
    }
    unmatched
}

/// The sidecar describing `record`, if any.
pub fn find_sidecar<'a>(record: &SeriesRecord, sidecars: &'a [BidsSidecar]) -> Option<&'a BidsSidecar> {
    sidecars
        .iter()
        .find(|sc| sc.study_id == record.study_id && sc.series_no == record.series_no)
}

// ---------------------------------------------------------------------------
// Run grouping
// ---------------------------------------------------------------------------

/// Series rows grouped by run number, ascending. Row order within a run is
/// table order.
pub fn group_by_run(table: &SeriesTable) -> BTreeMap<i64, Vec<&SeriesRecord>> {
    let mut runs: BTreeMap<i64, Vec<&SeriesRecord>> = BTreeMap::new();
    for record in &table.records {
        runs.entry(record.run).or_default().push(record);
    }
    runs
}

/// Restrict a run grouping to the requested run numbers.
///
/// An empty request keeps every run; requesting a run the table does not
/// contain is an error.
pub fn select_runs<'a>(
    mut runs: BTreeMap<i64, Vec<&'a SeriesRecord>>,
    requested: &[i64],
) -> Result<BTreeMap<i64, Vec<&'a SeriesRecord>>, ThermometryError> {
    if requested.is_empty() {
        return Ok(runs);
    }
    let wanted: BTreeSet<i64> = requested.iter().copied().collect();
    if let Some(missing) = wanted.iter().find(|run| !runs.contains_key(*run)) {
        return Err(ThermometryError::UnknownRun(*missing));
    }
    runs.retain(|run, _| wanted.contains(run));
    Ok(runs)
}

// ---------------------------------------------------------------------------
// Echo-time bookkeeping
// ---------------------------------------------------------------------------

/// Distinct echo-time arrays in first-appearance order.
pub fn unique_echo_trains(records: &[SeriesRecord]) -> Vec<Vec<f64>> {
    let mut unique: Vec<Vec<f64>> = Vec::new();
    for record in records {
        let seen = unique.iter().any(|train| {
            train.len() == record.te_ms.len()
                && train
                    .iter()
                    .zip(&record.te_ms)
                    .all(|(a, b)| a.to_bits() == b.to_bits())
        });
        if !seen {
            unique.push(record.te_ms.clone());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use serde_json::Map;

    fn record(study: &str, series_no: i64, run: i64, te_ms: &[f64]) -> SeriesRecord {
        SeriesRecord {
            patient_name: "EG".into(),
            study_id: study.into(),
            series_no,
            run,
            te_ms: te_ms.to_vec(),
            nifti_file: None,
            metadata: BTreeMap::new(),
        }
    }

    fn sidecar(name: &str, study: &str, series_no: i64) -> BidsSidecar {
        let mut fields = Map::new();
        fields.insert("StudyInstanceUID".into(), study.into());
        fields.insert("SeriesNumber".into(), series_no.into());
        BidsSidecar::from_fields(PathBuf::from(name), fields)
    }

    #[test]
    fn attaches_first_matching_sidecar() {
        let mut table = SeriesTable::from_records(vec![
            record("S", 1, 1, &[1.0]),
            record("S", 2, 1, &[2.0]),
            record("T", 1, 2, &[3.0]),
        ]);
        let sidecars = vec![
            sidecar("d/a.json", "S", 1),
            sidecar("d/b.json", "S", 1),
            sidecar("d/c.json", "T", 1),
        ];

        let unmatched = attach_nifti_files(&mut table, &sidecars);
        assert_eq!(unmatched, 1);
        assert_eq!(table.records[0].nifti_file, Some(PathBuf::from("d/a.nii.gz")));
        assert_eq!(table.records[1].nifti_file, None);
        assert_eq!(table.records[2].nifti_file, Some(PathBuf::from("d/c.nii.gz")));
    }

    #[test]
    fn groups_and_selects_runs() {
        let table = SeriesTable::from_records(vec![
            record("S", 1, 2, &[1.0]),
            record("S", 2, 1, &[2.0]),
            record("S", 3, 2, &[3.0]),
        ]);
        let runs = group_by_run(&table);
        assert_eq!(runs.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(runs[&2].len(), 2);
        assert_eq!(runs[&2][0].series_no, 1);

        let only_two = select_runs(runs.clone(), &[2]).unwrap();
        assert_eq!(only_two.keys().copied().collect::<Vec<_>>(), vec![2]);

        let all = select_runs(runs.clone(), &[]).unwrap();
        assert_eq!(all.len(), 2);

        assert!(matches!(
            select_runs(runs, &[7]),
            Err(ThermometryError::UnknownRun(7))
        ));
    }

    #[test]
    fn unique_trains_keep_first_appearance_order() {
        let records = vec![
            record("S", 1, 1, &[2.0, 4.0]),
            record("S", 2, 1, &[1.0, 3.0]),
            record("S", 3, 2, &[2.0, 4.0]),
        ];
        assert_eq!(
            unique_echo_trains(&records),
            vec![vec![2.0, 4.0], vec![1.0, 3.0]]
        );
    }
}
