//! Output records and CSV helpers.
//!
//! Filters emit two things per step: a set of weighted states (particles or
//! sigma points) and a single weighted-mean state estimate keyed by the
//! declared state names. The reserved extra output label is `"weight"`.

use std::path::Path;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// One output particle or sigma point: a state vector plus its weight.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedState {
    pub values: DVector<f64>,
    pub weight: f64,
}

impl WeightedState {
    pub fn new(values: DVector<f64>, weight: f64) -> Self {
        WeightedState { values, weight }
    }
}

/// A state estimate keyed by state variable names.
#[derive(Clone, Debug, PartialEq)]
pub struct StateEstimate {
    names: Vec<String>,
    values: DVector<f64>,
}

impl StateEstimate {
    pub fn new(names: Vec<String>, values: DVector<f64>) -> Self {
        assert_eq!(
            names.len(),
            values.len(),
            "state estimate names and values must align"
        );
        StateEstimate { names, values }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Look up one state value by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    /// Output labels for the corresponding weighted-state records: the state
    /// names followed by the reserved `"weight"` label.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = self.names.clone();
        labels.push("weight".to_string());
        labels
    }
}

/// A timestamped measurement sample read from or written to CSV.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub time: f64,
    pub value: f64,
}

/// Read a measurement series from a CSV file with `time,value` columns.
pub fn read_measurements_csv<P: AsRef<Path>>(path: P) -> Result<Vec<MeasurementRecord>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Write an estimate series to CSV: a `time` column followed by one column
/// per state name.
pub fn write_estimates_csv<P: AsRef<Path>>(
    path: P,
    names: &[String],
    rows: &[(f64, DVector<f64>)],
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["time".to_string()];
    header.extend(names.iter().cloned());
    writer.write_record(&header)?;
    for (time, values) in rows {
        let mut record = vec![time.to_string()];
        record.extend(values.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_lookup_by_name() {
        let estimate = StateEstimate::new(
            vec!["x".to_string(), "v".to_string()],
            DVector::from_vec(vec![1.5, -0.25]),
        );
        assert_eq!(estimate.get("x"), Some(1.5));
        assert_eq!(estimate.get("v"), Some(-0.25));
        assert_eq!(estimate.get("missing"), None);
    }

    #[test]
    fn labels_append_reserved_weight_field() {
        let estimate =
            StateEstimate::new(vec!["x".to_string()], DVector::from_vec(vec![0.0]));
        assert_eq!(estimate.labels(), vec!["x".to_string(), "weight".to_string()]);
    }

    #[test]
    fn csv_round_trip() {
        let dir = std::env::temp_dir().join("seqmc_records_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("estimates.csv");
        let names = vec!["x".to_string()];
        let rows = vec![
            (0.0, DVector::from_vec(vec![0.5])),
            (1.0, DVector::from_vec(vec![0.75])),
        ];
        write_estimates_csv(&path, &names, &rows).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("time,x"));
        assert!(contents.contains("1,0.75"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn measurement_csv_reads_back() {
        let dir = std::env::temp_dir().join("seqmc_records_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("measurements.csv");
        std::fs::write(&path, "time,value\n0.0,1.25\n1.0,-0.5\n").unwrap();
        let records = read_measurements_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, -0.5);
        std::fs::remove_file(&path).ok();
    }
}
