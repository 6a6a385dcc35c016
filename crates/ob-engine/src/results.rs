//! Tabular benchmark results.

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use ob_types::{BenchError, BenchResult, CostRecord, TrialOutcome, TrialStatus};
use parquet::arrow::ArrowWriter;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Prefix of the per-metric columns.
pub const METRIC_PREFIX: &str = "objective_";

/// Outcomes of a benchmark run, one per trial, in enumeration order.
/// Each cost record of each curve is one table row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    outcomes: Vec<TrialOutcome>,
}

impl ResultTable {
    pub fn new(outcomes: Vec<TrialOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[TrialOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<TrialOutcome> {
        self.outcomes
    }

    pub fn outcome(&self, name: &str) -> Option<&TrialOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn n_rows(&self) -> usize {
        self.outcomes.iter().map(|o| o.curve.len()).sum()
    }

    /// Sorted union of the metric names of every record.
    pub fn metric_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .rows()
            .flat_map(|(_, record)| record.metrics.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    fn rows(&self) -> impl Iterator<Item = (&TrialOutcome, &CostRecord)> {
        self.outcomes
            .iter()
            .flat_map(|o| o.curve.records().iter().map(move |r| (o, r)))
    }

    pub fn schema(&self) -> SchemaRef {
        let mut fields = vec![
            Field::new("dataset", DataType::Utf8, false),
            Field::new("objective", DataType::Utf8, false),
            Field::new("solver", DataType::Utf8, false),
            Field::new("status", DataType::Utf8, false),
            Field::new("idx_rep", DataType::UInt64, false),
            Field::new("stop_val", DataType::Float64, false),
            Field::new("time", DataType::Float64, false),
        ];
        fields.extend(
            self.metric_names()
                .iter()
                .map(|m| Field::new(format!("{METRIC_PREFIX}{m}"), DataType::Float64, true)),
        );
        Arc::new(Schema::new(fields))
    }

    pub fn to_record_batch(&self) -> BenchResult<RecordBatch> {
        let schema = self.schema();
        let rows: Vec<(&TrialOutcome, &CostRecord)> = self.rows().collect();

        let mut arrays: Vec<ArrayRef> = vec![
            text_column(&rows, |o| o.dataset.clone()),
            text_column(&rows, |o| o.objective.clone()),
            text_column(&rows, |o| o.solver.clone()),
            text_column(&rows, |o| o.status.to_string()),
            Arc::new(UInt64Array::from(
                rows.iter()
                    .map(|(_, r)| r.key.repetition as u64)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, r)| r.stop_val.as_f64()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, r)| r.time).collect::<Vec<_>>(),
            )),
        ];
        for metric in self.metric_names() {
            let column: Vec<Option<f64>> = rows
                .iter()
                .map(|(_, r)| r.metrics.get(&metric).copied())
                .collect();
            arrays.push(Arc::new(Float64Array::from(column)));
        }

        RecordBatch::try_new(schema, arrays).map_err(|e| BenchError::Arrow(e.to_string()))
    }

    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> BenchResult<()> {
        let batch = self.to_record_batch()?;
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .map_err(|e| BenchError::Parquet(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| BenchError::Parquet(e.to_string()))?;
        writer
            .close()
            .map_err(|e| BenchError::Parquet(e.to_string()))?;
        Ok(())
    }
}

fn text_column(
    rows: &[(&TrialOutcome, &CostRecord)],
    field: impl Fn(&TrialOutcome) -> String,
) -> ArrayRef {
    Arc::new(StringArray::from(
        rows.iter().map(|(o, _)| field(o)).collect::<Vec<String>>(),
    ))
}

/// End-of-run summary, one line per trial.
impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.name.len())
            .max()
            .unwrap_or(5)
            .max(5);

        writeln!(
            f,
            "{:<width$}  {:<22}  {:>6}  {:>14}",
            "trial", "status", "points", "final value"
        )?;
        for o in &self.outcomes {
            let value = o
                .final_value()
                .map(|v| format!("{v:.6e}"))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<width$}  {:<22}  {:>6}  {:>14}",
                o.name,
                o.status.to_string(),
                o.curve.len(),
                value
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use chrono::Utc;
    use ob_types::{ConvergenceCurve, Metrics, StopVal, TrialKey, VALUE_METRIC};

    fn outcome(
        solver: &str,
        status: TrialStatus,
        points: &[(u64, f64, Option<f64>)],
    ) -> TrialOutcome {
        let mut curve = ConvergenceCurve::new();
        for &(it, value, grad) in points {
            let mut metrics = Metrics::from([(VALUE_METRIC.to_string(), value)]);
            if let Some(g) = grad {
                metrics.insert("grad_norm".to_string(), g);
            }
            curve.push(CostRecord {
                key: TrialKey {
                    dataset: "simulated".into(),
                    objective: "quadratic".into(),
                    solver: solver.into(),
                    repetition: 0,
                },
                stop_val: StopVal::Iterations(it),
                time: it as f64 * 0.01,
                metrics,
            });
        }
        curve.finalize();
        TrialOutcome {
            name: format!("simulated / quadratic / {solver}"),
            dataset: "simulated".into(),
            objective: "quadratic".into(),
            solver: solver.into(),
            status,
            curve,
            message: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn table() -> ResultTable {
        ResultTable::new(vec![
            outcome("gd", TrialStatus::Done, &[(0, 1.0, Some(2.0)), (1, 0.5, Some(1.0))]),
            outcome("newton", TrialStatus::MaxRuns, &[(0, 1.0, None)]),
            outcome("broken", TrialStatus::Error, &[]),
        ])
    }

    #[test]
    fn record_batch_has_one_row_per_record() {
        let table = table();
        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.metric_names(), vec!["grad_norm", "value"]);

        let batch = table.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 9);

        let schema = batch.schema();
        assert!(schema.field_with_name("objective_value").is_ok());
        let grad = batch
            .column(schema.index_of("objective_grad_norm").unwrap())
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(grad.null_count(), 1);
        assert_eq!(grad.value(1), 1.0);
    }

    #[test]
    fn writes_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.parquet");
        table().write_parquet(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn summary_lists_every_trial() {
        let table = table();
        let summary = table.to_string();
        assert_eq!(summary.lines().count(), 4);
        assert!(summary.contains("done (not enough run)"));
        assert_eq!(table.count(TrialStatus::Error), 1);
        assert!(table.outcome("simulated / quadratic / gd").is_some());
    }
}
