//! Batch metrics, per-phase tallies and the two run logs.
//!
//! The results log holds the human-readable progress lines. The scalar
//! stream mirrors every batch as one JSON object per line.

use mixverify_core::{Phase, Result, TrainConfig};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub loss: f64,
    pub correct: usize,
    pub rows: usize,
}

impl BatchMetrics {
    /// Correct rows as a percentage of the batch.
    pub fn accuracy_pct(&self) -> f64 {
        percentage(self.correct, self.rows)
    }
}

fn percentage(correct: usize, rows: usize) -> f64 {
    if rows == 0 {
        0.0
    } else {
        100.0 * correct as f64 / rows as f64
    }
}

/// Running totals for one phase of one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTally {
    pub batches: usize,
    pub rows: usize,
    pub correct: usize,
    pub loss_sum: f64,
}

impl PhaseTally {
    pub fn record(&mut self, batch: &BatchMetrics) {
        self.batches += 1;
        self.rows += batch.rows;
        self.correct += batch.correct;
        self.loss_sum += batch.loss;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    pub fn accuracy_pct(&self) -> f64 {
        percentage(self.correct, self.rows)
    }
}

/// `Epoch  0, I100 loss_train: (0.69314718), acc_train(batch, global): (50.00000000,48.25000000)`
pub fn progress_line(
    epoch: usize,
    phase: Phase,
    batch: &BatchMetrics,
    tally: &PhaseTally,
) -> String {
    format!(
        "Epoch{:3}, I{:3} loss_{p}: ({:.8}), acc_{p}(batch, global): ({:.8},{:.8})",
        epoch,
        tally.batches,
        batch.loss,
        batch.accuracy_pct(),
        tally.accuracy_pct(),
        p = phase.as_str(),
    )
}

/// One line of the scalar stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub phase: Phase,
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// Append-only writers for the results log and the scalar stream.
pub struct RunLogs {
    results: BufWriter<File>,
    scalars: BufWriter<File>,
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl RunLogs {
    pub fn open(config: &TrainConfig) -> Result<Self> {
        Self::open_paths(&config.results_path(), &config.scalars_path())
    }

    pub fn open_paths(results: &Path, scalars: &Path) -> Result<Self> {
        Ok(Self {
            results: open_append(results)?,
            scalars: open_append(scalars)?,
        })
    }

    pub fn write_progress(&mut self, line: &str) -> Result<()> {
        writeln!(self.results, "{line}")?;
        self.results.flush()?;
        Ok(())
    }

    pub fn write_scalar(&mut self, record: &ScalarRecord) -> Result<()> {
        serde_json::to_writer(&mut self.scalars, record)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.results.flush()?;
        self.scalars.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_accumulates() {
        let mut tally = PhaseTally::default();
        tally.record(&BatchMetrics {
            loss: 1.0,
            correct: 3,
            rows: 4,
        });
        tally.record(&BatchMetrics {
            loss: 0.5,
            correct: 1,
            rows: 6,
        });
        assert_eq!(tally.batches, 2);
        assert_eq!(tally.rows, 10);
        assert!((tally.mean_loss() - 0.75).abs() < 1e-12);
        assert!((tally.accuracy_pct() - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_uses_actual_rows() {
        let batch = BatchMetrics {
            loss: 0.0,
            correct: 11,
            rows: 11,
        };
        assert!((batch.accuracy_pct() - 100.0).abs() < 1e-12);
        assert_eq!(PhaseTally::default().accuracy_pct(), 0.0);
    }

    #[test]
    fn test_progress_line_format() {
        let batch = BatchMetrics {
            loss: 0.5,
            correct: 5,
            rows: 10,
        };
        let mut tally = PhaseTally::default();
        tally.record(&batch);
        let line = progress_line(2, Phase::Validate, &batch, &tally);
        assert_eq!(
            line,
            "Epoch  2, I  1 loss_val: (0.50000000), acc_val(batch, global): (50.00000000,50.00000000)"
        );
    }

    #[test]
    fn test_run_logs_append() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("out/run_results.txt");
        let scalars = dir.path().join("out/run_scalars.jsonl");

        {
            let mut logs = RunLogs::open_paths(&results, &scalars).unwrap();
            logs.write_progress("first").unwrap();
            logs.write_scalar(&ScalarRecord {
                phase: Phase::Train,
                epoch: 0,
                step: 1,
                loss: 0.7,
                accuracy: 50.0,
            })
            .unwrap();
            logs.flush().unwrap();
        }
        {
            let mut logs = RunLogs::open_paths(&results, &scalars).unwrap();
            logs.write_progress("second").unwrap();
            logs.flush().unwrap();
        }

        let text = std::fs::read_to_string(&results).unwrap();
        assert_eq!(text, "first\nsecond\n");

        let stream = std::fs::read_to_string(&scalars).unwrap();
        let record: ScalarRecord = serde_json::from_str(stream.trim()).unwrap();
        assert_eq!(record.phase, Phase::Train);
        assert_eq!(record.step, 1);
        assert!(stream.contains("\"phase\":\"train\""));
    }
}
