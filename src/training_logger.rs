//! Training Metrics Logger
//!
//! Writes one CSV row per epoch so a run can be analyzed or plotted after the
//! fact. The console output stays in the training loop; this file is only the
//! durable record.
//!
//! ## CSV Format
//!
//! - `epoch`: 1-based epoch number
//! - `elapsed_seconds`: wall time since the logger was created
//! - `learning_rate`: the optimizer's base learning rate
//! - `dropout`: the dropout rate used this epoch (after decay)
//! - `train_loss`: mean per-position training loss
//! - `dev_accuracy`: held-out accuracy, empty when no held-out set was given

use std::fs::File;
use std::io::Write;
use std::time::Instant;

/// Epoch-level CSV logger.
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create the log file and write the CSV header.
    pub fn new(log_path: &str) -> std::io::Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "epoch,elapsed_seconds,learning_rate,dropout,train_loss,dev_accuracy"
        )?;
        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Append one epoch's metrics.
    pub fn log(
        &mut self,
        epoch: usize,
        learning_rate: f32,
        dropout: f32,
        train_loss: f32,
        dev_accuracy: Option<f32>,
    ) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let dev = dev_accuracy.map_or(String::new(), |a| format!("{:.4}", a));
        writeln!(
            self.log_file,
            "{},{:.1},{},{:.3},{:.4},{}",
            epoch, elapsed, learning_rate, dropout, train_loss, dev
        )?;
        self.log_file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let dir = std::env::temp_dir().join("viola_logger_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.csv");
        let path = path.to_str().unwrap();

        let mut logger = TrainingLogger::new(path).unwrap();
        logger.log(1, 0.01, 0.25, 1.5, Some(0.8)).unwrap();
        logger.log(2, 0.01, 0.2, 1.2, None).unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,"));
        assert!(lines[1].starts_with("1,"));
        assert!(lines[2].ends_with(','));
    }
}
