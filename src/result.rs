use crate::governor::ErrorRecord;
use std::path::PathBuf;

/// Outcome of one merge job. Failures are reported here, never as panics.
#[derive(Debug)]
pub struct JobResult<T> {
    pub job_id: String,
    pub success: bool,
    /// Rows in the committed output.
    pub total_rows: u64,
    pub elapsed_ms: u64,
    pub sources: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub error_message: Option<String>,
    pub validation_errors: Vec<String>,

    pub rows_read: u64,
    pub rows_rejected: u64,
    pub files_read: usize,
    pub files_failed: usize,

    pub error_count: usize,
    pub error_report: Option<String>,
    pub errors: Vec<ErrorRecord<T>>,
    pub error_data_file: Option<PathBuf>,
}

impl<T> JobResult<T> {
    pub(crate) fn new(job_id: impl Into<String>, sources: Vec<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            total_rows: 0,
            elapsed_ms: 0,
            sources,
            output: None,
            error_message: None,
            validation_errors: Vec::new(),
            rows_read: 0,
            rows_rejected: 0,
            files_read: 0,
            files_failed: 0,
            error_count: 0,
            error_report: None,
            errors: Vec::new(),
            error_data_file: None,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Output rows per second of wall time; 0 when nothing was timed.
    pub fn rows_per_second(&self) -> f64 {
        if self.elapsed_ms == 0 {
            0.0
        } else {
            self.total_rows as f64 * 1000.0 / self.elapsed_ms as f64
        }
    }

    /// Short human summary, e.g. for the binary's final line.
    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "job {}: merged {} rows from {} files in {} ms ({:.0} rows/s, {} errors)",
                self.job_id,
                self.total_rows,
                self.files_read,
                self.elapsed_ms,
                self.rows_per_second(),
                self.error_count
            )
        } else {
            format!(
                "job {} failed after {} ms: {}",
                self.job_id,
                self.elapsed_ms,
                self.error_message.as_deref().unwrap_or("unknown error")
            )
        }
    }
}
