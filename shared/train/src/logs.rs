use crate::TrainError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// The two per-run log files: a human-readable pipe-separated status line
/// per epoch, and a machine-parseable whitespace table whose first line is
/// a `#` comment naming the fields. One pair per run index.
pub struct RunLogs {
    status: BufWriter<File>,
    status_path: std::path::PathBuf,
    perf: BufWriter<File>,
    perf_path: std::path::PathBuf,
    perf_header_written: bool,
}

impl RunLogs {
    pub fn create(run_dir: &Path) -> Result<Self, TrainError> {
        let status_path = run_dir.join("train.log");
        let perf_path = run_dir.join("perf.log");
        let status = File::create(&status_path).map_err(|source| TrainError::Io {
            path: status_path.clone(),
            source,
        })?;
        let perf = File::create(&perf_path).map_err(|source| TrainError::Io {
            path: perf_path.clone(),
            source,
        })?;
        Ok(Self {
            status: BufWriter::new(status),
            status_path,
            perf: BufWriter::new(perf),
            perf_path,
            perf_header_written: false,
        })
    }

    pub fn status_line(&mut self, line: &str) -> Result<(), TrainError> {
        info!("{line}");
        writeln!(self.status, "{line}").map_err(|source| TrainError::Io {
            path: self.status_path.clone(),
            source,
        })?;
        self.status.flush().map_err(|source| TrainError::Io {
            path: self.status_path.clone(),
            source,
        })
    }

    pub fn perf_row(&mut self, fields: &[(&str, f64)]) -> Result<(), TrainError> {
        let write = |perf: &mut BufWriter<File>, text: String| -> std::io::Result<()> {
            writeln!(perf, "{text}")?;
            perf.flush()
        };
        let io_err = |source| TrainError::Io {
            path: self.perf_path.clone(),
            source,
        };
        if !self.perf_header_written {
            let header = fields
                .iter()
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(" ");
            write(&mut self.perf, format!("# {header}")).map_err(io_err)?;
            self.perf_header_written = true;
        }
        let row = fields
            .iter()
            .map(|(_, value)| format!("{value:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        let io_err = |source| TrainError::Io {
            path: self.perf_path.clone(),
            source,
        };
        write(&mut self.perf, row).map_err(io_err)
    }
}
