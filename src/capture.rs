//! Redirection of bulk replies (telemetry, logs, register dumps) into a file.
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not create the capture file at {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
}

/// The sink of a bulk capture.
///
/// The line counter survives [`Capture::close`] so that the embedding application can tell
/// how much data arrived after the fact.
#[derive(Default)]
pub struct Capture {
    sink: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    lines: usize,
}

impl Capture {
    /// Create (or truncate) the file at `path` and direct subsequent lines into it.
    pub fn open(&mut self, path: &Path) -> Result<(), Error> {
        self.close();
        let file = File::create(path).map_err(|e| Error::Create(e, path.to_path_buf()))?;
        debug!(message = "capture opened", path = %path.display());
        self.sink = Some(BufWriter::new(file));
        self.path = Some(path.to_path_buf());
        self.lines = 0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of lines received since the capture was (re)started.
    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn restart_count(&mut self) {
        self.lines = 0;
    }

    /// Append one line verbatim. Lines are counted even when there is no file to write to.
    pub fn append(&mut self, line: &str) {
        self.lines += 1;
        let Some(sink) = &mut self.sink else {
            return;
        };
        if let Err(e) = writeln!(sink, "{line}") {
            warn!(
                message = "writing the capture failed, dropping the rest",
                error = (&e as &dyn std::error::Error)
            );
            self.sink = None;
        }
    }

    pub fn close(&mut self) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };
        if let Err(e) = sink.flush() {
            warn!(message = "flushing the capture failed", error = (&e as &dyn std::error::Error));
        }
        info!(
            message = "capture closed",
            lines = self.lines,
            path = ?self.path,
        );
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlm.txt");
        let mut capture = Capture::default();
        capture.open(&path).unwrap();
        capture.append("t,iA,iB");
        capture.append("  1 , 2.5 ,3");
        capture.close();
        assert!(!capture.is_open());
        assert_eq!(capture.lines(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "t,iA,iB\n  1 , 2.5 ,3\n");
    }

    #[test]
    fn reopening_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlm.txt");
        let mut capture = Capture::default();
        capture.open(&path).unwrap();
        capture.append("old");
        capture.open(&path).unwrap();
        assert_eq!(capture.lines(), 0);
        capture.append("new");
        capture.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = Capture::default();
        let result = capture.open(&dir.path().join("no/such/dir/tlm.txt"));
        assert!(matches!(result, Err(Error::Create(..))));
        capture.append("counted anyway");
        assert_eq!(capture.lines(), 1);
    }
}
