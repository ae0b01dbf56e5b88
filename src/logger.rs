use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Operation log for the daemon. Implementations must tolerate being
/// called from many connection handlers at once.
pub trait Logger: Send + Sync {
    fn saved(&self, _name: &str, _bytes: u64, _checksum: &str) {}
    fn fetched(&self, _name: &str, _bytes: u64) {}
    fn deleted(&self, _name: &str) {}
    fn sync_started(&self, _job: &str) {}
    fn copied(&self, _direction: &str, _name: &str, _bytes: u64) {}
    fn sync_done(&self, _job: &str, _uploads: usize, _downloads: usize, _conflicts: usize) {}
    fn error(&self, _context: &str, _name: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn saved(&self, name: &str, bytes: u64, checksum: &str) {
        self.line(&format!("SAVE name={name} bytes={bytes} checksum={checksum}"));
    }
    fn fetched(&self, name: &str, bytes: u64) {
        self.line(&format!("GET name={name} bytes={bytes}"));
    }
    fn deleted(&self, name: &str) {
        self.line(&format!("DELETE name={name}"));
    }
    fn sync_started(&self, job: &str) {
        self.line(&format!("SYNC-START job={job}"));
    }
    fn copied(&self, direction: &str, name: &str, bytes: u64) {
        self.line(&format!("COPY dir={direction} name={name} bytes={bytes}"));
    }
    fn sync_done(&self, job: &str, uploads: usize, downloads: usize, conflicts: usize) {
        self.line(&format!(
            "SYNC-DONE job={job} uploads={uploads} downloads={downloads} conflicts={conflicts}"
        ));
    }
    fn error(&self, context: &str, name: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} name={name} msg={msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.saved("a.txt", 3, "abc123");
        logger.deleted("a.txt");
        logger.error("upload", "a.txt", "disk full");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("SAVE name=a.txt bytes=3 checksum=abc123"));
        assert!(lines[1].contains("DELETE name=a.txt"));
        assert!(lines[2].contains("ERROR ctx=upload name=a.txt msg=disk full"));
    }
}
