//! Crash-safe sync log
//!
//! Append-only framed log co-located with the database. Every captured
//! change is appended and fsynced before it is considered durable; on
//! restart the log is replayed to rebuild the change buffer. The log is
//! truncated whenever the buffer becomes empty.
//!
//! Frame layout, little-endian int32 lengths: `total_len`, then four
//! `{ len, bytes + NUL }` blocks for cmd, data, key, updated, in that
//! order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::AgentError;

/// Upper bound for one block, used to detect corrupt frames
const MAX_BLOCK: i32 = 256 * 1024;

/// One replayed log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub cmd: String,
    pub data: String,
    pub key: String,
    pub updated: String,
}

pub struct SyncLog {
    path: PathBuf,
    file: Option<File>,
    nosave: bool,
}

impl SyncLog {
    /// The sync log lives next to the database file with a `.sync` suffix.
    pub fn sync_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".sync");
        PathBuf::from(name)
    }

    pub fn open(db_path: &Path, nosave: bool) -> SyncLog {
        let path = Self::sync_path(db_path);
        let file = if nosave {
            None
        } else {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => Some(f),
                Err(e) => {
                    error!("Cannot open sync log {}: {}", path.display(), e);
                    None
                }
            }
        };
        SyncLog { path, file, nosave }
    }

    fn put_block(buf: &mut Vec<u8>, s: &str) {
        let len = (s.len() + 1) as i32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    /// Append one change frame and flush it to the device.
    pub fn append(&mut self, cmd: &str, data: &str, key: &str, updated: &str) -> Result<usize, AgentError> {
        let total = cmd.len() + data.len() + key.len() + updated.len() + 4;
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(total),
        };
        let mut buf = Vec::with_capacity(total + 20);
        buf.extend_from_slice(&(total as i32).to_le_bytes());
        Self::put_block(&mut buf, cmd);
        Self::put_block(&mut buf, data);
        Self::put_block(&mut buf, key);
        Self::put_block(&mut buf, updated);

        file.write_all(&buf)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|e| AgentError::CantWrite(format!("sync log {}: {}", self.path.display(), e)))?;
        Ok(total)
    }

    fn read_i32(file: &mut File) -> Option<i32> {
        let mut bytes = [0u8; 4];
        match file.read_exact(&mut bytes) {
            Ok(()) => Some(i32::from_le_bytes(bytes)),
            Err(_) => None,
        }
    }

    fn read_block(file: &mut File) -> Option<String> {
        let len = Self::read_i32(file)?;
        if len <= 0 || len > MAX_BLOCK {
            return None;
        }
        let mut bytes = vec![0u8; len as usize];
        file.read_exact(&mut bytes).ok()?;
        // Strip the trailing NUL
        bytes.pop();
        String::from_utf8(bytes).ok()
    }

    /// Replay the log from the start. A corrupt tail truncates the log and
    /// returns the entries read so far.
    pub fn replay(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        if self.nosave {
            return entries;
        }
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return entries,
        };
        loop {
            let total = match Self::read_i32(&mut file) {
                Some(n) if n > 0 => n,
                _ => break,
            };
            let _ = total;
            let cmd = Self::read_block(&mut file);
            let data = Self::read_block(&mut file);
            let key = Self::read_block(&mut file);
            let updated = Self::read_block(&mut file);
            match (cmd, data, key, updated) {
                (Some(cmd), Some(data), Some(key), Some(updated)) => {
                    entries.push(LogEntry { cmd, data, key, updated });
                }
                _ => {
                    warn!("Corrupt sync log {}, truncating", self.path.display());
                    if let Err(e) = self.truncate() {
                        error!("Cannot truncate sync log: {}", e);
                    }
                    break;
                }
            }
        }
        entries
    }

    /// Truncate by reopening for write.
    pub fn truncate(&mut self) -> Result<(), AgentError> {
        if self.nosave {
            return Ok(());
        }
        self.file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| AgentError::CantWrite(format!("sync log {}: {}", self.path.display(), e)))?;
        self.file = Some(file);
        Ok(())
    }

    /// Current on-disk size in bytes.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("device.db");
        let mut log = SyncLog::open(&db_path, false);

        log.append("create", "{\"id\":\"s1\",\"v\":1}", "Sensor#s1", "2024-01-01T00:00:00Z")
            .unwrap();
        log.append("update", "{\"id\":\"s2\",\"v\":2}", "Sensor#s2", "2024-01-01T00:00:01Z")
            .unwrap();

        let mut log2 = SyncLog::open(&db_path, false);
        let entries = log2.replay();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cmd, "create");
        assert_eq!(entries[0].key, "Sensor#s1");
        assert_eq!(entries[1].data, "{\"id\":\"s2\",\"v\":2}");
        assert_eq!(entries[1].updated, "2024-01-01T00:00:01Z");
    }

    #[test]
    fn test_truncate_resets_to_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("device.db");
        let mut log = SyncLog::open(&db_path, false);
        log.append("create", "{}", "Sensor#s1", "t").unwrap();
        assert!(log.size() > 0);
        log.truncate().unwrap();
        assert_eq!(log.size(), 0);
        assert!(log.replay().is_empty());
    }

    #[test]
    fn test_corrupt_tail_keeps_valid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("device.db");
        let mut log = SyncLog::open(&db_path, false);
        log.append("create", "{\"id\":\"s1\"}", "Sensor#s1", "t1").unwrap();

        // Append garbage that looks like the start of a frame
        {
            use std::io::Write;
            let mut f = OpenOptions::new()
                .append(true)
                .open(SyncLog::sync_path(&db_path))
                .unwrap();
            f.write_all(&42i32.to_le_bytes()).unwrap();
            f.write_all(&[0xffu8; 3]).unwrap();
        }

        let mut log2 = SyncLog::open(&db_path, false);
        let entries = log2.replay();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "Sensor#s1");
        // Corrupt log was truncated
        assert_eq!(log2.size(), 0);
    }

    #[test]
    fn test_nosave_skips_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("device.db");
        let mut log = SyncLog::open(&db_path, true);
        log.append("create", "{}", "Sensor#s1", "t").unwrap();
        assert_eq!(log.size(), 0);
        assert!(log.replay().is_empty());
    }
}
