//! Log tail sources
//!
//! A source is either a file (watched for modifications, reopened across
//! rotations) or a command whose stdout is tailed. Both feed the same line
//! assembler, which splits on newlines, honors continuation prefixes, and
//! force-emits oversized records.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error};

/// A logical record longer than this is emitted without a terminator
pub const MAX_LINE: usize = 2048;

/// Default continuation characters: a line starting with one of these
/// continues the previous logical record
pub const DEFAULT_CONTINUATION: &str = " \t";

/// Assembles logical records from a byte stream.
pub struct LineAssembler {
    buf: Vec<u8>,
    continuation: Vec<u8>,
}

impl LineAssembler {
    pub fn new(continuation: &str) -> LineAssembler {
        LineAssembler {
            buf: Vec::new(),
            continuation: continuation.as_bytes().to_vec(),
        }
    }

    /// Feed bytes, returning any completed logical records.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut records = Vec::new();
        loop {
            let mut search_from = 0;
            let mut end = None;
            while let Some(pos) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
                let nl = search_from + pos;
                if nl + 1 < self.buf.len() && self.continuation.contains(&self.buf[nl + 1]) {
                    // Continuation: the newline stays inside the record
                    search_from = nl + 1;
                    continue;
                }
                end = Some(nl);
                break;
            }
            match end {
                Some(nl) => {
                    let mut record: Vec<u8> = self.buf.drain(..=nl).collect();
                    record.pop();
                    records.push(String::from_utf8_lossy(&record).into_owned());
                }
                None => {
                    if self.buf.len() >= MAX_LINE {
                        let record: Vec<u8> = self.buf.drain(..).collect();
                        records.push(String::from_utf8_lossy(&record).into_owned());
                    }
                    break;
                }
            }
        }
        records
    }

    /// Flush whatever is buffered (end of a command stream).
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut record: Vec<u8> = self.buf.drain(..).collect();
        if record.last() == Some(&b'\n') {
            record.pop();
        }
        Some(String::from_utf8_lossy(&record).into_owned())
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Tail state for one log file.
pub struct FileTail {
    pub path: PathBuf,
    file: Option<File>,
    pos: u64,
    inode: u64,
    /// Start from the end (tail) on the first open
    tail: bool,
}

impl FileTail {
    pub fn new(path: PathBuf, tail: bool) -> FileTail {
        FileTail {
            path,
            file: None,
            pos: 0,
            inode: 0,
            tail,
        }
    }

    /// Open (or reopen) the file and position for reading. On an inode
    /// change (rotation) the position resets to zero.
    pub fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let inode = inode_of(&meta);

        if self.inode == 0 {
            // First open
            self.pos = if self.tail {
                file.seek(SeekFrom::End(0))?
            } else {
                0
            };
        } else if inode == self.inode {
            // Same file: resume from the last known offset
            if self.pos <= meta.len() {
                file.seek(SeekFrom::Start(self.pos))?;
            } else {
                // Truncated underneath us
                self.pos = 0;
            }
        } else {
            // Rotated: read the replacement from the beginning
            debug!("Log file {} rotated", self.path.display());
            self.pos = 0;
        }
        if self.pos == 0 {
            file.seek(SeekFrom::Start(0))?;
        }
        self.inode = inode;
        self.file = Some(file);
        Ok(())
    }

    /// Read whatever is available past the current position.
    pub fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(Vec::new()),
        };
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
            self.pos += n as u64;
        }
        Ok(data)
    }

    /// Close, retaining position and inode for the next open.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Drop a held handle when the path now names a different inode, so the
    /// next open starts the replacement file from the beginning.
    pub fn check_rotation(&mut self) {
        if self.file.is_none() || self.inode == 0 {
            return;
        }
        match std::fs::metadata(&self.path) {
            Ok(meta) if inode_of(&meta) != self.inode => self.close(),
            Err(_) => self.close(),
            _ => {}
        }
    }
}

/// Tail state for a command's stdout.
pub struct CommandTail {
    pub command: String,
    child: Option<Child>,
}

impl CommandTail {
    pub fn new(command: String) -> CommandTail {
        CommandTail { command, child: None }
    }

    /// Spawn the command and take its stdout for reading.
    pub fn open(&mut self) -> std::io::Result<ChildStdout> {
        debug!("Run command: {}", self.command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no stdout from command")
        })?;
        self.child = Some(child);
        Ok(stdout)
    }

    pub async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    error!("Bad exit status for command \"{}\": {}", self.command, status);
                }
                Ok(_) => {}
                Err(e) => error!("Cannot reap command \"{}\": {}", self.command, e),
            }
        }
    }
}

/// A tail source: a watched file or a command pipe.
pub enum TailSource {
    File(FileTail),
    Command(CommandTail),
}
