//! Small line-oriented records on the data partition.
//!
//! Each record owns the first N lines of its file. Lines past the ones a
//! record understands belong to whoever else reads the file and are carried
//! through every rewrite untouched.
//!
//! Writes overwrite the file in place and then flush and sync it. There is no
//! write-then-rename step, so power loss in the middle of a write can leave a
//! truncated file behind. Readers treat missing lines as absent.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

/// The leading fields of a line file plus the bytes that follow them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lines {
    fields: Vec<Option<String>>,
    tail: Vec<u8>,
}

impl Lines {
    /// Field `index`, trimmed, or `None` when the line is missing or blank.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .and_then(|field| field.as_deref())
            .map(str::trim)
            .filter(|field| !field.is_empty())
    }

    pub fn parse<T: std::str::FromStr>(&self, index: usize) -> Option<T> {
        self.get(index).and_then(|field| field.parse().ok())
    }

    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    fn split(bytes: &[u8], count: usize) -> Self {
        let mut fields = Vec::with_capacity(count);
        let mut rest = bytes;
        while fields.len() < count && !rest.is_empty() {
            let (line, next) = match rest.iter().position(|b| *b == b'\n') {
                Some(end) => (&rest[..end], &rest[end + 1..]),
                None => (rest, &rest[rest.len()..]),
            };
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            fields.push(Some(String::from_utf8_lossy(line).into_owned()));
            rest = next;
        }
        fields.resize(count, None);
        Self {
            fields,
            tail: rest.to_vec(),
        }
    }
}

/// A record persisted as a fixed sequence of lines.
pub trait LineRecord: Sized {
    const LINES: usize;

    /// Builds the record from whatever lines were present. `None` means the
    /// file does not hold a usable record.
    fn from_lines(lines: &Lines) -> Option<Self>;

    fn to_lines(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct LineStore {
    path: PathBuf,
}

impl LineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the first `count` lines. `Ok(None)` when the file does not exist.
    pub fn read(&self, count: usize) -> io::Result<Option<Lines>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Lines::split(&bytes, count))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rewrites the leading fields and keeps whatever followed them.
    pub fn write(&self, fields: &[String]) -> io::Result<()> {
        let tail = self
            .read(fields.len())?
            .map(|lines| lines.tail)
            .unwrap_or_default();

        let mut contents = Vec::with_capacity(tail.len() + 64);
        for field in fields {
            contents.extend_from_slice(field.as_bytes());
            contents.push(b'\n');
        }
        contents.extend_from_slice(&tail);

        let mut file = File::create(&self.path)?;
        file.write_all(&contents)?;
        file.flush()?;
        file.sync_all()?;
        debug!(
            "Wrote {} field(s) to {} ({} trailing byte(s) kept)",
            fields.len(),
            self.path.display(),
            tail.len()
        );
        Ok(())
    }

    pub fn load<R: LineRecord>(&self) -> io::Result<Option<R>> {
        Ok(self.read(R::LINES)?.and_then(|lines| R::from_lines(&lines)))
    }

    pub fn save<R: LineRecord>(&self, record: &R) -> io::Result<()> {
        self.write(&record.to_lines())?;
        info!("Saved {}", self.path.display());
        Ok(())
    }
}
