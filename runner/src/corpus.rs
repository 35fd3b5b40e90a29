//! On-disk corpus of interesting inputs.
//!
//! Every entry is one file whose content is the raw input and whose name
//! carries the run metadata, e.g.
//!
//! ```text
//! id:000007,cost:0000123456,hs:0000000042,hnb:2,exec:881,len:037,tu:014,crtime:1756300000123,dur:5021+cov+cost
//! ```
//!
//! The `+cov`, `+max` and `+cost` suffixes flag why the input was kept.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use mcts::{CorpusSink, Interesting};

#[derive(Debug, Error)]
pub enum CorpusNameError {
    #[error("corpus name field '{0}' is missing")]
    MissingField(&'static str),

    #[error("corpus name field '{field}' has a malformed value '{value}'")]
    BadValue { field: &'static str, value: String },

    #[error("corpus name has a malformed segment '{0}'")]
    BadSegment(String),

    #[error("corpus name has an unknown suffix '+{0}'")]
    UnknownSuffix(String),
}

/// Metadata recovered from a corpus file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusMeta {
    pub id: u64,
    pub cost: u64,
    pub hotspot: u32,
    pub hnb: u8,
    pub iteration: u64,
    pub len: usize,
    pub tokens_used: u32,
    pub created_ms: u64,
    pub elapsed_ms: u64,
    pub new_coverage: bool,
    pub new_max_hit: bool,
    pub new_cost: bool,
}

fn entry_name(id: u64, entry: &Interesting<'_>, created_ms: u64) -> String {
    let mut name = format!(
        "id:{:06},cost:{:010},hs:{:010},hnb:{},exec:{},len:{:03},tu:{:03},crtime:{},dur:{}",
        id,
        entry.cost,
        entry.hotspot,
        entry.hnb,
        entry.iteration,
        entry.input.len(),
        entry.tokens_used,
        created_ms,
        entry.elapsed_ms,
    );
    if entry.new_coverage {
        name.push_str("+cov");
    }
    if entry.new_max_hit {
        name.push_str("+max");
    }
    if entry.new_cost {
        name.push_str("+cost");
    }
    name
}

/// Parse a corpus file name back into its metadata.
pub fn parse_corpus_name(name: &str) -> Result<CorpusMeta, CorpusNameError> {
    let (fields_part, suffix_part) = match name.find('+') {
        Some(pos) => (&name[..pos], &name[pos..]),
        None => (name, ""),
    };

    let mut fields: HashMap<&str, &str> = HashMap::new();
    for segment in fields_part.split(',') {
        let (key, value) = segment
            .split_once(':')
            .ok_or_else(|| CorpusNameError::BadSegment(segment.to_string()))?;
        fields.insert(key, value);
    }

    fn numeric<T: std::str::FromStr>(
        fields: &HashMap<&str, &str>,
        field: &'static str,
    ) -> Result<T, CorpusNameError> {
        let raw = fields
            .get(field)
            .ok_or(CorpusNameError::MissingField(field))?;
        raw.parse().map_err(|_| CorpusNameError::BadValue {
            field,
            value: raw.to_string(),
        })
    }

    let mut new_coverage = false;
    let mut new_max_hit = false;
    let mut new_cost = false;
    for suffix in suffix_part.split('+').skip(1) {
        match suffix {
            "cov" => new_coverage = true,
            "max" => new_max_hit = true,
            "cost" => new_cost = true,
            other => return Err(CorpusNameError::UnknownSuffix(other.to_string())),
        }
    }

    Ok(CorpusMeta {
        id: numeric(&fields, "id")?,
        cost: numeric(&fields, "cost")?,
        hotspot: numeric(&fields, "hs")?,
        hnb: numeric(&fields, "hnb")?,
        iteration: numeric(&fields, "exec")?,
        len: numeric(&fields, "len")?,
        tokens_used: numeric(&fields, "tu")?,
        created_ms: numeric(&fields, "crtime")?,
        elapsed_ms: numeric(&fields, "dur")?,
        new_coverage,
        new_max_hit,
        new_cost,
    })
}

/// Writes each interesting input to its own file under a directory.
pub struct CorpusStore {
    dir: PathBuf,
    next_id: u64,
}

impl CorpusStore {
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        // Saved inputs are numbered from 1.
        Ok(Self { dir, next_id: 1 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn saved(&self) -> u64 {
        self.next_id - 1
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl CorpusSink for CorpusStore {
    fn record(&mut self, entry: &Interesting<'_>) -> io::Result<()> {
        let name = entry_name(self.next_id, entry, Self::now_ms());
        let path = self.dir.join(&name);
        fs::write(&path, entry.input.as_bytes())?;
        debug!(name = %name, "saved corpus entry");
        self.next_id += 1;
        Ok(())
    }
}
