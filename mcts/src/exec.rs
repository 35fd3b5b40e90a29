//! Target-program execution interface.
//!
//! The search never observes the target directly; it hands a candidate input
//! to an [`Executor`] and gets cost and coverage feedback back. Interesting
//! inputs flow out through a [`CorpusSink`].

use std::io;

use thiserror::Error;

/// Errors from the execution collaborator.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no connection to the target runner")]
    NotConnected,

    #[error("input of {len} bytes exceeds the protocol maximum of {max}")]
    InputTooLong { len: usize, max: usize },

    #[error("i/o error talking to the target runner: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response from the target runner: {0}")]
    Protocol(String),
}

/// Whether a run counts toward the target's max-hit bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Normal,
    Warmup,
}

/// Feedback from one execution of the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFeedback {
    /// Total execution cost (edge count or comparable counter).
    pub cost: u64,
    /// Coverage news: 0 none, 1 a known edge changed hit-count bucket,
    /// 2 a never-seen edge was hit. 1 and 2 are treated alike upstream.
    pub hnb: u8,
    /// Some edge's hit count exceeded its previous maximum.
    pub hnm: bool,
    /// Hit count of the most-hit edge.
    pub hotspot: u32,
}

impl RunFeedback {
    pub fn coverage_news(&self) -> bool {
        self.hnb != 0 || self.hnm
    }
}

/// The execution collaborator. Implementations run the instrumented target
/// over some transport; tests use an in-process stand-in.
pub trait Executor {
    fn run_input(&mut self, input: &str, kind: RunKind) -> Result<RunFeedback, ExecutorError>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// One interesting input headed for the corpus.
#[derive(Debug, Clone)]
pub struct Interesting<'a> {
    pub input: &'a str,
    pub cost: u64,
    pub hotspot: u32,
    pub hnb: u8,
    /// Driver iteration that produced the input.
    pub iteration: u64,
    pub tokens_used: u32,
    /// Milliseconds since the search started.
    pub elapsed_ms: u64,
    pub new_coverage: bool,
    pub new_max_hit: bool,
    pub new_cost: bool,
}

/// Where interesting inputs go. The driver does not care how they are kept.
pub trait CorpusSink {
    fn record(&mut self, entry: &Interesting<'_>) -> io::Result<()>;
}

/// Discards everything. For tests and dry runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl CorpusSink for NullSink {
    fn record(&mut self, _entry: &Interesting<'_>) -> io::Result<()> {
        Ok(())
    }
}
