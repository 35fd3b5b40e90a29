//! Transport and persistence around the search: the TCP client for the
//! instrumented target, a deterministic in-process stand-in, and the
//! on-disk corpus of interesting inputs.

pub mod corpus;
pub mod fake;
pub mod protocol;

pub use corpus::{parse_corpus_name, CorpusMeta, CorpusNameError, CorpusStore};
pub use fake::FakeExecutor;
pub use protocol::{TcpExecutor, DEFAULT_ADDR, FRAME_SIZE, MAX_INPUT_SIZE};
