//! TCP client for the instrumented target's runner server.
//!
//! Both directions use the same fixed 512-byte frame, matching the C
//! struct on the server side (little-endian, 4-byte alignment):
//!
//! ```text
//! offset  field     type
//! 0       exec_cost u32
//! 4       hnm       u8, 3 pad bytes
//! 8       hs        u32
//! 12      hnb       u32
//! 16      run_type  [u8; 4]   "nml\0" or "wup\0"
//! 20      input     [u8; 490] NUL-padded
//! 510     2 pad bytes
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;

use tracing::{debug, info};

use mcts::{Executor, ExecutorError, RunFeedback, RunKind};

/// Frame capacity for the input; fixed by the server's buffer size.
pub const MAX_INPUT_SIZE: usize = 490;
pub const FRAME_SIZE: usize = 512;

const OFF_COST: usize = 0;
const OFF_HNM: usize = 4;
const OFF_HS: usize = 8;
const OFF_HNB: usize = 12;
const OFF_RUN_TYPE: usize = 16;
const OFF_INPUT: usize = 20;

pub const DEFAULT_ADDR: &str = "127.0.0.1:2300";

fn run_type_bytes(kind: RunKind) -> [u8; 4] {
    match kind {
        RunKind::Normal => *b"nml\0",
        RunKind::Warmup => *b"wup\0",
    }
}

/// Build an outgoing frame. The cost/coverage fields are zero on the way
/// out; the server fills them on the way back.
pub(crate) fn encode_frame(input: &[u8], kind: RunKind) -> Result<[u8; FRAME_SIZE], ExecutorError> {
    if input.len() > MAX_INPUT_SIZE {
        return Err(ExecutorError::InputTooLong {
            len: input.len(),
            max: MAX_INPUT_SIZE,
        });
    }
    let mut frame = [0u8; FRAME_SIZE];
    frame[OFF_RUN_TYPE..OFF_RUN_TYPE + 4].copy_from_slice(&run_type_bytes(kind));
    frame[OFF_INPUT..OFF_INPUT + input.len()].copy_from_slice(input);
    Ok(frame)
}

pub(crate) fn decode_frame(frame: &[u8; FRAME_SIZE]) -> Result<RunFeedback, ExecutorError> {
    let u32_at = |off: usize| u32::from_le_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]]);
    let hnb_raw = u32_at(OFF_HNB);
    if hnb_raw > 2 {
        return Err(ExecutorError::Protocol(format!(
            "hnb value {hnb_raw} out of range"
        )));
    }
    Ok(RunFeedback {
        cost: u64::from(u32_at(OFF_COST)),
        hnb: hnb_raw as u8,
        hnm: frame[OFF_HNM] != 0,
        hotspot: u32_at(OFF_HS),
    })
}

/// Executor backed by a TCP connection to the runner server.
pub struct TcpExecutor {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpExecutor {
    /// Connect immediately; startup wants to know right away whether the
    /// runner is reachable.
    pub fn connect(addr: impl Into<String>) -> Result<Self, ExecutorError> {
        let mut exec = Self {
            addr: addr.into(),
            stream: None,
        };
        exec.open_connection()?;
        Ok(exec)
    }

    pub fn open_connection(&mut self) -> Result<(), ExecutorError> {
        if self.stream.is_some() {
            debug!("connection already open");
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        info!(addr = %self.addr, "connected to target runner");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn close_connection(&mut self) {
        if self.stream.take().is_some() {
            info!("closed connection to target runner");
        }
    }
}

impl Executor for TcpExecutor {
    fn run_input(&mut self, input: &str, kind: RunKind) -> Result<RunFeedback, ExecutorError> {
        let stream = self.stream.as_mut().ok_or(ExecutorError::NotConnected)?;
        let frame = encode_frame(input.as_bytes(), kind)?;
        stream.write_all(&frame)?;
        let mut response = [0u8; FRAME_SIZE];
        stream.read_exact(&mut response)?;
        decode_frame(&response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn outgoing_frames_carry_the_run_type_and_input() {
        let frame = encode_frame(b"abc", RunKind::Warmup).unwrap();
        assert_eq!(&frame[OFF_RUN_TYPE..OFF_RUN_TYPE + 4], b"wup\0");
        assert_eq!(&frame[OFF_INPUT..OFF_INPUT + 3], b"abc");
        assert!(frame[OFF_INPUT + 3..].iter().all(|&b| b == 0));
        assert_eq!(&frame[..OFF_RUN_TYPE], &[0u8; 16]);
    }

    #[test]
    fn oversize_input_is_rejected_before_sending() {
        let big = vec![b'x'; MAX_INPUT_SIZE + 1];
        assert!(matches!(
            encode_frame(&big, RunKind::Normal),
            Err(ExecutorError::InputTooLong { len, max })
                if len == MAX_INPUT_SIZE + 1 && max == MAX_INPUT_SIZE
        ));
        // Exactly at the limit is fine.
        let ok = vec![b'x'; MAX_INPUT_SIZE];
        assert!(encode_frame(&ok, RunKind::Normal).is_ok());
    }

    #[test]
    fn responses_decode_field_by_field() {
        let mut frame = [0u8; FRAME_SIZE];
        frame[OFF_COST..OFF_COST + 4].copy_from_slice(&123_456u32.to_le_bytes());
        frame[OFF_HNM] = 1;
        frame[OFF_HS..OFF_HS + 4].copy_from_slice(&777u32.to_le_bytes());
        frame[OFF_HNB..OFF_HNB + 4].copy_from_slice(&2u32.to_le_bytes());
        let fb = decode_frame(&frame).unwrap();
        assert_eq!(fb.cost, 123_456);
        assert!(fb.hnm);
        assert_eq!(fb.hotspot, 777);
        assert_eq!(fb.hnb, 2);
    }

    #[test]
    fn out_of_range_coverage_flag_is_a_protocol_error() {
        let mut frame = [0u8; FRAME_SIZE];
        frame[OFF_HNB..OFF_HNB + 4].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(ExecutorError::Protocol(_))
        ));
    }

    #[test]
    fn round_trip_against_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; FRAME_SIZE];
            conn.read_exact(&mut request).unwrap();
            assert_eq!(&request[OFF_RUN_TYPE..OFF_RUN_TYPE + 4], b"nml\0");
            assert_eq!(&request[OFF_INPUT..OFF_INPUT + 5], b"hello");

            let mut response = request;
            response[OFF_COST..OFF_COST + 4].copy_from_slice(&42u32.to_le_bytes());
            response[OFF_HNB..OFF_HNB + 4].copy_from_slice(&1u32.to_le_bytes());
            conn.write_all(&response).unwrap();
        });

        let mut exec = TcpExecutor::connect(addr.to_string()).unwrap();
        assert!(exec.is_connected());
        let fb = exec.run_input("hello", RunKind::Normal).unwrap();
        assert_eq!(fb.cost, 42);
        assert_eq!(fb.hnb, 1);
        exec.close_connection();
        assert!(!exec.is_connected());
        assert!(matches!(
            exec.run_input("x", RunKind::Normal),
            Err(ExecutorError::NotConnected)
        ));
        server.join().unwrap();
    }
}
