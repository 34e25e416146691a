//! Console backend for the standard streams.
//!
//! The descriptor layer reads stdin one byte at a time and writes
//! stdout/stderr in bounded chunks; the backend behind those calls is
//! pluggable so tests can script input and capture output.

use std::collections::VecDeque;
use std::sync::Mutex;

pub trait Console: Send + Sync {
    /// Blocks for the next input byte. `None` means end of input.
    fn read_byte(&self) -> Option<u8>;

    /// Writes `buf` to the terminal.
    fn write(&self, buf: &[u8]);
}

/// A console with no input and discarded output.
pub struct NullConsole;

impl Console for NullConsole {
    fn read_byte(&self) -> Option<u8> {
        None
    }

    fn write(&self, _buf: &[u8]) {}
}

/// A scripted console: input comes from a preloaded buffer, output is
/// captured per `write` call so tests can check chunking.
pub struct TestConsole {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<Vec<u8>>>,
}

impl TestConsole {
    pub fn new(input: &[u8]) -> TestConsole {
        TestConsole {
            input: Mutex::new(input.iter().copied().collect()),
            output: Mutex::new(Vec::new()),
        }
    }

    /// Every `write` call observed so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.output.lock().unwrap().clone()
    }

    /// All output bytes, concatenated.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap().concat()
    }
}

impl Console for TestConsole {
    fn read_byte(&self) -> Option<u8> {
        self.input.lock().unwrap().pop_front()
    }

    fn write(&self, buf: &[u8]) {
        self.output.lock().unwrap().push(buf.to_vec());
    }
}
