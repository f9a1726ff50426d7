//! `OutputSink`: the terminal write operation a buffered output drains into.

use crate::error::WriteError;

/// A terminal write destination. Implementations must be safe to call from
/// the flusher thread without holding any `Buffer`/Queue lock — the
/// `BufferedOutput` flush loop pops a chunk, releases the buffer entirely,
/// and only then calls `write`.
pub trait OutputSink: Send + Sync {
    fn write(&self, bytes: &[u8]) -> Result<(), WriteError>;

    fn name(&self) -> &str {
        "sink"
    }
}

/// Writes chunk bytes to stdout, one line per call. Useful for the demo
/// binary and for tests that want to eyeball output.
pub struct StdoutSink {
    verbose: bool,
}

impl StdoutSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl OutputSink for StdoutSink {
    fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        if self.verbose {
            println!("--- chunk ({} bytes) ---", bytes.len());
        }
        println!("{}", String::from_utf8_lossy(bytes));
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Discards every chunk. Used for load testing the buffer/flusher path
/// without sink overhead.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&self, _bytes: &[u8]) -> Result<(), WriteError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Collects every chunk it's given, for assertions.
    #[derive(Default)]
    pub struct CollectingSink {
        pub writes: Mutex<Vec<Vec<u8>>>,
    }

    impl OutputSink for CollectingSink {
        fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    /// Fails the first `failures` writes with a transient error, then
    /// succeeds.
    pub struct FailingSink {
        pub failures_remaining: AtomicU32,
        pub write_count: AtomicU32,
        pub writes: Mutex<Vec<Vec<u8>>>,
    }

    impl FailingSink {
        pub fn new(failures: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(failures),
                write_count: AtomicU32::new(0),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl OutputSink for FailingSink {
        fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
            self.write_count.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(WriteError::Transient("simulated failure".to_string()));
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    /// Always fails fatally; used to exercise the dead-output path.
    #[derive(Default)]
    pub struct AlwaysFatalSink;

    impl OutputSink for AlwaysFatalSink {
        fn write(&self, _bytes: &[u8]) -> Result<(), WriteError> {
            Err(WriteError::Fatal("permanently broken".to_string()))
        }
    }
}
