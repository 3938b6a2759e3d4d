//! Bounded output draining.
//!
//! A drain collects whatever a source produces within a time budget. Output
//! usually arrives in bursts (a prompt, a command's stdout), so once something
//! has been read a short quiet period without new data ends the drain early.
//! A source that never produces anything is waited on until the deadline; a
//! closed source ends the drain immediately.
//!
//! The drain never blocks past `timeout + quiet_period`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

/// Something that yields chunks of terminal output.
#[async_trait]
pub trait OutputSource: Send {
    /// Wait for the next chunk. `None` once the source is closed.
    ///
    /// Must be cancel-safe: the drainer drops the future when a wait times out.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

#[async_trait]
impl OutputSource for mpsc::UnboundedReceiver<Vec<u8>> {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.recv().await
    }
}

/// Timing parameters for a single drain.
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    /// Overall deadline; a drain may overrun it by at most one quiet period.
    pub timeout: Duration,
    /// Longest single wait for the next chunk.
    pub poll_interval: Duration,
    /// Grace wait after a silent poll once output has been seen.
    pub quiet_period: Duration,
}

impl DrainOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(100),
            quiet_period: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }
}

/// Result of a drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    /// Decoded output; invalid UTF-8 is replaced with U+FFFD.
    pub text: String,
    /// The source reported end of stream.
    pub closed: bool,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Read everything `source` produces within the budget described by `options`.
pub async fn drain<S>(source: &mut S, options: DrainOptions) -> Drained
where
    S: OutputSource + ?Sized,
{
    let deadline = Instant::now() + options.timeout;
    let mut bytes: Vec<u8> = Vec::new();
    let mut closed = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let slice = options.poll_interval.min(deadline - now);

        match timeout(slice, source.next_chunk()).await {
            Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
            Ok(None) => {
                closed = true;
                break;
            }
            Err(_) if bytes.is_empty() => continue,
            Err(_) => match timeout(options.quiet_period, source.next_chunk()).await {
                Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            },
        }
    }

    // Decoded once so multi-byte characters split across chunks survive.
    Drained {
        text: String::from_utf8_lossy(&bytes).into_owned(),
        closed,
    }
}
