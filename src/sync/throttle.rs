//! Bandwidth throttling for sync transfers.
//!
//! A fixed one-second window: the reader counts bytes handed out in the
//! current window and, once the quota is spent, sleeps until the window
//! ends. Bursts across a window boundary are allowed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

const WINDOW: Duration = Duration::from_secs(1);

/// Bandwidth limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    /// Bytes per second limit.
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    /// Create a new bandwidth limit.
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self { bytes_per_second: 0 }
    }

    /// Check if there's a limit.
    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }

    /// Format as human-readable string.
    pub fn display(&self) -> String {
        if !self.is_limited() {
            return "unlimited".to_string();
        }

        let bps = self.bytes_per_second;
        if bps >= 1_000_000_000 {
            format!("{:.1} GB/s", bps as f64 / 1_000_000_000.0)
        } else if bps >= 1_000_000 {
            format!("{:.1} MB/s", bps as f64 / 1_000_000.0)
        } else if bps >= 1_000 {
            format!("{:.1} KB/s", bps as f64 / 1_000.0)
        } else {
            format!("{} B/s", bps)
        }
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Read wrapper enforcing a bytes-per-second ceiling.
pub struct ThrottledReader<R> {
    inner: R,
    limit: BandwidthLimit,
    window_start: Instant,
    window_bytes: u64,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, limit: BandwidthLimit) -> Self {
        Self {
            inner,
            limit,
            window_start: Instant::now(),
            window_bytes: 0,
            sleep: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.limit.is_limited() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let quota = this.limit.bytes_per_second;

        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                this.sleep = None;
                this.window_start = Instant::now();
                this.window_bytes = 0;
            }

            let now = Instant::now();
            if now.duration_since(this.window_start) >= WINDOW {
                this.window_start = now;
                this.window_bytes = 0;
            }

            if this.window_bytes < quota {
                break;
            }
            this.sleep = Some(Box::pin(sleep_until(this.window_start + WINDOW)));
        }

        let allowed = (quota - this.window_bytes).min(buf.remaining() as u64) as usize;
        if allowed == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = {
            let unfilled = buf.initialize_unfilled_to(allowed);
            let mut limited = ReadBuf::new(unfilled);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        buf.advance(n);
        this.window_bytes += n as u64;

        Poll::Ready(Ok(()))
    }
}
