//! Readiness poller.
//!
//! The single suspension point of the non-blocking engine: wait until the
//! channel can make progress in one direction, bounded by a per-call
//! timeout.

use std::io;
use std::time::Duration;

use crate::channel::{Channel, Direction};

/// Outcome of one readiness wait.
#[derive(Debug)]
pub enum PollStatus {
    Ready,
    Timeout,
    Error(io::Error),
}

impl PollStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollStatus::Ready)
    }
}

/// Wait until `channel` is ready for `direction`.
///
/// `None` waits indefinitely. The deadline applies to this call only; callers
/// looping over partial reads get a fresh deadline each time.
pub async fn wait_ready<C: Channel + ?Sized>(
    channel: &C,
    direction: Direction,
    timeout: Option<Duration>,
) -> PollStatus {
    let ready = std::future::poll_fn(|cx| channel.poll_ready(cx, direction));

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, ready).await {
            Ok(result) => result,
            Err(_) => return PollStatus::Timeout,
        },
        None => ready.await,
    };

    match result {
        Ok(()) => PollStatus::Ready,
        Err(e) => PollStatus::Error(e),
    }
}
