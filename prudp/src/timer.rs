//! Retransmit timer management.
//!
//! Reliable delivery requires that unacknowledged packets are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`TimerConfig`]: the fixed retransmit timeout and the handshake deadline.
//! - [`Scheduler`] / [`Cancel`]: the timer facility a
//!   [`crate::connection::Connection`] is written against: schedule a fire
//!   for a sequence id, get back a handle, cancel the handle.
//! - [`TokioScheduler`] / [`TimerHandle`]: the runtime implementation.  Each
//!   timer is a spawned task that sleeps and then posts an event into the
//!   owning connection's inbox, so a fire is handled like any other event.
//!
//! There is no RTT estimation and no back-off: every (re)transmission arms
//! the same timeout.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Retransmit timeout used when none is configured.
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an admitted connection may stay CONNECTING.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Delay between a transmission and its retransmission.
    pub retransmit_timeout: Duration,
    /// A server-side connection still CONNECTING after this long is
    /// destroyed.
    pub handshake_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// A pending timer that can be cancelled.
pub trait Cancel {
    fn cancel(&self);
}

/// Arms retransmit timers keyed by sequence id.
pub trait Scheduler {
    type Handle: Cancel;

    /// Fire for `sequence_id` once `after` has elapsed.
    fn schedule(&mut self, after: Duration, sequence_id: u16) -> Self::Handle;
}

/// Handle to a spawned timer task.
///
/// Cancelling, or dropping the handle, aborts the task so a disposed
/// connection never sees a late fire.
#[derive(Debug)]
pub struct TimerHandle(AbortHandle);

impl Cancel for TimerHandle {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Tokio-backed [`Scheduler`] that delivers fires into an mpsc inbox.
pub struct TokioScheduler<E> {
    inbox: mpsc::UnboundedSender<E>,
    on_fire: fn(u16) -> E,
}

impl<E> TokioScheduler<E> {
    /// `on_fire` turns the sequence id into the inbox's event type.
    pub fn new(inbox: mpsc::UnboundedSender<E>, on_fire: fn(u16) -> E) -> Self {
        Self { inbox, on_fire }
    }
}

impl<E: Send + 'static> Scheduler for TokioScheduler<E> {
    type Handle = TimerHandle;

    fn schedule(&mut self, after: Duration, sequence_id: u16) -> TimerHandle {
        let inbox = self.inbox.clone();
        let event = (self.on_fire)(sequence_id);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The inbox is gone once the connection has shut down.
            let _ = inbox.send(event);
        });
        TimerHandle(task.abort_handle())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Fired(u16);

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx, Fired);

        let _handle = scheduler.schedule(Duration::from_secs(5), 7);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(Fired(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx, Fired);

        let handle = scheduler.schedule(Duration::from_secs(1), 3);
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx, Fired);

        drop(scheduler.schedule(Duration::from_secs(1), 3));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn default_timeouts() {
        let config = TimerConfig::default();
        assert_eq!(config.retransmit_timeout, Duration::from_secs(5));
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }
}
