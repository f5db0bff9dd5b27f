//! Tick sources that drive the daemon's poll loop
//!
//! Production uses [`IntervalTicker`], which wakes every poll interval or as
//! soon as a trigger arrives. Tests drive the loop with [`ManualTicker`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Poll interval elapsed (or first cycle after start)
    Interval,
    /// Someone asked for an immediate poll
    Triggered,
}

#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next cycle. `None` ends the poll loop.
    async fn next_tick(&mut self) -> Option<Tick>;
}

/// Sends "poll now" requests to an [`IntervalTicker`]
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
}

impl TriggerHandle {
    /// Request an immediate poll. Requests arriving while one is queued are coalesced.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Poll trigger already pending");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Poll trigger dropped: poll loop is not running");
                false
            }
        }
    }
}

pub struct IntervalTicker {
    interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    started: bool,
}

impl IntervalTicker {
    pub fn new(interval: Duration) -> (Self, TriggerHandle) {
        let (tx, trigger_rx) = mpsc::channel(1);
        let ticker = Self {
            interval,
            trigger_rx,
            started: false,
        };
        (ticker, TriggerHandle { tx })
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn next_tick(&mut self) -> Option<Tick> {
        if !self.started {
            self.started = true;
            return Some(Tick::Interval);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.interval) => Some(Tick::Interval),
            Some(()) = self.trigger_rx.recv() => Some(Tick::Triggered),
        }
    }
}

/// Ticks on demand; the loop ends once every handle is dropped and queued ticks are consumed
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<Tick>,
}

#[derive(Debug, Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<Tick>,
}

impl ManualTicker {
    pub fn new() -> (Self, ManualTickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTickHandle { tx })
    }
}

impl ManualTickHandle {
    pub fn tick(&self) {
        let _ = self.tx.send(Tick::Triggered);
    }
}

#[async_trait]
impl TickSource for ManualTicker {
    async fn next_tick(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }
}
