use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::Instant;

use rmqttc_conf::ReconnectOptions;

/// Timing of automatic reconnect attempts after an unplanned disconnect.
pub struct ReconnectScheduler {
    enable: bool,
    min_delay: Duration,
    max_delay: Duration,
    backoff: ExponentialBackoff,
    attempts: usize,
    pending: Option<Instant>,
}

impl ReconnectScheduler {
    pub fn new(cfg: &ReconnectOptions) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(cfg.min_delay)
            .with_max_interval(cfg.max_delay)
            .with_multiplier(cfg.multiplier)
            .with_randomization_factor(cfg.jitter)
            .with_max_elapsed_time(None)
            .build();
        Self {
            enable: cfg.enable,
            min_delay: cfg.min_delay,
            max_delay: cfg.max_delay,
            backoff,
            attempts: 0,
            pending: None,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enable
    }

    /// Arms the next attempt, `None` when reconnecting is disabled.
    pub fn schedule(&mut self) -> Option<Duration> {
        if !self.enable {
            return None;
        }
        let delay = self.backoff.next_backoff().unwrap_or(self.max_delay).clamp(self.min_delay, self.max_delay);
        self.attempts += 1;
        self.pending = Some(Instant::now() + delay);
        log::debug!("reconnect attempt {} scheduled in {:?}", self.attempts, delay);
        Some(delay)
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Consumes the armed deadline once its timer fired.
    #[inline]
    pub fn fire(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Drops a scheduled attempt; true if one was pending.
    #[inline]
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Back to the minimum delay after a successful connect.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempts = 0;
        self.pending = None;
    }

    #[inline]
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
