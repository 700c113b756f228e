//! Keep-alive bookkeeping
//!
//! A PINGREQ goes out once the keep-alive interval passes without any outbound
//! packet. While that ping is unanswered, the connection is declared dead when
//! nothing at all has arrived from the broker for 1.5x the interval, and at
//! least half an interval has passed since the ping itself.
//!
//! While inbound processing is paused the client is not reading, so broker
//! silence cannot be observed. The response deadline is suspended for that
//! time and the paused span is credited back on resume.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Option<Duration>,
    last_sent: Instant,
    last_received: Instant,
    /// Set while a PINGREQ is unanswered
    ping_sent_at: Option<Instant>,
    paused_at: Option<Instant>,
}

impl KeepAlive {
    /// `interval_secs == 0` disables keep-alive.
    pub fn new(interval_secs: u16, now: Instant) -> Self {
        Self {
            interval: (interval_secs > 0).then(|| Duration::from_secs(u64::from(interval_secs))),
            last_sent: now,
            last_received: now,
            ping_sent_at: None,
            paused_at: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Grace period for a PINGRESP, measured from the last inbound packet
    pub fn grace(&self) -> Option<Duration> {
        self.interval.map(|interval| interval.mul_f64(1.5))
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    pub fn on_pingresp(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_sent_at = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Stops the response deadline while inbound bytes are not being read.
    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        let Some(paused_at) = self.paused_at.take() else {
            return;
        };
        let paused_for = now.saturating_duration_since(paused_at);
        self.last_received += paused_for;
        // A ping written during the pause is timed from now
        self.ping_sent_at = self.ping_sent_at.map(|sent_at| {
            if sent_at < paused_at {
                sent_at + paused_for
            } else {
                now
            }
        });
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        let Some(interval) = self.interval else {
            return KeepAliveAction::Idle;
        };
        if self.ping_outstanding() && self.is_paused() {
            return KeepAliveAction::Idle;
        }
        if let Some(deadline) = self.response_deadline() {
            if now >= deadline {
                return KeepAliveAction::TimedOut;
            }
            return KeepAliveAction::Idle;
        }
        if now >= self.last_sent + interval {
            KeepAliveAction::SendPing
        } else {
            KeepAliveAction::Idle
        }
    }

    fn response_deadline(&self) -> Option<Instant> {
        let sent_at = self.ping_sent_at?;
        let interval = self.interval?;
        let grace = self.grace()?;
        Some((self.last_received + grace).max(sent_at + (grace - interval)))
    }

    /// When [`KeepAlive::poll`] next needs to run; `None` when disabled.
    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        if self.ping_outstanding() && self.is_paused() {
            return None;
        }
        Some(
            self.response_deadline()
                .unwrap_or(self.last_sent + interval),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_keep_alive() {
        let now = Instant::now();
        let keep_alive = KeepAlive::new(0, now);
        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(now + Duration::from_secs(3600)),
            KeepAliveAction::Idle
        );
    }

    #[test]
    fn test_ping_after_idle_interval() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(5, start);
        assert_eq!(keep_alive.next_deadline(), Some(start + Duration::from_secs(5)));
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(4999)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(5)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_outbound_traffic_defers_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(5, start);
        keep_alive.on_sent(start + Duration::from_secs(3));
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(5)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(8))
        );
    }

    #[test]
    fn test_unanswered_ping_times_out_after_grace() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(5, start);
        keep_alive.on_ping_sent(start + Duration::from_secs(5));

        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_millis(7500))
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(7499)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(7500)),
            KeepAliveAction::TimedOut
        );
    }

    #[test]
    fn test_pingresp_clears_outstanding_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(5, start);
        keep_alive.on_ping_sent(start + Duration::from_secs(5));
        keep_alive.on_pingresp(start + Duration::from_secs(6));

        assert!(!keep_alive.ping_outstanding());
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(9)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(10)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_ping_after_one_way_traffic_gets_half_an_interval() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(4, start);
        // publishing for a while without hearing from the broker
        keep_alive.on_sent(start + Duration::from_secs(20));
        keep_alive.on_ping_sent(start + Duration::from_secs(24));

        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(26))
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(25_999)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(26)),
            KeepAliveAction::TimedOut
        );
    }

    #[test]
    fn test_paused_inbound_suspends_response_deadline() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(5, start);
        keep_alive.on_ping_sent(start + Duration::from_secs(5));
        keep_alive.pause(start + Duration::from_secs(6));

        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(60)),
            KeepAliveAction::Idle
        );

        // Time spent paused is credited back
        keep_alive.resume(start + Duration::from_secs(60));
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_millis(61_500))
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(61_499)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(61_500)),
            KeepAliveAction::TimedOut
        );
    }

    #[test]
    fn test_pings_still_go_out_while_paused() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(5, start);
        keep_alive.pause(start);

        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(5)),
            KeepAliveAction::SendPing
        );
        keep_alive.on_ping_sent(start + Duration::from_secs(5));
        keep_alive.resume(start + Duration::from_secs(20));
        // Ping written during the pause is timed from the resume
        assert_eq!(
            keep_alive.poll(start + Duration::from_millis(22_499)),
            KeepAliveAction::Idle
        );
    }
}
