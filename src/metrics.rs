//! Lightweight counters for the session.
//!
//! Uses atomic counters for lock-free instrumentation. Renders in Prometheus
//! text exposition format so the embedding layer can dump them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Session-wide counters shared by the signaling channel, agent pool and
/// session controller.
pub struct Metrics {
    /// Signaling messages written to the server (counter)
    pub signals_sent: AtomicU64,
    /// Signaling messages parsed from the server (counter)
    pub signals_received: AtomicU64,
    /// Sends refused or failed on the signaling channel (counter)
    pub signal_send_failures: AtomicU64,
    /// Framed segments that failed to parse (counter)
    pub parse_failures: AtomicU64,
    /// Successful reconnects after a transport failure (counter)
    pub reconnects: AtomicU64,
    /// Advertisements merged into the directory (counter)
    pub ads_merged: AtomicU64,
    /// Game datagrams sent to peers (counter)
    pub datagrams_sent: AtomicU64,
    /// Game datagrams received from peers (counter)
    pub datagrams_received: AtomicU64,
    /// Inbound packets queued for the game layer (counter)
    pub packets_queued: AtomicU64,
    /// Inbound packets discarded for staleness (counter)
    pub packets_dropped_stale: AtomicU64,
    /// Inbound packets evicted because the queue was full (counter)
    pub packets_dropped_overflow: AtomicU64,
    /// Session start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            signals_sent: AtomicU64::new(0),
            signals_received: AtomicU64::new(0),
            signal_send_failures: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            ads_merged: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            packets_queued: AtomicU64::new(0),
            packets_dropped_stale: AtomicU64::new(0),
            packets_dropped_overflow: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 11] = [
            ("lobby_signals_sent_total", "Signaling messages sent to the server", &self.signals_sent),
            ("lobby_signals_received_total", "Signaling messages received from the server", &self.signals_received),
            ("lobby_signal_send_failures_total", "Signaling sends refused or failed", &self.signal_send_failures),
            ("lobby_parse_failures_total", "Signaling segments that failed to parse", &self.parse_failures),
            ("lobby_reconnects_total", "Reconnects to the rendezvous server", &self.reconnects),
            ("lobby_ads_merged_total", "Advertisements merged into the directory", &self.ads_merged),
            ("lobby_datagrams_sent_total", "Game datagrams sent to peers", &self.datagrams_sent),
            ("lobby_datagrams_received_total", "Game datagrams received from peers", &self.datagrams_received),
            ("lobby_packets_queued_total", "Inbound packets queued for the game", &self.packets_queued),
            ("lobby_packets_dropped_stale_total", "Inbound packets dropped as stale", &self.packets_dropped_stale),
            ("lobby_packets_dropped_overflow_total", "Inbound packets evicted from a full queue", &self.packets_dropped_overflow),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP lobby_uptime_seconds Session uptime in seconds\n\
             # TYPE lobby_uptime_seconds gauge\n\
             lobby_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new_all_zero() {
        let m = Metrics::new();
        assert_eq!(Metrics::get(&m.signals_sent), 0);
        assert_eq!(Metrics::get(&m.parse_failures), 0);
        assert_eq!(Metrics::get(&m.packets_dropped_stale), 0);
    }

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        Metrics::inc(&m.reconnects);
        Metrics::inc(&m.ads_merged);
        Metrics::inc(&m.ads_merged);

        let output = m.render();
        assert!(output.contains("# TYPE lobby_reconnects_total counter"));
        assert!(output.contains("lobby_reconnects_total 1\n"));
        assert!(output.contains("lobby_ads_merged_total 2\n"));
        assert!(output.contains("# TYPE lobby_uptime_seconds gauge"));
    }
}
