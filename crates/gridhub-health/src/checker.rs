//! Probe logic for worker status endpoints.
//!
//! Performs HTTP probes against a worker's status path with configurable
//! thresholds and exponential backoff between failed checks.

use std::time::Duration;

use tracing::{debug, warn};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The status endpoint returned 2xx.
    Up,
    /// The status endpoint returned non-2xx.
    Down,
    /// The probe could not be executed (connection failure or timeout).
    Unreachable,
}

/// Probe parameters for one worker.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// HTTP path of the worker's status endpoint.
    pub path: String,
    /// Base interval between probes.
    pub interval: Duration,
    /// Timeout per probe.
    pub timeout: Duration,
    /// Consecutive failures before the worker is considered lost.
    pub unreachable_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "/status".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unreachable_threshold: 3,
        }
    }
}

/// Verdict after folding a probe result into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The worker answered; it is (still) reachable.
    Reachable,
    /// Not enough evidence either way yet.
    Pending,
    /// The failure threshold was crossed; the worker is lost.
    Lost,
}

/// Tracks consecutive probe results for a single worker.
#[derive(Debug)]
pub struct ProbeTracker {
    consecutive_failures: u32,
    unreachable_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl ProbeTracker {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            consecutive_failures: 0,
            unreachable_threshold: config.unreachable_threshold,
            current_backoff: config.interval,
            base_interval: config.interval,
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Fold a probe result in and return the resulting verdict.
    pub fn record(&mut self, result: ProbeResult) -> ProbeVerdict {
        match result {
            ProbeResult::Up => {
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                ProbeVerdict::Reachable
            }
            ProbeResult::Down | ProbeResult::Unreachable => {
                self.consecutive_failures += 1;
                // Double the interval between failed checks, capped.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unreachable_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unreachable_threshold,
                        "probe failure threshold crossed"
                    );
                    ProbeVerdict::Lost
                } else {
                    ProbeVerdict::Pending
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Perform one HTTP probe against a worker's status endpoint.
///
/// Returns `Up` for a 2xx response, `Down` for non-2xx, and `Unreachable`
/// if the connection fails or the timeout elapses.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Unreachable;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "gridhub-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request build failed");
                return ProbeResult::Unreachable;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Up
                } else {
                    debug!(status = %resp.status(), %uri, "probe non-2xx");
                    ProbeResult::Down
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Unreachable
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "probe timed out");
            ProbeResult::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32) -> ProbeConfig {
        ProbeConfig {
            path: "/status".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(100),
            unreachable_threshold: threshold,
        }
    }

    #[test]
    fn tracker_reports_reachable_on_success() {
        let mut tracker = ProbeTracker::new(&fast_config(3));
        assert_eq!(tracker.record(ProbeResult::Up), ProbeVerdict::Reachable);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_pending_below_threshold() {
        let mut tracker = ProbeTracker::new(&fast_config(3));
        assert_eq!(tracker.record(ProbeResult::Down), ProbeVerdict::Pending);
        assert_eq!(
            tracker.record(ProbeResult::Unreachable),
            ProbeVerdict::Pending
        );
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn tracker_lost_at_threshold() {
        let mut tracker = ProbeTracker::new(&fast_config(3));
        tracker.record(ProbeResult::Down);
        tracker.record(ProbeResult::Down);
        assert_eq!(tracker.record(ProbeResult::Down), ProbeVerdict::Lost);
    }

    #[test]
    fn tracker_success_resets_failure_streak() {
        let mut tracker = ProbeTracker::new(&fast_config(3));
        tracker.record(ProbeResult::Down);
        tracker.record(ProbeResult::Down);
        tracker.record(ProbeResult::Up);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record(ProbeResult::Down), ProbeVerdict::Pending);
    }

    #[test]
    fn tracker_backoff_doubles_and_caps() {
        let mut tracker = ProbeTracker::new(&fast_config(100));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        tracker.record(ProbeResult::Unreachable);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Unreachable);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(ProbeResult::Unreachable);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));
    }

    #[test]
    fn tracker_backoff_resets_on_success() {
        let mut tracker = ProbeTracker::new(&fast_config(100));
        tracker.record(ProbeResult::Unreachable);
        tracker.record(ProbeResult::Unreachable);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        tracker.record(ProbeResult::Up);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn probe_to_closed_port_is_unreachable() {
        // Port 1 won't be listening.
        let result = http_probe("127.0.0.1:1", "/status", Duration::from_millis(100)).await;
        assert_eq!(result, ProbeResult::Unreachable);
    }
}
