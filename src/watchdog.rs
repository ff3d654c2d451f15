use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A re-armable deadline for the operation a connection is currently waiting for. It is either
///  armed for a specific point in time or disarmed ('never expires').
///
/// Connections supervise two deadlines with a single watchdog: the stall deadline (renewed with
///  every bit of progress) and the response deadline (fixed per exchange). After every
///  progress event, the watchdog is armed for whichever of the two comes first.
#[derive(Debug, Default)]
pub struct Watchdog {
    expires_at: Option<Instant>,
}

impl Watchdog {
    pub fn new() -> Watchdog {
        Watchdog { expires_at: None }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn expire_from_now(&mut self, timeout: Duration) {
        self.expires_at = Some(deadline_after(Instant::now(), timeout));
    }

    /// Arms the watchdog for `min(response_deadline, now + stall_timeout)`
    pub fn expire_at_stall_or_deadline(&mut self, response_deadline: Instant, stall_timeout: Duration) {
        let stall_deadline = deadline_after(Instant::now(), stall_timeout);
        self.expires_at = Some(response_deadline.min(stall_deadline));
    }

    pub fn disarm(&mut self) {
        self.expires_at = None;
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Instant::now(),
            None => false,
        }
    }

    /// Completes once the watchdog is expired; never completes while it is disarmed
    pub async fn expired(&self) {
        let Some(at) = self.expires_at else {
            return std::future::pending().await;
        };

        loop {
            sleep_until(at).await;
            if self.is_expired() {
                return;
            }
        }
    }
}

/// `now + timeout`, saturating at a point in time that is far enough in the future to be
///  irrelevant
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}
