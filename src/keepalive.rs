//! Liveness settings shared by every duplex connection.
//!
//! gRPC connections rely on HTTP/2 PING frames configured here; WebSocket
//! connections drive their own ping ticker and read deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tonic::transport::{Endpoint, Server};

use crate::config::KeepaliveConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeepaliveError {
    #[error("peer silent for longer than {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

impl KeepaliveConfig {
    /// How long a sent ping may stay unanswered.
    pub fn ack_timeout(&self) -> Duration {
        self.pong_wait
            .checked_sub(self.ping_period)
            .filter(|d| !d.is_zero())
            .unwrap_or(self.write_wait)
    }
}

/// gRPC server builder with HTTP/2 and TCP keepalive enabled.
pub fn server_builder(cfg: &KeepaliveConfig) -> Server {
    Server::builder()
        .http2_keepalive_interval(Some(cfg.ping_period))
        .http2_keepalive_timeout(Some(cfg.ack_timeout()))
        .tcp_keepalive(Some(cfg.ping_period))
}

/// Client endpoint that pings the server even while no call is active.
pub fn client_endpoint(
    addr: &str,
    cfg: &KeepaliveConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    Ok(Endpoint::from_shared(addr.to_string())?
        .connect_timeout(cfg.write_wait)
        .http2_keep_alive_interval(cfg.ping_period)
        .keep_alive_timeout(cfg.ack_timeout())
        .keep_alive_while_idle(true)
        .tcp_keepalive(Some(cfg.ping_period)))
}

/// Periodic heartbeat. The first tick fires one period after creation.
pub struct Heartbeat {
    interval: Interval,
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Deadline for inbound traffic, pushed back whenever the peer is heard from.
pub struct ReadDeadline {
    wait: Duration,
    at: Instant,
}

impl ReadDeadline {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            at: Instant::now() + wait,
        }
    }

    pub fn reset(&mut self) {
        self.at = Instant::now() + self.wait;
    }

    /// Await `read`, failing once the deadline passes.
    pub async fn read<F: Future>(&self, read: F) -> Result<F::Output, KeepaliveError> {
        tokio::time::timeout_at(self.at, read)
            .await
            .map_err(|_| KeepaliveError::ReadTimeout(self.wait))
    }
}

/// Bound a single outbound write.
pub async fn write_within<F, T, E>(wait: Duration, write: F) -> Result<Result<T, E>, KeepaliveError>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(wait, write)
        .await
        .map_err(|_| KeepaliveError::WriteTimeout(wait))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_timeout_is_gap_between_ping_and_deadline() {
        let cfg = KeepaliveConfig::default();
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(10));

        let odd = KeepaliveConfig {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(30),
            write_wait: Duration::from_secs(5),
        };
        assert_eq!(odd.ack_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn client_endpoint_rejects_bad_uri() {
        let cfg = KeepaliveConfig::default();
        assert!(client_endpoint("http://127.0.0.1:5081", &cfg).is_ok());
        assert!(client_endpoint("not a uri", &cfg).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_waits_one_period() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(Duration::from_secs(50));
        hb.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(50));
        hb.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_expires_without_traffic() {
        let deadline = ReadDeadline::new(Duration::from_secs(60));
        let res = deadline.read(std::future::pending::<()>()).await;
        assert_eq!(res, Err(KeepaliveError::ReadTimeout(Duration::from_secs(60))));
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_reset_extends() {
        let mut deadline = ReadDeadline::new(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(59)).await;
        deadline.reset();
        let res = deadline
            .read(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out() {
        let res = write_within(Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(11)).await;
            Ok::<_, ()>(())
        })
        .await;
        assert_eq!(res, Err(KeepaliveError::WriteTimeout(Duration::from_secs(10))));
    }
}
