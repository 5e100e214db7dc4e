use super::control::ControlClient;
use super::Error;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Add;
use std::time::Duration;
use tokio::net::UdpSocket;
use uuid::Uuid;

/// Uplink packet-loss tally as acknowledged by the remote sampler.
///
/// loss = 1 − (sent − dup) / (max + 1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PLoss {
    /// Packets the server accepted.
    pub sent: i64,
    /// Duplicate sequence numbers among them.
    pub dup: i64,
    /// Highest sequence number observed.
    pub max: i64,
}

impl PLoss {
    /// Loss fraction in [0, 1]. `None` when the server acknowledged nothing;
    /// a middlebox dropping the whole UDP stream and a non-compliant server
    /// are indistinguishable here, so no figure is reported.
    pub fn loss(&self) -> Option<f64> {
        if self.sent == 0 {
            return None;
        }
        Some(1.0 - (self.sent - self.dup) as f64 / (self.max + 1) as f64)
    }

    pub fn loss_percent(&self) -> Option<f64> {
        self.loss().map(|l| l * 100.0)
    }
}

impl Add for PLoss {
    type Output = PLoss;

    fn add(self, rhs: PLoss) -> PLoss {
        PLoss {
            sent: self.sent + rhs.sent,
            dup: self.dup + rhs.dup,
            max: self.max + rhs.max,
        }
    }
}

impl fmt::Display for PLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loss_percent() {
            None => write!(f, "Packet Loss: N/A"),
            Some(pct) => write!(
                f,
                "Packet Loss: {:.2}% (Sent: {}/Dup: {}/Max: {})",
                pct, self.sent, self.dup, self.max
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketLossOptions {
    /// Total time spent injecting and sampling.
    pub sampling_duration: Duration,
    /// How often the server is polled with PLOSS.
    pub remote_sampling_interval: Duration,
    /// Cadence of the UDP injection, ~15 packets/s.
    pub packet_sending_interval: Duration,
    /// Deadline for the TCP control handshake.
    pub connect_timeout: Duration,
    /// Local address to bind the sockets to.
    pub source: Option<SocketAddr>,
}

impl Default for PacketLossOptions {
    fn default() -> Self {
        Self {
            sampling_duration: Duration::from_secs(30),
            remote_sampling_interval: Duration::from_secs(1),
            packet_sending_interval: Duration::from_millis(67),
            connect_timeout: Duration::from_secs(5),
            source: None,
        }
    }
}

/// Aborts the UDP sender when the analyzer future is dropped, whether it
/// finished or was cancelled from outside.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Measures uplink packet loss against a host that speaks both the TCP
/// control protocol (sampling channel) and the UDP loss protocol (sending
/// channel). Numbered packets go out at a fixed cadence while the control
/// channel periodically asks the server what arrived.
pub struct PacketLossAnalyzer {
    options: PacketLossOptions,
}

impl PacketLossAnalyzer {
    pub fn new(options: PacketLossOptions) -> Self {
        Self { options }
    }

    /// Run the analysis against `host`, invoking `callback` with every tally
    /// the server reports. Hosts that refuse either channel surface
    /// [`Error::Unsupported`]; callers usually downgrade that to an absent
    /// result instead of failing the whole run.
    pub async fn run(
        &self,
        host: &str,
        mut callback: impl FnMut(&PLoss),
    ) -> Result<(), Error> {
        let addr = tokio::net::lookup_host(host)
            .await
            .map_err(|_| Error::Unsupported)?
            .next()
            .ok_or(Error::Unsupported)?;

        let mut sampler = ControlClient::connect(host, self.options.connect_timeout, self.options.source)
            .await
            .map_err(|_| Error::Unsupported)?;

        let bind = self.options.source.unwrap_or_else(|| {
            if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            }
        });
        let socket = UdpSocket::bind(bind).await.map_err(|_| Error::Unsupported)?;
        socket.connect(addr).await.map_err(|_| Error::Unsupported)?;

        let uuid = Uuid::new_v4().to_string();
        sampler
            .init_packet_loss(&uuid)
            .await
            .map_err(|_| Error::Unsupported)?;

        // Nonce is chosen once per session, ten decimal digits.
        let nonce: u64 = rand::thread_rng().gen_range(0..10_000_000_000);
        let send_interval = self.options.packet_sending_interval;
        let sender = AbortOnDrop(tokio::spawn(async move {
            let mut seq: u64 = 0;
            let mut ticker = tokio::time::interval(send_interval);
            loop {
                ticker.tick().await;
                let payload = format!("LOSS {nonce} {seq} {uuid}\n");
                // send failures are expected when a middlebox eats the
                // stream; the sampler side decides what that means
                let _ = socket.send(payload.as_bytes()).await;
                seq += 1;
            }
        }));

        let deadline = tokio::time::sleep(self.options.sampling_duration);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.options.remote_sampling_interval,
            self.options.remote_sampling_interval,
        );

        let result = loop {
            tokio::select! {
                _ = &mut deadline => break Ok(()),
                _ = ticker.tick() => {
                    match sampler.packet_loss().await {
                        Ok(Some(tally)) => callback(&tally),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        drop(sender);
        sampler.quit().await;
        result
    }

    /// Analyse several hosts and aggregate their tallies: `sent`, `dup` and
    /// `max` are summed across hosts before the loss formula applies. Hosts
    /// that fail or do not support the protocol contribute nothing.
    pub async fn run_multi(&self, hosts: &[String]) -> Result<PLoss, Error> {
        let runs = hosts.iter().map(|host| async move {
            let mut last: Option<PLoss> = None;
            match self.run(host, |tally| last = Some(*tally)).await {
                Ok(()) => last,
                Err(_) => None,
            }
        });
        let tallies = join_all(runs).await;
        Ok(tallies
            .into_iter()
            .flatten()
            .fold(PLoss::default(), |acc, t| acc + t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_formula() {
        let p = PLoss { sent: 135, dup: 0, max: 149 };
        let loss = p.loss().unwrap();
        assert!((loss - 0.1).abs() < 1e-9, "loss={loss}");
        assert_eq!(format!("{p}"), "Packet Loss: 10.00% (Sent: 135/Dup: 0/Max: 149)");
    }

    #[test]
    fn zero_sent_is_not_available() {
        let p = PLoss { sent: 0, dup: 0, max: 10 };
        assert!(p.loss().is_none());
        assert_eq!(format!("{p}"), "Packet Loss: N/A");
    }

    #[test]
    fn tallies_aggregate_by_field() {
        let a = PLoss { sent: 100, dup: 2, max: 109 };
        let b = PLoss { sent: 50, dup: 0, max: 54 };
        let sum = a + b;
        assert_eq!(sum, PLoss { sent: 150, dup: 2, max: 163 });
        // invariant: sent - dup <= max + 1
        assert!(sum.sent - sum.dup <= sum.max + 1);
    }

    #[test]
    fn duplicates_raise_the_loss() {
        let clean = PLoss { sent: 150, dup: 0, max: 149 };
        let dirty = PLoss { sent: 150, dup: 10, max: 149 };
        assert!((clean.loss().unwrap() - 0.0).abs() < 1e-9);
        assert!(dirty.loss().unwrap() > clean.loss().unwrap());
    }
}
