pub mod balancer;
pub mod bind;
pub mod chunk;
pub mod control;
pub mod counter;
pub mod direction;
pub mod dns;
pub mod latency;
pub mod ploss;

use crate::catalog::Server;
use crate::model::{ClientConfig, PingMode};
use crate::stats::latency_stats;
use chunk::Chunk;
use direction::{DirectionKind, RateCallback, TestDirection, CONNECT_TIMEOUT};
use futures::FutureExt;
use latency::PingOptions;
use ploss::{PLoss, PacketLossAnalyzer, PacketLossOptions};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::sync::watch;

/// Typed failures of the measurement engine. Connect timeouts are the only
/// fatal condition on the network paths; everything else either degrades a
/// single request or downgrades a phase to "not available".
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("unsupported protocol")]
    Unsupported,
    #[error("multiple calls to the same chunk handler are not allowed")]
    DuplicateCall,
    #[error("no available servers")]
    NoAvailableServers,
    #[error("incorrect echo data")]
    EchoData,
    #[error("short write to transport")]
    ShortWrite,
    #[error("invalid source address: {0}")]
    InvalidSource(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pre-tabulated download payload sizes (pixel side of `random<N>x<N>.jpg`,
/// roughly 2·N² bytes each).
pub const DL_SIZES: [u32; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];
/// Pre-tabulated upload size classes in kB.
pub const UL_SIZES_KB: [u64; 10] = [100, 300, 500, 800, 1000, 1500, 2500, 3000, 3500, 4000];

const DEFAULT_DL_WEIGHT: usize = 3;
const DEFAULT_UL_WEIGHT: usize = 4;
// saving mode skips the high-weight chunk sizes
const SAVING_DL_WEIGHT: usize = 1;
const SAVING_UL_WEIGHT: usize = 1;

/// Outer deadline for one direction call, comfortably above the direction's
/// own 15 s sampling window.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Declared upload body length for a weight class: ten requests' worth of
/// the kB table entry.
fn upload_len(weight: usize) -> u64 {
    UL_SIZES_KB[weight] * 1000 * 10
}

/// The speedtest client: owns the configured HTTP client and composes the
/// latency probers, the throughput directions and the packet-loss analyzer.
/// Each client is fully self-contained; tests construct as many isolated
/// instances as they like.
pub struct Speedtest {
    config: ClientConfig,
    http: reqwest::Client,
    source_ip: Option<IpAddr>,
    cancel: watch::Sender<bool>,
}

impl Speedtest {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let source_ip = match &config.source {
            Some(source) => Some(bind::resolve_source(source)?),
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(15));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(ip) = source_ip {
            builder = builder.local_address(ip);
            if config.dns_bind_source {
                builder = builder.dns_resolver(Arc::new(dns::SourceBoundResolver::new(ip)));
            }
        }
        let http = builder.build()?;

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            http,
            source_ip,
            cancel,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Cancel every phase currently running on this client. One-shot;
    /// typically wired to ^C by the caller.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Worker-pool size per direction: the configured cap, the logical CPU
    /// count when unset, and a single connection in saving mode.
    pub fn max_connections(&self) -> usize {
        if self.config.saving_mode {
            1
        } else if self.config.max_connections == 0 {
            num_cpus::get()
        } else {
            self.config.max_connections
        }
    }

    fn dl_weight(&self) -> usize {
        if self.config.saving_mode {
            SAVING_DL_WEIGHT
        } else {
            DEFAULT_DL_WEIGHT
        }
    }

    fn ul_weight(&self) -> usize {
        if self.config.saving_mode {
            SAVING_UL_WEIGHT
        } else {
            DEFAULT_UL_WEIGHT
        }
    }

    fn debugln(&self, msg: &str) {
        if self.config.debug {
            eprintln!("[debug] {msg}");
        }
    }

    /// Measure round-trip latency against `server` with the configured
    /// transport and publish mean/jitter/min/max on the record. A server
    /// that produced no samples is left with no latency (the −1 sentinel in
    /// reports) and surfaces the underlying error.
    pub async fn ping_test(&self, server: &mut Server) -> Result<(), Error> {
        self.ping_test_with(server, PingOptions::default(), |_| {}).await
    }

    pub async fn ping_test_with(
        &self,
        server: &mut Server,
        opts: PingOptions,
        callback: impl FnMut(i64) + Send + 'static,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let cancel = Some(self.cancel_rx());
        let samples = match self.config.ping_mode {
            PingMode::Http => {
                latency::http_ping(&self.http, &server.latency_url(), opts, cancel, callback).await
            }
            PingMode::Tcp => {
                latency::tcp_ping(
                    &server.host,
                    opts,
                    self.source_ip.map(bind::local_socket_addr),
                    cancel,
                    callback,
                )
                .await
            }
            PingMode::Icmp => {
                latency::icmp_ping(&server.host, opts, self.source_ip, cancel, callback).await
            }
        };
        server.durations.ping = started.elapsed();
        server.durations.total += server.durations.ping;

        match samples {
            Ok(samples) => {
                server.latency = latency_stats(&samples);
                self.debugln(&format!(
                    "ping: {} samples against {}",
                    samples.len(),
                    server.host
                ));
                Ok(())
            }
            Err(e) => {
                server.latency = None;
                Err(e)
            }
        }
    }

    /// Single-server download pass.
    pub async fn download_test(&self, server: &mut Server) -> Result<(), Error> {
        self.download_test_with(server, &[], None).await
    }

    /// Multi-server download pass: `server` is the elected main (priority 1),
    /// the rest of `servers` join as auxiliaries (priority 2).
    pub async fn multi_download_test(
        &self,
        server: &mut Server,
        servers: &[Server],
    ) -> Result<(), Error> {
        self.download_test_with(server, servers, None).await
    }

    pub async fn download_test_with(
        &self,
        server: &mut Server,
        aux: &[Server],
        callback: Option<RateCallback>,
    ) -> Result<(), Error> {
        let mut direction = TestDirection::new(DirectionKind::Download, self.max_connections())
            .with_debug(self.config.debug);
        if let Some(callback) = callback {
            direction = direction.with_callback(callback);
        }

        let size = DL_SIZES[self.dl_weight()];
        self.register_download_task(&direction, server, 1, size);
        for s in aux {
            if s.host != server.host {
                self.register_download_task(&direction, s, 2, size);
            }
        }
        self.debugln(&format!(
            "download: {} task(s), {} worker(s), {}px payload",
            direction.registered(),
            self.max_connections(),
            size
        ));

        let result = tokio::time::timeout(TEST_TIMEOUT, direction.run(Some(self.cancel_rx())))
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        server.dl_rate = result.rate;
        server.durations.download = result.duration;
        server.durations.total += result.duration;
        self.debugln(&format!(
            "download: {} over {:?} ({}/{} requests failed)",
            result.rate, result.duration, result.failures, result.requests
        ));
        Ok(())
    }

    fn register_download_task(
        &self,
        direction: &TestDirection,
        server: &Server,
        priority: u64,
        size_px: u32,
    ) {
        let url = server.download_url(size_px);
        let http = self.http.clone();
        let counter = direction.counter();
        let trace = direction.trace();
        direction.register(priority, move || {
            let url = url.clone();
            let http = http.clone();
            let counter = counter.clone();
            let trace = trace.clone();
            async move {
                let chunk = Chunk::new(counter.clone());
                let result: Result<(), Error> = async {
                    let resp = tokio::select! {
                        _ = counter.cancelled() => return Ok(()),
                        resp = http.get(&url).send() => resp.map_err(request_error)?,
                    };
                    let resp = resp.error_for_status()?;
                    chunk.download_http(resp).await
                }
                .await;
                if result.is_err() || chunk.kind().is_some() {
                    trace.lock().unwrap().push(chunk.report());
                }
                result
            }
            .boxed()
        });
    }

    /// Single-server upload pass.
    pub async fn upload_test(&self, server: &mut Server) -> Result<(), Error> {
        self.upload_test_with(server, &[], None).await
    }

    /// Multi-server upload pass, same priorities as the download variant.
    pub async fn multi_upload_test(
        &self,
        server: &mut Server,
        servers: &[Server],
    ) -> Result<(), Error> {
        self.upload_test_with(server, servers, None).await
    }

    pub async fn upload_test_with(
        &self,
        server: &mut Server,
        aux: &[Server],
        callback: Option<RateCallback>,
    ) -> Result<(), Error> {
        let mut direction = TestDirection::new(DirectionKind::Upload, self.max_connections())
            .with_debug(self.config.debug);
        if let Some(callback) = callback {
            direction = direction.with_callback(callback);
        }

        let len = upload_len(self.ul_weight());
        self.register_upload_task(&direction, server, 1, len);
        for s in aux {
            if s.host != server.host {
                self.register_upload_task(&direction, s, 2, len);
            }
        }
        self.debugln(&format!(
            "upload: {} task(s), {} worker(s), {} byte bodies",
            direction.registered(),
            self.max_connections(),
            len
        ));

        let result = tokio::time::timeout(TEST_TIMEOUT, direction.run(Some(self.cancel_rx())))
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        server.ul_rate = result.rate;
        server.durations.upload = result.duration;
        server.durations.total += result.duration;
        self.debugln(&format!(
            "upload: {} over {:?} ({}/{} requests failed)",
            result.rate, result.duration, result.failures, result.requests
        ));
        Ok(())
    }

    fn register_upload_task(
        &self,
        direction: &TestDirection,
        server: &Server,
        priority: u64,
        len: u64,
    ) {
        let url = server.upload_url().to_string();
        let http = self.http.clone();
        let counter = direction.counter();
        let trace = direction.trace();
        direction.register(priority, move || {
            let url = url.clone();
            let http = http.clone();
            let counter = counter.clone();
            let trace = trace.clone();
            async move {
                let chunk = Chunk::new(counter.clone());
                let result: Result<(), Error> = async {
                    let body = reqwest::Body::wrap_stream(chunk.upload_handler(len)?);
                    let request = http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .header(reqwest::header::CONTENT_LENGTH, len)
                        .body(body)
                        .send();
                    let resp = tokio::select! {
                        _ = counter.cancelled() => return Ok(()),
                        resp = request => resp.map_err(request_error)?,
                    };
                    let resp = resp.error_for_status()?;
                    let _ = resp.bytes().await;
                    Ok(())
                }
                .await;
                if result.is_err() || chunk.kind().is_some() {
                    trace.lock().unwrap().push(chunk.report());
                }
                result
            }
            .boxed()
        });
    }

    /// Uplink packet loss against the server's control host. A host that
    /// refuses either channel downgrades to an absent tally instead of
    /// failing the run.
    pub async fn packet_loss_test(
        &self,
        server: &mut Server,
        mut options: PacketLossOptions,
    ) -> Result<(), Error> {
        if options.source.is_none() {
            options.source = self.source_ip.map(bind::local_socket_addr);
        }
        let analyzer = PacketLossAnalyzer::new(options);
        let last: Arc<Mutex<Option<PLoss>>> = Arc::new(Mutex::new(None));
        let mut cancel = self.cancel_rx();

        let outcome = {
            let last = last.clone();
            tokio::select! {
                res = analyzer.run(&server.host, move |tally| {
                    *last.lock().unwrap() = Some(*tally);
                }) => res,
                _ = cancel.wait_for(|cancelled| *cancelled) => Ok(()),
            }
        };

        match outcome {
            Ok(()) => {
                server.packet_loss = *last.lock().unwrap();
                Ok(())
            }
            Err(Error::Unsupported) => {
                self.debugln(&format!("packet loss: {} does not support the protocol", server.host));
                server.packet_loss = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::ConnectTimeout
    } else {
        Error::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_length_follows_the_size_table() {
        // weight 4 = 1000 kB class, ten requests' worth
        assert_eq!(upload_len(DEFAULT_UL_WEIGHT), 10_000_000);
        assert_eq!(upload_len(0), 1_000_000);
    }

    #[test]
    fn saving_mode_forces_one_connection_and_small_sizes() {
        let client = Speedtest::new(ClientConfig {
            saving_mode: true,
            max_connections: 8,
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.max_connections(), 1);
        assert_eq!(DL_SIZES[client.dl_weight()], 500);
        assert_eq!(UL_SIZES_KB[client.ul_weight()], 300);
    }

    #[test]
    fn default_connections_track_logical_cpus() {
        let client = Speedtest::new(ClientConfig::default()).unwrap();
        assert_eq!(client.max_connections(), num_cpus::get());

        let client = Speedtest::new(ClientConfig {
            max_connections: 3,
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.max_connections(), 3);
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        let result = Speedtest::new(ClientConfig {
            proxy: Some("::not-a-proxy::".into()),
            ..ClientConfig::default()
        });
        assert!(result.is_err());
    }
}
