use crate::catalog::{self, Server, ServerReport, User};
use crate::engine::direction::RateCallback;
use crate::engine::ploss::PacketLossOptions;
use crate::engine::Speedtest;
use crate::model::{ClientConfig, Coordinates, PingMode};
use crate::units::{ByteRate, UnitFamily};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "speedtest-cli",
    version,
    about = "Network speed measurement against speedtest.net servers"
)]
pub struct Cli {
    /// Show available servers and exit
    #[arg(long, short = 'l')]
    pub list: bool,

    /// Select server ids to test against (repeatable)
    #[arg(long, short = 's')]
    pub server: Vec<String>,

    /// Use a custom server URL (<scheme>://<host>/speedtest/upload.php)
    #[arg(long)]
    pub custom_url: Option<String>,

    /// Filter the server catalog by keyword
    #[arg(long)]
    pub keyword: Option<String>,

    /// Override the detected location with a named city (e.g. london)
    #[arg(long)]
    pub city: Option<String>,

    /// Override the detected location with explicit "lat,lon"
    #[arg(long)]
    pub location: Option<String>,

    /// Test all selected servers at once, nearest as the main target
    #[arg(long, short = 'm')]
    pub multi: bool,

    /// Worker connections per direction (0 = logical CPUs)
    #[arg(long, default_value_t = 0)]
    pub thread: usize,

    /// Latency probe transport: http, tcp or icmp
    #[arg(long, default_value = "http")]
    pub ping_mode: String,

    /// Output units: decimal-bits, decimal-bytes, binary-bits, binary-bytes
    /// or default
    #[arg(long, default_value = "default")]
    pub unit: String,

    /// Local address or interface to bind outgoing sockets to
    #[arg(long)]
    pub source: Option<String>,

    /// Resolve DNS through the bound source address as well
    #[arg(long)]
    pub dns_bind_source: bool,

    /// HTTP or SOCKS proxy URL
    #[arg(long)]
    pub proxy: Option<String>,

    /// Reduce resource use: one worker, small payloads
    #[arg(long)]
    pub saving_mode: bool,

    /// Skip the download phase
    #[arg(long)]
    pub no_download: bool,

    /// Skip the upload phase
    #[arg(long)]
    pub no_upload: bool,

    /// Skip the uplink packet-loss analysis
    #[arg(long)]
    pub no_packet_loss: bool,

    /// Sampling window for the packet-loss analysis
    #[arg(long, default_value = "30s")]
    pub ploss_duration: humantime::Duration,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose tracing to stderr
    #[arg(long)]
    pub debug: bool,
}

fn parse_location(s: &str) -> Result<Coordinates> {
    let (lat, lon) = s
        .split_once(',')
        .context("location must be \"lat,lon\"")?;
    Ok(Coordinates {
        lat: lat.trim().parse().context("invalid latitude")?,
        lon: lon.trim().parse().context("invalid longitude")?,
    })
}

pub fn build_config(args: &Cli) -> Result<ClientConfig> {
    let location = args.location.as_deref().map(parse_location).transpose()?;
    let ping_mode: PingMode = args.ping_mode.parse().map_err(anyhow::Error::msg)?;
    Ok(ClientConfig {
        user_agent: format!("speedtest-cli/{}", env!("CARGO_PKG_VERSION")),
        proxy: args.proxy.clone(),
        source: args.source.clone(),
        dns_bind_source: args.dns_bind_source,
        ping_mode,
        saving_mode: args.saving_mode,
        max_connections: args.thread,
        keyword: args.keyword.clone(),
        city: args.city.clone(),
        location,
        no_download: args.no_download,
        no_upload: args.no_upload,
        debug: args.debug,
    })
}

#[derive(Serialize)]
struct RunReport {
    timestamp: String,
    user: User,
    servers: Vec<ServerReport>,
}

fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

pub async fn run(args: Cli) -> Result<()> {
    let unit: UnitFamily = args.unit.parse().map_err(anyhow::Error::msg)?;
    let config = build_config(&args)?;
    let client = Arc::new(Speedtest::new(config).context("failed to construct client")?);

    // ^C propagates through the client's one-shot signal; in-flight phases
    // publish partial results.
    {
        let client = client.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!("interrupted, finishing up");
                client.cancel();
            }
        });
    }

    let mut user = User::default();
    let targets: Vec<Server> = if let Some(url) = &args.custom_url {
        vec![Server::from_custom_url(url)?]
    } else {
        user = match catalog::fetch_user(client.http()).await {
            Ok(user) => user,
            Err(e) => {
                eprintln!("warning: could not determine caller location: {e:#}");
                User::default()
            }
        };
        if let Some(coords) = client.config().location {
            user.set_location(coords);
        } else if let Some(city) = &client.config().city {
            if !user.set_location_by_city(city) {
                anyhow::bail!("unknown city '{city}'");
            }
        }

        let list = catalog::fetch_servers(client.http(), &user, client.config().keyword.as_deref())
            .await
            .context("failed to fetch server catalog")?;
        if args.list {
            print!("{list}");
            return Ok(());
        }
        list.find_servers(&args.server)?
    };

    if !args.json && !user.ip.is_empty() {
        println!("You are {user}");
    }

    let mut results: Vec<Server> = Vec::new();
    if args.multi {
        let mut main = targets[0].clone();
        test_one_server(&client, &mut main, &targets[1..], &args, unit).await?;
        results.push(main);
    } else {
        for target in &targets {
            let mut server = target.clone();
            test_one_server(&client, &mut server, &[], &args, unit).await?;
            results.push(server);
        }
    }

    if args.json {
        let report = RunReport {
            timestamp: timestamp(),
            user,
            servers: results.iter().map(|s| s.report()).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn test_one_server(
    client: &Arc<Speedtest>,
    server: &mut Server,
    aux: &[Server],
    args: &Cli,
    unit: UnitFamily,
) -> Result<()> {
    let quiet = args.json;
    if !quiet {
        println!("Target: {server}");
        if !aux.is_empty() {
            println!("        with {} auxiliary server(s)", aux.len());
        }
    }

    // The packet-loss analysis needs the whole sampling window, so it runs
    // alongside the other phases and is collected at the end.
    let packet_loss = if args.no_packet_loss {
        None
    } else {
        let client = client.clone();
        let host = server.host.clone();
        let options = PacketLossOptions {
            sampling_duration: args.ploss_duration.into(),
            ..PacketLossOptions::default()
        };
        Some(tokio::spawn(async move {
            let mut probe = Server {
                host,
                ..Server::default()
            };
            match client.packet_loss_test(&mut probe, options).await {
                Ok(()) => probe.packet_loss,
                Err(_) => None,
            }
        }))
    };

    client
        .ping_test(server)
        .await
        .with_context(|| format!("latency probe against {} failed", server.host))?;
    if !quiet {
        if let Some(lat) = &server.latency {
            println!(
                "Latency: {:.2} ms, Jitter: {:.2} ms (min {:.2} ms / max {:.2} ms)",
                lat.mean_ns as f64 / 1e6,
                lat.jitter_ns as f64 / 1e6,
                lat.min_ns as f64 / 1e6,
                lat.max_ns as f64 / 1e6,
            );
        }
    }

    if !client.config().no_download {
        let callback = progress_callback(quiet, "Download", unit);
        client
            .download_test_with(server, aux, callback)
            .await
            .with_context(|| format!("download test against {} failed", server.host))?;
        if !quiet {
            eprint!("\r");
            println!("Download: {}", server.dl_rate.format(unit));
        }
    }

    if !client.config().no_upload {
        let callback = progress_callback(quiet, "Upload", unit);
        client
            .upload_test_with(server, aux, callback)
            .await
            .with_context(|| format!("upload test against {} failed", server.host))?;
        if !quiet {
            eprint!("\r");
            println!("Upload: {}", server.ul_rate.format(unit));
        }
    }

    if let Some(handle) = packet_loss {
        server.packet_loss = handle.await.unwrap_or(None);
        if !quiet {
            match &server.packet_loss {
                Some(tally) => println!("{tally}"),
                None if !args.no_packet_loss => println!("Packet Loss: N/A"),
                None => {}
            }
        }
    }

    if server.looks_suspicious() {
        eprintln!("warning: result asymmetry looks suspicious, consider retesting");
    }
    if !quiet {
        let d = &server.durations;
        println!(
            "Spent: {:.1}s (ping {:.1}s / download {:.1}s / upload {:.1}s)",
            d.total.as_secs_f64(),
            d.ping.as_secs_f64(),
            d.download.as_secs_f64(),
            d.upload.as_secs_f64(),
        );
    }
    Ok(())
}

/// Stderr progress line, refreshed every few sampler ticks.
fn progress_callback(quiet: bool, label: &'static str, unit: UnitFamily) -> Option<RateCallback> {
    if quiet {
        return None;
    }
    let ticks = AtomicUsize::new(0);
    Some(Arc::new(move |rate| {
        if ticks.fetch_add(1, Ordering::Relaxed) % 10 == 0 {
            eprint!("\r{label}: {:<16}", ByteRate(rate).format(unit));
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_flag_parses() {
        let c = parse_location("34.6952, 135.5006").unwrap();
        assert_eq!(c, Coordinates { lat: 34.6952, lon: 135.5006 });
        assert!(parse_location("34.6952").is_err());
        assert!(parse_location("a,b").is_err());
    }

    #[test]
    fn config_assembles_from_flags() {
        let args = Cli::parse_from([
            "speedtest-cli",
            "--ping-mode",
            "tcp",
            "--thread",
            "4",
            "--saving-mode",
            "--source",
            "192.0.2.1",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.ping_mode, PingMode::Tcp);
        assert_eq!(config.max_connections, 4);
        assert!(config.saving_mode);
        assert_eq!(config.source.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn bad_flags_are_rejected() {
        let args = Cli::parse_from(["speedtest-cli", "--ping-mode", "carrier-pigeon"]);
        assert!(build_config(&args).is_err());

        let args = Cli::parse_from(["speedtest-cli", "--location", "nowhere"]);
        assert!(build_config(&args).is_err());
    }
}
