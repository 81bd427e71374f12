//! flowgen: synthetic NetFlow v5 exporter
//!
//! Generates plausible enterprise traffic (clients hitting web, app,
//! and database tiers through a gateway) and streams it to a FlowLens
//! collector over UDP. Useful for demos and soak testing without a
//! router.
//!
//! ```bash
//! cargo run --bin flowgen -- --target 127.0.0.1:2055 --rate 50
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use flowlens::ingestion::parsers::netflow_v5::{V5Flow, V5PacketBuilder};
use flowlens::types::protocols;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flowgen")]
#[command(about = "Synthetic NetFlow v5 exporter for FlowLens")]
struct CliArgs {
    /// Collector address
    #[arg(long, default_value = "127.0.0.1:2055")]
    target: String,

    /// Packets per second
    #[arg(long, default_value = "10")]
    rate: u32,

    /// Flows per packet (1-30)
    #[arg(long, default_value = "10")]
    flows_per_packet: u16,

    /// Stop after this many packets (0 = run forever)
    #[arg(long, default_value = "0")]
    count: u64,
}

/// A service endpoint clients talk to.
struct Tier {
    hosts: Vec<Ipv4Addr>,
    port: u16,
    bytes_range: (u32, u32),
}

fn topology() -> Vec<Tier> {
    vec![
        Tier {
            hosts: vec!["10.1.0.10".parse().unwrap(), "10.1.0.11".parse().unwrap()],
            port: 443,
            bytes_range: (2_000, 80_000),
        },
        Tier {
            hosts: vec!["10.2.0.20".parse().unwrap(), "10.2.0.21".parse().unwrap()],
            port: 8080,
            bytes_range: (1_000, 40_000),
        },
        Tier {
            hosts: vec!["10.3.0.30".parse().unwrap()],
            port: 5432,
            bytes_range: (500, 200_000),
        },
        Tier {
            hosts: vec!["10.3.0.40".parse().unwrap()],
            port: 2049,
            bytes_range: (10_000, 2_000_000),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind sender socket")?;
    socket
        .connect(&args.target)
        .await
        .with_context(|| format!("Failed to connect to {}", args.target))?;

    info!(
        target = %args.target,
        rate = args.rate,
        flows_per_packet = args.flows_per_packet,
        "flowgen started"
    );

    let tiers = topology();
    let gateway: Ipv4Addr = "10.0.0.254".parse().unwrap();
    let flows_per_packet = args.flows_per_packet.clamp(1, 30);
    let interval = Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1)));
    let started = std::time::Instant::now();

    let mut sequence = 0u32;
    let mut sent = 0u64;

    loop {
        let uptime_ms = started.elapsed().as_millis() as u32;
        let unix_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut builder = V5PacketBuilder::new(unix_secs, uptime_ms);
        builder.flow_sequence = sequence;

        {
            let mut rng = rand::thread_rng();
            for _ in 0..flows_per_packet {
                let tier = &tiers[rng.gen_range(0..tiers.len())];
                let server = *tier
                    .hosts
                    .choose(&mut rng)
                    .unwrap_or(&tier.hosts[0]);
                let client: Ipv4Addr =
                    format!("10.0.{}.{}", rng.gen_range(1..5), rng.gen_range(2..250))
                        .parse()
                        .unwrap_or(Ipv4Addr::UNSPECIFIED);

                let bytes = rng.gen_range(tier.bytes_range.0..=tier.bytes_range.1);
                let duration_ms = rng.gen_range(10..30_000).min(uptime_ms);
                builder.add_flow(V5Flow {
                    src_ip: client,
                    dst_ip: server,
                    next_hop: gateway,
                    input_if: 1,
                    output_if: 2,
                    packets: (bytes / 800).max(1),
                    octets: bytes,
                    first: uptime_ms.saturating_sub(duration_ms),
                    last: uptime_ms,
                    src_port: rng.gen_range(32_768..61_000),
                    dst_port: tier.port,
                    tcp_flags: 0x18,
                    protocol: protocols::TCP,
                    tos: 0,
                    src_as: 0,
                    dst_as: 0,
                    src_mask: 24,
                    dst_mask: 24,
                });
            }
        }

        socket
            .send(&builder.build())
            .await
            .context("Send failed")?;
        sequence = sequence.wrapping_add(u32::from(flows_per_packet));
        sent += 1;

        if sent % 100 == 0 {
            info!(packets = sent, flows = sent * u64::from(flows_per_packet), "progress");
        }
        if args.count > 0 && sent >= args.count {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    info!(packets = sent, "flowgen finished");
    Ok(())
}
