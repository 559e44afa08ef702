//! Scale Sender - Remote Weight Forwarder
//!
//! Companion binary for stations whose indicator is not attached to the
//! server host. Reads the local serial indicator and forwards every parsed
//! weight to the server's remote scale bridge, authenticated by the
//! station's token. Serial and HTTP failures are retried forever; the
//! sender is meant to run unattended next to the scale.

use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use weighbridge_telemetry::scale_manager::parse_weight;

/// Delay between serial reconnect attempts
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "scale_sender", about = "Forward serial scale readings to a weighbridge server")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    /// Station bridge token
    #[arg(long)]
    token: String,

    /// Serial port (e.g. COM1 or /dev/ttyUSB0)
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(long, default_value_t = 9600)]
    baud: u32,
}

/// Matches the server's remote bridge payload
#[derive(Debug, Serialize)]
struct Payload {
    weight: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scale_sender=info".into()),
        )
        .init();

    let args = Args::parse();
    let endpoint = format!("{}/api/external/scale", args.server.trim_end_matches('/'));

    tracing::info!(server = %endpoint, port = %args.port, baud = args.baud, "Starting scale sender");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    loop {
        let port = tokio_serial::new(args.port.as_str(), args.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async();

        let port = match port {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(port = %args.port, error = %e, "Serial open failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        tracing::info!(port = %args.port, "Serial port opened");
        let mut lines = FramedRead::new(port, LinesCodec::new_with_max_length(8192));

        while let Some(line) = lines.next().await {
            let text = match line {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Serial read error, reconnecting");
                    break;
                }
            };

            let weight = parse_weight(&text);
            let payload = Payload { weight };

            match client
                .post(&endpoint)
                .header("X-Scale-Token", &args.token)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(weight, "Reading forwarded");
                }
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "Server rejected reading");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to reach server");
                }
            }
        }

        tracing::warn!(port = %args.port, "Serial stream closed, reconnecting");
        tokio::time::sleep(RETRY_DELAY).await;
    }
}
