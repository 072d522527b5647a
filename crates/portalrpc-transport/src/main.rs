#![warn(missing_docs)]

//! Loopback exerciser: an echo service and a client wired over the simulated fabric.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use portalrpc_transport::{
    CancelToken, Destination, FabricStats, MessageHeader, MetricsSnapshot, RpcClient, RpcConfig,
    Service, SimNetwork, Transport,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OP_ECHO: u32 = 1;

#[derive(Parser)]
#[command(name = "prpc-loopback")]
#[command(about = "Runs echo exchanges between a client and a service on a simulated fabric", long_about = None)]
struct Cli {
    /// TOML or JSON configuration file.
    #[arg(short, long, env = "PRPC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of exchanges.
    #[arg(short = 'n', long, default_value = "16")]
    calls: usize,

    /// Request payload size in bytes.
    #[arg(short, long, default_value = "512")]
    payload: usize,

    /// Bulk bytes the service pushes back per exchange; 0 disables bulk.
    #[arg(short, long, default_value = "0")]
    bulk: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    data: Vec<u8>,
    bulk_len: usize,
}

#[derive(Serialize)]
struct Report {
    client: MetricsSnapshot,
    service: MetricsSnapshot,
    fabric: FabricStats,
}

async fn serve(service: Arc<Service>) {
    let cancel = CancelToken::never();
    while let Some(arrival) = service.next_arrival().await {
        let (header, request): (MessageHeader, EchoRequest) = match service.unpack_request(&arrival) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(xid = arrival.xid(), error = %e, "dropping undecodable request");
                continue;
            }
        };
        if request.bulk_len > 0 {
            let payload = (0..request.bulk_len).map(|i| i as u8).collect();
            if let Err(e) = service.send_bulk(&arrival, payload, &cancel).await {
                tracing::error!(xid = arrival.xid(), error = %e, "bulk push failed");
            }
        }
        let reply = MessageHeader::reply_to(&header, 0);
        if let Err(e) = service.reply(&arrival, &reply, &request.data) {
            tracing::error!(xid = arrival.xid(), error = %e, "reply failed");
        }
        if let Err(e) = arrival.release() {
            tracing::error!(error = %e, "cannot release ring slot");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RpcConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RpcConfig::default(),
    };

    let net = SimNetwork::new();
    let server_nid = config.channels.nid;
    let client_nid = server_nid.wrapping_add(1);
    let (server_nic, server_events) = net.attach(server_nid);
    let (client_nic, client_events) = net.attach(client_nid);
    let server_transport = Transport::start(server_nic, server_events);
    let client_transport = Transport::start(client_nic, client_events);

    let service = Arc::new(Service::register(
        Arc::clone(&server_transport),
        config.service.clone(),
    )?);
    let worker = tokio::spawn(serve(Arc::clone(&service)));

    let client = RpcClient::new(Arc::clone(&client_transport), config.client.clone());
    let to = Destination::Remote(config.channels);
    let cancel = CancelToken::never();
    for i in 0..cli.calls {
        let data = vec![(i % 251) as u8; cli.payload];
        let body = EchoRequest {
            data: data.clone(),
            bulk_len: cli.bulk,
        };
        let mut request = client.create(OP_ECHO, &body, cli.payload + 64)?;
        if cli.bulk > 0 {
            request.attach_bulk_sink(cli.bulk)?;
        }
        client.dispatch(&mut request, &to)?;
        let reply = client.wait::<Vec<u8>>(&mut request, &cancel).await?;
        if reply.body != data {
            bail!("exchange {} echoed {} bytes instead of {}", reply.header.xid, reply.body.len(), data.len());
        }
        if cli.bulk > 0 {
            let bulk = client.receive_bulk(&mut request, &cancel).await?;
            if bulk.len() != cli.bulk {
                bail!("exchange {} received {} bulk bytes instead of {}", reply.header.xid, bulk.len(), cli.bulk);
            }
        }
    }
    tracing::info!(calls = cli.calls, "all exchanges completed");

    service.unregister();
    worker.await?;
    client_transport.shutdown().await;
    server_transport.shutdown().await;

    let report = Report {
        client: client_transport.metrics().snapshot(),
        service: server_transport.metrics().snapshot(),
        fabric: net.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
