//! Test harness: a client node and a service node on one simulated fabric.

use std::sync::Arc;

use portalrpc_transport::{
    BincodeMarshal, CancelToken, ClientConfig, CompletionEvent, Destination, LocalHandler,
    Marshal, MessageHeader, Nid, PeerChannels, Result, RpcClient, Service, ServiceConfig,
    SimNetwork, Transport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Opcode the echo worker answers.
pub const OP_ECHO: u32 = 1;

/// Node id of the client in every cluster.
pub const CLIENT_NID: Nid = 1;

/// Node id of the service in every cluster.
pub const SERVER_NID: Nid = 2;

/// Body understood by the echo worker and [`EchoHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoBody {
    /// Bytes echoed back in the reply.
    pub data: Vec<u8>,
    /// Bulk bytes the worker pushes to the client before replying.
    pub bulk_len: u64,
}

impl EchoBody {
    /// A body echoing `data` without bulk.
    pub fn plain(data: Vec<u8>) -> Self {
        Self { data, bulk_len: 0 }
    }
}

/// Deterministic bulk content of length `len`.
pub fn bulk_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Echo served in the caller's own context.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl LocalHandler for EchoHandler {
    fn handle(&self, header: &MessageHeader, request: &[u8]) -> Result<Vec<u8>> {
        let (_, body): (MessageHeader, EchoBody) = BincodeMarshal.unpack(request)?;
        BincodeMarshal.pack(&MessageHeader::reply_to(header, 0), &body.data)
    }

    fn handle_bulk(&self, _header: &MessageHeader, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let (_, body): (MessageHeader, EchoBody) = BincodeMarshal.unpack(request)?;
        Ok((body.bulk_len > 0).then(|| bulk_pattern(body.bulk_len as usize)))
    }
}

/// Client and service transports wired over a [`SimNetwork`].
pub struct TestCluster {
    /// The simulated fabric.
    pub net: Arc<SimNetwork>,
    /// Client bound to [`CLIENT_NID`].
    pub client: RpcClient,
    /// Service bound to [`SERVER_NID`].
    pub service: Arc<Service>,
}

impl TestCluster {
    /// A cluster with a 4 x 4096 ring and default client settings.
    pub fn small() -> Self {
        Self::start(
            ClientConfig::default(),
            ServiceConfig {
                ring_length: 4,
                buffer_size: 4096,
                ..ServiceConfig::default()
            },
        )
    }

    /// Starts both transports. Must run inside a tokio runtime.
    pub fn start(client: ClientConfig, service: ServiceConfig) -> Self {
        let net = SimNetwork::new();
        let (client_nic, client_events) = net.attach(CLIENT_NID);
        Self::with_client_events(net, client_nic, client_events, client, service)
    }

    /// Like [`TestCluster::start`], but the client's completion events pass
    /// through `tap` first, which may drop, duplicate or reorder them.
    pub fn with_event_tap<F>(client: ClientConfig, service: ServiceConfig, mut tap: F) -> Self
    where
        F: FnMut(CompletionEvent) -> Vec<CompletionEvent> + Send + 'static,
    {
        let net = SimNetwork::new();
        let (client_nic, mut raw) = net.attach(CLIENT_NID);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                for out in tap(event) {
                    if tx.send(out).is_err() {
                        return;
                    }
                }
            }
        });
        Self::with_client_events(net, client_nic, rx, client, service)
    }

    fn with_client_events(
        net: Arc<SimNetwork>,
        client_nic: Arc<portalrpc_transport::SimNic>,
        client_events: mpsc::UnboundedReceiver<CompletionEvent>,
        client: ClientConfig,
        service: ServiceConfig,
    ) -> Self {
        let (server_nic, server_events) = net.attach(SERVER_NID);
        let client = RpcClient::new(Transport::start(client_nic, client_events), client);
        let service = Service::register(Transport::start(server_nic, server_events), service)
            .expect("service registration");
        Self {
            net,
            client,
            service: Arc::new(service),
        }
    }

    /// Channels towards the service node.
    pub fn peer(&self) -> PeerChannels {
        PeerChannels::to_node(SERVER_NID)
    }

    /// Destination reaching the service over the fabric.
    pub fn remote(&self) -> Destination {
        Destination::Remote(self.peer())
    }

    /// Destination served by [`EchoHandler`] without the fabric.
    pub fn local(&self) -> Destination {
        Destination::Local(Arc::new(EchoHandler))
    }

    /// Spawns a worker answering every arrival with its echo.
    pub fn spawn_echo(&self) -> JoinHandle<()> {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            let cancel = CancelToken::never();
            while let Some(arrival) = service.next_arrival().await {
                let Ok((header, body)) = service.unpack_request::<EchoBody>(&arrival) else {
                    continue;
                };
                if body.bulk_len > 0 {
                    let payload = bulk_pattern(body.bulk_len as usize);
                    if let Err(e) = service.send_bulk(&arrival, payload, &cancel).await {
                        tracing::warn!(xid = arrival.xid(), error = %e, "echo bulk push failed");
                    }
                }
                if let Err(e) = service.reply(&arrival, &MessageHeader::reply_to(&header, 0), &body.data) {
                    tracing::warn!(xid = arrival.xid(), error = %e, "echo reply failed");
                }
                let _ = arrival.release();
            }
        })
    }

    /// Client-side transport.
    pub fn client_transport(&self) -> &Arc<Transport> {
        self.client.transport()
    }

    /// Service-side transport.
    pub fn server_transport(&self) -> &Arc<Transport> {
        self.service.transport()
    }

    /// Unregisters the service and stops both transports.
    pub async fn shutdown(self) {
        self.service.unregister();
        self.client_transport().shutdown().await;
        self.server_transport().shutdown().await;
    }
}

/// Polls `cond` until it holds, yielding to other tasks between checks.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
