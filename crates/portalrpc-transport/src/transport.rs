//! Transport context: fabric, completion dispatcher and the event pump.
//!
//! A [`Transport`] is constructed explicitly with [`Transport::start`], which takes
//! the fabric endpoint and the receiving half of its completion channel and spawns
//! a tokio task that feeds every event to the [`Dispatcher`]. Clients and services
//! built on the same transport share its queues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::error::{Result, RpcError};
use crate::fabric::{CompletionEvent, Fabric, Nid};
use crate::metrics::RpcMetrics;

/// Shared RPC context bound to one fabric endpoint.
pub struct Transport {
    fabric: Arc<dyn Fabric>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<RpcMetrics>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<Notify>,
    closed: AtomicBool,
    next_xid: AtomicU64,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("nid", &self.fabric.local_nid())
            .field("dispatcher", &self.dispatcher)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport {
    /// Starts the event pump. Must be called from within a tokio runtime.
    pub fn start(
        fabric: Arc<dyn Fabric>,
        events: mpsc::UnboundedReceiver<CompletionEvent>,
    ) -> Arc<Self> {
        let metrics = Arc::new(RpcMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&metrics)));
        let stop = Arc::new(Notify::new());
        let nid = fabric.local_nid();
        let pump = tokio::spawn(run_pump(
            nid,
            events,
            Arc::clone(&dispatcher),
            Arc::clone(&stop),
        ));
        info!(nid, "transport started");
        Arc::new(Self {
            fabric,
            dispatcher,
            metrics,
            pump: Mutex::new(Some(pump)),
            stop,
            closed: AtomicBool::new(false),
            next_xid: AtomicU64::new(1),
        })
    }

    /// The fabric endpoint.
    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    /// The completion dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Counters shared by every client and service on this transport.
    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    /// Node id of the underlying endpoint.
    pub fn local_nid(&self) -> Nid {
        self.fabric.local_nid()
    }

    /// True while the event pump is processing events.
    pub fn is_running(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.pump.lock() {
            Ok(pump) => pump.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Next transaction id. Unique across every client on this transport.
    pub(crate) fn next_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RpcError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Stops the event pump and rejects further dispatches.
    ///
    /// Waits already in progress only complete through cancellation or their
    /// deadline after this returns.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.notify_one();
        let pump = match self.pump.lock() {
            Ok(mut pump) => pump.take(),
            Err(_) => None,
        };
        if let Some(handle) = pump {
            if let Err(e) = handle.await {
                error!(nid = self.local_nid(), error = %e, "event pump terminated abnormally");
            }
        }
        info!(nid = self.local_nid(), outstanding = self.dispatcher.outstanding(), "transport shut down");
    }
}

async fn run_pump(
    nid: Nid,
    mut events: mpsc::UnboundedReceiver<CompletionEvent>,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<Notify>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.notified() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Err(e) = dispatcher.dispatch(&event) {
            error!(nid, error = %e, ?event, "fabric violated its completion contract");
            panic!("event pump for node {nid} stopped: {e}");
        }
    }
    debug!(nid, "event pump stopped");
}
