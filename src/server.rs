//! # Light Server
//!
//! Orchestration of the light-serving subsystems: per-client flow control,
//! learned request cost statistics, and the background CHT/head loop. A
//! node embeds a [`LightServer`] next to its protocol manager; the protocol
//! layer calls into [`ClientManager`] and [`RequestCostStats`] on every
//! served request, while the head loop runs on its own task until `stop`.
//!
//! Shutdown is cooperative: `stop` flushes the cost statistics to the node
//! database, stops rechargeing client buffers, and signals the head loop to
//! terminate before awaiting it.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cht::{spawn_head_loop, ChtBuilder, ChtConfig};
use crate::clock::Clock;
use crate::costs::{RequestCostList, RequestCostStats};
use crate::db::NodeDb;
use crate::flowcontrol::{ClientManager, ServerParams};
use crate::protocols::{ChainHeadEvent, ChainStore, PeerSet, TrieFactory};

/// Default flow control parameters advertised to light clients.
pub const DEFAULT_SERVER_PARAMS: ServerParams =
    ServerParams { buf_limit: 300_000_000, min_recharge: 50_000 };

/// Static configuration of a light server.
#[derive(Debug, Clone)]
pub struct LightServerConfig {
    /// Aggregate request-serving capacity shared across clients, in cost
    /// units per millisecond.
    pub total_recharge: u64,
    /// Per-client flow control parameters advertised on handshake.
    pub params: ServerParams,
    pub cht: ChtConfig,
    /// Message codes served; fixes the advertised cost table layout.
    pub msg_codes: Vec<u64>,
}

/// A full node's light-client serving half.
pub struct LightServer<C, F, P> {
    fc_manager: Arc<ClientManager>,
    cost_stats: Arc<RequestCostStats>,
    def_params: ServerParams,
    cht_config: ChtConfig,
    db: NodeDb,
    chain: Arc<C>,
    tries: Arc<F>,
    peers: Arc<P>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    head_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<C, F, P> LightServer<C, F, P>
where
    C: ChainStore + 'static,
    F: TrieFactory + 'static,
    P: PeerSet + 'static,
{
    pub fn new(
        config: LightServerConfig,
        db: NodeDb,
        chain: Arc<C>,
        tries: Arc<F>,
        peers: Arc<P>,
        clock: Clock,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        LightServer {
            fc_manager: Arc::new(ClientManager::new(config.total_recharge, clock)),
            cost_stats: Arc::new(RequestCostStats::new(db.clone(), &config.msg_codes)),
            def_params: config.params,
            cht_config: config.cht,
            db,
            chain,
            tries,
            peers,
            shutdown,
            shutdown_rx,
            head_loop: Mutex::new(None),
        }
    }

    /// Start the background head loop on the given chain head subscription.
    pub fn start(&self, head_events: broadcast::Receiver<ChainHeadEvent>) {
        let builder = ChtBuilder::new(
            self.db.clone(),
            self.chain.clone(),
            self.tries.clone(),
            self.cht_config,
        );
        let handle =
            spawn_head_loop(builder, self.peers.clone(), head_events, self.shutdown_rx.clone());
        *self.head_loop.lock().unwrap() = Some(handle);
        info!("light server started");
    }

    /// Flush persistent state and terminate the background loop.
    pub async fn stop(&self) {
        self.cost_stats.store();
        self.fc_manager.stop();
        let _ = self.shutdown.send(true);
        let handle = self.head_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("light server stopped");
    }

    /// Flow control accounting, shared with the per-peer request tasks.
    pub fn flow_control(&self) -> &Arc<ClientManager> {
        &self.fc_manager
    }

    /// Learned request cost statistics.
    pub fn cost_stats(&self) -> &Arc<RequestCostStats> {
        &self.cost_stats
    }

    /// Parameters advertised to a connecting client.
    pub fn default_params(&self) -> ServerParams {
        self.def_params
    }

    /// Cost table advertised to a connecting client.
    pub fn cost_list(&self) -> RequestCostList {
        self.cost_stats.current_list()
    }
}
