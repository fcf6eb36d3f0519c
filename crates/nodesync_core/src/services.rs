//! Wiring of every core service of one node.

use crate::ack::AcknowledgeService;
use crate::cluster::ClusterLockService;
use crate::communication::NodeCommunicationService;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::extract::{CaptureReader, DataExtractorService};
use crate::incoming::IncomingBatchService;
use crate::loader::{BatchApplier, DataLoaderService};
use crate::node::NodeDirectory;
use crate::outgoing::OutgoingBatchService;
use crate::sequence::SequenceService;
use nodesync_protocol::{Clock, SystemClock};
use nodesync_store::{
    DataStore, ExtractRequestStore, IncomingBatchStore, LocalStagingManager, LockStore,
    NodeCommunicationStore, OutgoingBatchStore, SequenceStore, StagingManager,
};
use std::sync::Arc;

/// The durable store, split per capability.
#[derive(Clone)]
pub struct Stores {
    /// Sequences.
    pub sequences: Arc<dyn SequenceStore>,
    /// Cluster locks.
    pub locks: Arc<dyn LockStore>,
    /// Node communication leases.
    pub communications: Arc<dyn NodeCommunicationStore>,
    /// Outgoing ledger.
    pub outgoing: Arc<dyn OutgoingBatchStore>,
    /// Incoming ledger.
    pub incoming: Arc<dyn IncomingBatchStore>,
    /// Extract requests.
    pub requests: Arc<dyn ExtractRequestStore>,
}

impl Stores {
    /// Uses one store for every capability.
    pub fn shared<S: DataStore + 'static>(store: Arc<S>) -> Self {
        Self {
            sequences: store.clone(),
            locks: store.clone(),
            communications: store.clone(),
            outgoing: store.clone(),
            incoming: store.clone(),
            requests: store,
        }
    }
}

/// Every core service of one node, sharing one store and clock.
pub struct NodeServices {
    /// Configuration the services were built with.
    pub config: CoreConfig,
    /// Clock.
    pub clock: Arc<dyn Clock>,
    /// Known nodes.
    pub directory: Arc<dyn NodeDirectory>,
    /// Staged payloads.
    pub staging: Arc<dyn StagingManager>,
    /// Sequence generator.
    pub sequences: Arc<SequenceService>,
    /// Cluster locks.
    pub locks: Arc<ClusterLockService>,
    /// Communication leases.
    pub communications: Arc<NodeCommunicationService>,
    /// Outgoing ledger.
    pub outgoing: Arc<OutgoingBatchService>,
    /// Incoming ledger.
    pub incoming: Arc<IncomingBatchService>,
    /// Ack processing.
    pub acks: Arc<AcknowledgeService>,
    /// Staging extractor.
    pub extractor: Arc<DataExtractorService>,
    /// Payload loader.
    pub loader: Arc<DataLoaderService>,
}

impl NodeServices {
    /// Starts building the services of a node.
    pub fn builder(
        stores: Stores,
        directory: Arc<dyn NodeDirectory>,
        capture: Arc<dyn CaptureReader>,
        applier: Arc<dyn BatchApplier>,
    ) -> NodeServicesBuilder {
        NodeServicesBuilder {
            stores,
            directory,
            capture,
            applier,
            clock: None,
            staging: None,
            config: CoreConfig::default(),
        }
    }

    /// Id of the local node.
    pub fn local_node_id(&self) -> String {
        self.directory.local_node().node_id
    }

    /// Id this server holds locks under.
    pub fn server_id(&self) -> &str {
        self.locks.server_id()
    }
}

/// Builder for [`NodeServices`].
pub struct NodeServicesBuilder {
    stores: Stores,
    directory: Arc<dyn NodeDirectory>,
    capture: Arc<dyn CaptureReader>,
    applier: Arc<dyn BatchApplier>,
    clock: Option<Arc<dyn Clock>>,
    staging: Option<Arc<dyn StagingManager>>,
    config: CoreConfig,
}

impl NodeServicesBuilder {
    /// Sets the clock. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the staging manager. Defaults to in-memory staging.
    pub fn staging(mut self, staging: Arc<dyn StagingManager>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the services and initializes sequences and lock rows.
    pub fn open(self) -> CoreResult<NodeServices> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let staging = self
            .staging
            .unwrap_or_else(|| Arc::new(LocalStagingManager::in_memory(Arc::clone(&clock))));
        let config = self.config;
        let local_node_id = self.directory.local_node().node_id;

        let sequences = Arc::new(SequenceService::new(
            self.stores.sequences,
            Arc::clone(&clock),
            config.sequence.clone(),
        ));
        sequences.init()?;

        let locks = Arc::new(ClusterLockService::new(
            self.stores.locks,
            Arc::clone(&clock),
            config.lock.clone(),
        ));
        locks.init()?;
        let host = locks.server_id().to_string();

        let communications = Arc::new(NodeCommunicationService::new(
            self.stores.communications,
            Arc::clone(&self.directory),
            Arc::clone(&clock),
            config.lease.clone(),
            host.clone(),
        ));
        let outgoing = Arc::new(OutgoingBatchService::new(
            self.stores.outgoing,
            Arc::clone(&sequences),
            Arc::clone(&clock),
            host.clone(),
        ));
        let incoming = Arc::new(IncomingBatchService::new(
            self.stores.incoming,
            Arc::clone(&clock),
            config.load.clone(),
            host,
        ));
        let acks = Arc::new(AcknowledgeService::new(
            Arc::clone(&outgoing),
            Arc::clone(&staging),
        ));
        let extractor = Arc::new(DataExtractorService::new(
            Arc::clone(&outgoing),
            Arc::clone(&sequences),
            self.stores.requests,
            Arc::clone(&locks),
            Arc::clone(&staging),
            self.capture,
            Arc::clone(&clock),
            config.extract.clone(),
            local_node_id.clone(),
        ));
        let loader = Arc::new(DataLoaderService::new(
            Arc::clone(&incoming),
            self.applier,
            Arc::clone(&clock),
            local_node_id.clone(),
        ));

        tracing::info!(node = %local_node_id, server = %locks.server_id(), "node services started");
        Ok(NodeServices {
            config,
            clock,
            directory: self.directory,
            staging,
            sequences,
            locks,
            communications,
            outgoing,
            incoming,
            acks,
            extractor,
            loader,
        })
    }
}
