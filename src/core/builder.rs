//! Wires a DBRB node together: engine, transport worker and inbound
//! dispatch, under one shutdown manager.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::{
    DbrbContainer, DeliverCallback, GetDbrbModeCallback, ValidationCallback,
};
use crate::config::{Configuration, ConfigurationError};
use crate::core::shutdown::{ShutdownHandle, ShutdownManager};
use crate::utilities::crypto::{Keypair, KeyPairError};
use crate::membership::{self, MembershipError, TransactionSender, ViewFetcher};
use crate::network::{ConnectionPool, InboundDispatcher, MessageSender};
use crate::process::{DbrbProcess, OutboundPacket};
use crate::shard::ShardedDbrbProcess;
use crate::utilities::time::DbrbTime;

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    KeyPair(#[from] KeyPairError),
    #[error("node is not configured as a DBRB process")]
    NotADbrbProcess,
}

/// Builds and launches a DBRB node. Must be called within a tokio runtime.
pub struct DbrbStarter {
    configuration: Configuration,
    view_fetcher: Arc<dyn ViewFetcher>,
    transaction_sender: Arc<dyn TransactionSender>,
    connection_pool: Arc<dyn ConnectionPool>,
    deliver_callback: Option<DeliverCallback>,
    validation_callback: Option<ValidationCallback>,
    get_mode_callback: Option<GetDbrbModeCallback>,
}

/// A running DBRB node: the engine container, the inbound dispatcher to
/// hand transport packets to, and the shutdown plumbing.
pub struct DbrbNode {
    pub container: DbrbContainer,
    pub dispatcher: InboundDispatcher,
    shutdown_handle: ShutdownHandle,
    shutdown_manager: ShutdownManager,
}

impl DbrbNode {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown_handle.clone()
    }

    /// Signals every task and waits for them to finish.
    pub async fn stop(self) {
        self.shutdown_handle.shutdown();
        let mut manager = self.shutdown_manager;
        manager.wait().await;
        manager.stop().await;
    }
}

impl DbrbStarter {
    pub fn new(
        configuration: Configuration,
        view_fetcher: Arc<dyn ViewFetcher>,
        transaction_sender: Arc<dyn TransactionSender>,
        connection_pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        Self {
            configuration,
            view_fetcher,
            transaction_sender,
            connection_pool,
            deliver_callback: None,
            validation_callback: None,
            get_mode_callback: None,
        }
    }

    pub fn with_deliver_callback(mut self, callback: DeliverCallback) -> Self {
        self.deliver_callback = Some(callback);
        self
    }

    pub fn with_validation_callback(mut self, callback: ValidationCallback) -> Self {
        self.validation_callback = Some(callback);
        self
    }

    pub fn with_get_dbrb_mode_callback(mut self, callback: GetDbrbModeCallback) -> Self {
        self.get_mode_callback = Some(callback);
        self
    }

    pub fn start(self) -> Result<DbrbNode, StartError> {
        crate::logging::init_logging();

        let dbrb_config = self.configuration.dbrb.clone();
        if !dbrb_config.is_dbrb_process {
            return Err(StartError::NotADbrbProcess);
        }
        let sharding = dbrb_config.sharding()?;

        let keypair = Arc::new(Keypair::from_private_key_hex(
            &self.configuration.node.private_key,
        )?);

        // A system without any process is unusable; fail at boot instead of
        // spinning.
        let now = DbrbTime::now();
        membership::fetch_merged_view(self.view_fetcher.as_ref(), now)?;

        let (mut shutdown_manager, shutdown_handle) = ShutdownManager::init();
        let (message_sender, sender_task) = MessageSender::start(self.connection_pool);
        shutdown_manager.add_handle(sender_task);

        let container = match sharding {
            None => {
                let (mut process, handle) = DbrbProcess::new(
                    keypair,
                    dbrb_config,
                    self.view_fetcher,
                    self.transaction_sender,
                )?;
                if let Some(callback) = self.deliver_callback {
                    process.set_deliver_callback(callback);
                }
                if let Some(callback) = self.validation_callback {
                    process.set_validation_callback(callback);
                }
                if let Some(callback) = self.get_mode_callback {
                    process.set_get_dbrb_mode_callback(callback);
                }

                if let Some(outbound) = process.take_outbound() {
                    shutdown_manager.add_handle(tokio::spawn(forward_outbound(
                        outbound,
                        message_sender.clone(),
                    )));
                }
                shutdown_manager
                    .add_handle(tokio::spawn(process.run(shutdown_manager.subscribe())));

                handle.update_view(now);
                DbrbContainer::Flat(handle)
            }
            Some(shard_size) => {
                let (mut process, handle) = ShardedDbrbProcess::new(
                    keypair,
                    dbrb_config,
                    shard_size,
                    self.view_fetcher,
                    self.transaction_sender,
                )?;
                if let Some(callback) = self.deliver_callback {
                    process.set_deliver_callback(callback);
                }
                if let Some(callback) = self.validation_callback {
                    process.set_validation_callback(callback);
                }
                if let Some(callback) = self.get_mode_callback {
                    process.set_get_dbrb_mode_callback(callback);
                }
                process.set_message_sender(message_sender.clone());

                if let Some(outbound) = process.take_outbound() {
                    shutdown_manager.add_handle(tokio::spawn(forward_outbound(
                        outbound,
                        message_sender.clone(),
                    )));
                }
                shutdown_manager
                    .add_handle(tokio::spawn(process.run(shutdown_manager.subscribe())));

                handle.update_view(now);
                DbrbContainer::Sharded(handle)
            }
        };

        let dispatcher = InboundDispatcher::new(container.message_sink());

        Ok(DbrbNode {
            container,
            dispatcher,
            shutdown_handle,
            shutdown_manager,
        })
    }
}

/// Moves signed packets from an engine to the transport worker.
async fn forward_outbound(
    mut outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    message_sender: MessageSender,
) {
    while let Some(entry) = outbound.recv().await {
        message_sender.enqueue(entry.packet, entry.recipients);
    }
}
