//! The sharded DBRB engine.
//!
//! Runs the adapted Prepare/Acknowledged/Commit/Deliver flow over the tree
//! overlay: Prepares flow down the tree, acknowledge certificates aggregate
//! back up shard by shard, Commits flood the neighbourhoods and Deliver
//! certificates are exchanged on demand between neighbours.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::{
    DbrbMode, DeliverCallback, GetDbrbModeCallback, ValidationCallback, ValidationResult,
};
use crate::config::{ConfigurationError, DbrbConfig};
use crate::core::Shutdown;
use crate::utilities::crypto::{Keypair, ProcessId};
use crate::membership::{self, TransactionSender, ViewFetcher};
use crate::message::{
    codec, Message, PacketType, Payload, ShardAcknowledgedMessage, ShardCommitMessage,
    ShardDeliverMessage, ShardPrepareMessage,
};
use crate::network::{MessageSender, MessageSink};
use crate::process::OutboundPacket;
use crate::shard::data::{DeliverCertificateState, ShardBroadcastData};
use crate::shard::{create_shard, create_tree_view};
use crate::signing::PayloadSigner;
use crate::utilities::hash::{HashType, Sha3Hasher};
use crate::utilities::time::DbrbTime;
use crate::view::{View, ViewData};

#[derive(Debug)]
pub(crate) enum ShardCommand {
    Broadcast { payload: Payload, recipients: ViewData },
    Message(Box<Message>),
    UpdateView { now: u64 },
    ClearData,
}

/// Cheap cloneable front of a [`ShardedDbrbProcess`].
#[derive(Clone)]
pub struct ShardedDbrbHandle {
    commands: mpsc::UnboundedSender<ShardCommand>,
}

impl ShardedDbrbHandle {
    /// Broadcast `payload` to `recipients` through the tree overlay.
    pub fn broadcast(&self, payload: Payload, recipients: ViewData) {
        self.post(ShardCommand::Broadcast {
            payload,
            recipients,
        });
    }

    pub fn process_message(&self, message: Message) {
        self.post(ShardCommand::Message(Box::new(message)));
    }

    /// Refetch the view and renew this process' registration if needed.
    pub fn update_view(&self, now: u64) {
        self.post(ShardCommand::UpdateView { now });
    }

    pub fn clear_data(&self) {
        self.post(ShardCommand::ClearData);
    }

    fn post(&self, command: ShardCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("sharded DBRB engine is gone, dropping command");
        }
    }
}

impl MessageSink for ShardedDbrbHandle {
    fn post(&self, message: Message) {
        self.process_message(message);
    }
}

pub struct ShardedDbrbProcess {
    id: ProcessId,
    signer: PayloadSigner,
    config: DbrbConfig,
    shard_size: usize,

    current_view: View,
    broadcast_data: HashMap<HashType, ShardBroadcastData>,
    bootstrap_view: View,

    view_fetcher: Arc<dyn ViewFetcher>,
    transaction_sender: Arc<dyn TransactionSender>,
    deliver_callback: Option<DeliverCallback>,
    validation_callback: Option<ValidationCallback>,
    get_mode_callback: Option<GetDbrbModeCallback>,

    /// Transport handle, used for reachability bookkeeping; absent in tests.
    message_sender: Option<MessageSender>,

    outbound: mpsc::UnboundedSender<OutboundPacket>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundPacket>>,
    loopback: mpsc::UnboundedSender<ShardCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ShardCommand>>,
}

impl ShardedDbrbProcess {
    pub fn new(
        keypair: Arc<Keypair>,
        config: DbrbConfig,
        shard_size: usize,
        view_fetcher: Arc<dyn ViewFetcher>,
        transaction_sender: Arc<dyn TransactionSender>,
    ) -> Result<(ShardedDbrbProcess, ShardedDbrbHandle), ConfigurationError> {
        let bootstrap_view = config.bootstrap_view()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let process = ShardedDbrbProcess {
            id: keypair.process_id(),
            signer: PayloadSigner::new(keypair),
            config,
            shard_size,
            current_view: View::default(),
            broadcast_data: HashMap::new(),
            bootstrap_view,
            view_fetcher,
            transaction_sender,
            deliver_callback: None,
            validation_callback: None,
            get_mode_callback: None,
            message_sender: None,
            outbound: outbound_tx,
            outbound_rx: Some(outbound_rx),
            loopback: commands_tx.clone(),
            commands_rx: Some(commands_rx),
        };
        let handle = ShardedDbrbHandle {
            commands: commands_tx,
        };
        Ok((process, handle))
    }

    pub fn set_deliver_callback(&mut self, callback: DeliverCallback) {
        self.deliver_callback = Some(callback);
    }

    pub fn set_validation_callback(&mut self, callback: ValidationCallback) {
        self.validation_callback = Some(callback);
    }

    pub fn set_get_dbrb_mode_callback(&mut self, callback: GetDbrbModeCallback) {
        self.get_mode_callback = Some(callback);
    }

    /// Attach the transport handle so failed recipients feed the tree's
    /// reachability input.
    pub fn set_message_sender(&mut self, message_sender: MessageSender) {
        self.message_sender = Some(message_sender);
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Stream of signed packets for the transport; taken once by the
    /// embedding node.
    pub fn take_outbound(&mut self) -> Option<mpsc::UnboundedReceiver<OutboundPacket>> {
        self.outbound_rx.take()
    }

    /// Main loop; the serial executor all state mutations run on.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut commands = self
            .commands_rx
            .take()
            .expect("engine run loop started twice");

        log::info!("Starting sharded DBRB process {}", self.id);
        loop {
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command),
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down sharded DBRB process {}", self.id);
                    break;
                }
            }
        }
    }

    pub(crate) fn handle_command(&mut self, command: ShardCommand) {
        match command {
            ShardCommand::Broadcast {
                payload,
                recipients,
            } => self.broadcast(payload, recipients),
            ShardCommand::Message(message) => self.process_message(*message),
            ShardCommand::UpdateView { now } => self.update_view(now),
            ShardCommand::ClearData => self.clear_data(),
        }
    }

    pub(crate) fn process_message(&mut self, message: Message) {
        log::trace!(
            "received {} message from {}",
            message.packet_type(),
            message.sender()
        );
        match message {
            Message::ShardPrepare(message) => self.on_prepare(message),
            Message::ShardAcknowledged(message) => self.on_acknowledged(message),
            Message::ShardCommit(message) => self.on_commit(message),
            Message::ShardDeliver(message) => self.on_deliver(message),
            other => {
                log::warn!(
                    "{} message on a sharded engine, dropping",
                    other.packet_type()
                );
            }
        }
    }

    fn is_limited_processing(&self) -> bool {
        matches!(
            self.get_mode_callback.as_ref().map(|mode| mode()),
            Some(DbrbMode::LimitedProcessing)
        )
    }

    fn disseminate(&mut self, message: Message, mut recipients: ViewData) {
        if recipients.remove(&self.id)
            && self
                .loopback
                .send(ShardCommand::Message(Box::new(message.clone())))
                .is_err()
        {
            log::warn!("engine command channel closed, dropping self-addressed message");
        }

        if recipients.is_empty() {
            return;
        }
        let packet = codec::encode(&message, self.signer.keypair());
        if self
            .outbound
            .send(OutboundPacket { packet, recipients })
            .is_err()
        {
            log::warn!("outbound channel closed, dropping packet");
        }
    }

    fn send(&mut self, message: Message, recipient: ProcessId) {
        self.disseminate(message, ViewData::from([recipient]));
    }

    fn unreachable_among(&self, candidates: &ViewData) -> ViewData {
        match &self.message_sender {
            Some(sender) => sender.unreachable_nodes(candidates),
            None => ViewData::new(),
        }
    }

    /// Caller-initiated broadcast over `recipients`, which must be a
    /// subview of the current view containing this process.
    pub(crate) fn broadcast(&mut self, payload: Payload, recipients: ViewData) {
        let broadcast_view = View::new(recipients);
        if broadcast_view.is_empty() {
            log::debug!("broadcast: broadcast view is empty, aborting");
            return;
        }
        if !broadcast_view.is_subset_of(&self.current_view) {
            log::debug!(
                "broadcast: {} is not a subview of the current view {}, aborting",
                broadcast_view,
                self.current_view
            );
            return;
        }
        if !broadcast_view.is_member(&self.id) {
            log::debug!(
                "broadcast: not a member of the broadcast view, aborting"
            );
            return;
        }

        let payload_hash = Sha3Hasher::digest_buffers(&[&payload]);

        let mut reachable_nodes = broadcast_view.members().clone();
        reachable_nodes.remove(&self.id);
        let unreachable_nodes = self.unreachable_among(&reachable_nodes);
        for id in &unreachable_nodes {
            reachable_nodes.remove(id);
        }

        let tree = match create_tree_view(
            &reachable_nodes,
            &unreachable_nodes,
            &self.id,
            self.shard_size,
        ) {
            Ok(tree) => tree,
            Err(err) => {
                log::error!("broadcast: failed to create tree, aborting: {err}");
                return;
            }
        };
        let shard = match create_shard(&tree, &self.id, self.shard_size) {
            Ok(shard) => shard,
            Err(err) => {
                log::error!("broadcast: failed to create shard, aborting: {err}");
                return;
            }
        };

        let acknowledge_signature = self.signer.sign_shard_payload(
            PacketType::ShardAcknowledged,
            &payload,
            &tree,
        );
        let prepare_signature =
            self.signer
                .sign_shard_payload(PacketType::ShardPrepare, &payload, &tree);

        let data = self.broadcast_data.entry(payload_hash).or_default();
        data.begin = DbrbTime::now();
        data.payload = Some(payload.clone());
        data.broadcaster = self.id;
        data.broadcast_view = broadcast_view.clone();
        data.sub_tree_view = broadcast_view;
        data.parent_shard_quorum_size = 1;
        data.network_quorum_size = data.sub_tree_view.quorum_size();
        data.child_shard_quorum_size = data.network_quorum_size;
        data.tree = tree.clone();
        data.acknowledge_certificate
            .insert(self.id, acknowledge_signature);
        data.shard = shard;
        let children = data.shard.children.clone();

        log::debug!("broadcast: sending payload of {} bytes", payload.len());
        let prepare = ShardPrepareMessage {
            sender: self.id,
            payload,
            tree_view: tree,
            broadcaster_signature: prepare_signature,
        };
        self.disseminate(Message::ShardPrepare(prepare), children);
    }

    fn on_prepare(&mut self, message: ShardPrepareMessage) {
        if self.is_limited_processing() {
            log::debug!("ShardPrepare: aborting, limited processing is enabled");
            return;
        }
        if let Some(validate) = &self.validation_callback {
            if validate(&message.payload) != ValidationResult::Valid {
                log::debug!("ShardPrepare: aborting, application rejected payload");
                return;
            }
        }

        let view: View = message.tree_view.iter().copied().collect();
        if !view.is_subset_of(&self.current_view) {
            log::debug!(
                "ShardPrepare: aborting, supplied view is not a subview of the current view"
            );
            return;
        }
        if !view.is_member(&self.id) {
            log::debug!("ShardPrepare: aborting, node is not a participant");
            return;
        }

        let payload_hash = message.payload_hash();
        if self
            .broadcast_data
            .get(&payload_hash)
            .map(|data| data.payload.is_some())
            .unwrap_or(false)
        {
            log::debug!("ShardPrepare: message already processed");
            return;
        }

        let shard = match create_shard(&message.tree_view, &self.id, self.shard_size) {
            Ok(shard) => shard,
            Err(err) => {
                self.broadcast_data.remove(&payload_hash);
                log::debug!("ShardPrepare: aborting, failed to create shard: {err}");
                return;
            }
        };
        if shard.parent != Some(message.sender) {
            self.broadcast_data.remove(&payload_hash);
            log::debug!("ShardPrepare: aborting, sender is not this process' parent");
            return;
        }

        let broadcaster = message.tree_view[0];
        if !self.signer.verify_shard_payload(
            &broadcaster,
            PacketType::ShardPrepare,
            &message.payload,
            &message.tree_view,
            &message.broadcaster_signature,
        ) {
            log::warn!("ShardPrepare: rejected, invalid broadcaster signature");
            return;
        }

        let acknowledge_signature = self.signer.sign_shard_payload(
            PacketType::ShardAcknowledged,
            &message.payload,
            &message.tree_view,
        );

        let data = self.broadcast_data.entry(payload_hash).or_default();
        data.payload = Some(message.payload.clone());
        data.broadcaster = broadcaster;
        data.begin = DbrbTime::now();
        data.tree = message.tree_view.clone();
        data.broadcast_view = view;

        data.sub_tree_view.insert(self.id);
        let child_members: Vec<ProcessId> = shard
            .child_views
            .values()
            .flat_map(|members| members.iter().copied())
            .collect();
        for id in child_members {
            data.sub_tree_view.insert(id);
        }
        data.shard = shard;

        data.network_quorum_size = View::quorum_of(data.tree.len());
        data.parent_shard_quorum_size =
            View::quorum_of(data.tree.len() - data.sub_tree_view.len() + 1);
        data.child_shard_quorum_size = data.sub_tree_view.quorum_size();

        data.acknowledge_certificate
            .insert(self.id, acknowledge_signature);

        let mut acknowledge_to = None;
        if !data.acknowledged && data.acknowledge_certificate.len() >= data.child_shard_quorum_size
        {
            data.acknowledged = true;
            acknowledge_to = Some((message.sender, data.acknowledge_certificate.clone()));
        }
        let children = data.shard.children.clone();

        if let Some((parent, certificate)) = acknowledge_to {
            log::trace!("ShardPrepare: sending Acknowledged to parent {parent}");
            let acknowledged = ShardAcknowledgedMessage {
                sender: self.id,
                payload_hash,
                certificate,
            };
            self.send(Message::ShardAcknowledged(acknowledged), parent);
        }

        if !children.is_empty() {
            log::trace!("ShardPrepare: forwarding Prepare to children");
            let prepare = ShardPrepareMessage {
                sender: self.id,
                payload: message.payload,
                tree_view: message.tree_view,
                broadcaster_signature: message.broadcaster_signature,
            };
            self.disseminate(Message::ShardPrepare(prepare), children);
        }
    }

    fn on_acknowledged(&mut self, message: ShardAcknowledgedMessage) {
        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("ShardAcknowledged: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("ShardAcknowledged: aborting, no payload");
            return;
        };

        let Some(child_view) = data.shard.child_views.get(&message.sender) else {
            log::debug!("ShardAcknowledged: aborting, sender is not a child");
            return;
        };

        for (signer, signature) in &message.certificate {
            if !child_view.contains(signer) {
                log::warn!(
                    "ShardAcknowledged: rejected, signer {signer} outside the child's subtree"
                );
                return;
            }
            if !self.signer.verify_shard_payload(
                signer,
                PacketType::ShardAcknowledged,
                &payload,
                &data.tree,
                signature,
            ) {
                log::warn!("ShardAcknowledged: rejected, invalid signature of {signer}");
                return;
            }
        }
        for (signer, signature) in &message.certificate {
            data.acknowledge_certificate.insert(*signer, *signature);
        }

        if !data.acknowledged && data.acknowledge_certificate.len() < data.child_shard_quorum_size
        {
            return;
        }
        data.acknowledged = true;

        if self.id == data.broadcaster {
            if !data.commit_message_sent {
                data.commit_message_sent = true;
                let deliver_signature = self.signer.sign_shard_payload(
                    PacketType::ShardDeliver,
                    &payload,
                    &data.tree,
                );
                data.parent_shard_deliver_certificate
                    .insert(self.id, deliver_signature);
                data.child_shard_deliver_certificate
                    .insert(self.id, deliver_signature);

                let parent_certificate = data.parent_shard_deliver_certificate.clone();
                for id in data.shard.children.clone() {
                    data.parent_shard_deliver_recipients
                        .insert(id, DeliverCertificateState::new(parent_certificate.clone()));
                }

                let certificate = data.acknowledge_certificate.clone();
                let children = data.shard.children.clone();
                log::trace!("ShardAcknowledged: disseminating Commit");
                let commit = ShardCommitMessage {
                    sender: self.id,
                    payload_hash: message.payload_hash,
                    certificate,
                };
                self.disseminate(Message::ShardCommit(commit), children);
            }
        } else if let Some(parent) = data.shard.parent {
            let certificate = data.acknowledge_certificate.clone();
            log::trace!("ShardAcknowledged: forwarding certificate to parent {parent}");
            let acknowledged = ShardAcknowledgedMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                certificate,
            };
            self.send(Message::ShardAcknowledged(acknowledged), parent);
        }
    }

    fn on_commit(&mut self, message: ShardCommitMessage) {
        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("ShardCommit: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("ShardCommit: aborting, no payload");
            return;
        };

        if !data.shard.neighbours.contains(&message.sender) {
            log::debug!("ShardCommit: aborting, sender is not a neighbour");
            return;
        }
        if message.certificate.len() < data.network_quorum_size {
            log::debug!("ShardCommit: aborting, certificate is below network quorum");
            return;
        }
        for (signer, signature) in &message.certificate {
            if !data.broadcast_view.is_member(signer) {
                log::warn!("ShardCommit: rejected, invalid signer {signer}");
                return;
            }
            if !self.signer.verify_shard_payload(
                signer,
                PacketType::ShardAcknowledged,
                &payload,
                &data.tree,
                signature,
            ) {
                log::warn!("ShardCommit: rejected, invalid signature of {signer}");
                return;
            }
        }

        let mut commit_to_neighbours = None;
        if !data.commit_message_sent {
            data.commit_message_sent = true;
            let deliver_signature =
                self.signer
                    .sign_shard_payload(PacketType::ShardDeliver, &payload, &data.tree);
            data.parent_shard_deliver_certificate
                .insert(self.id, deliver_signature);
            data.child_shard_deliver_certificate
                .insert(self.id, deliver_signature);

            let child_certificate = data.child_shard_deliver_certificate.clone();
            if let Some(parent) = data.shard.parent {
                data.child_shard_deliver_recipients
                    .insert(parent, DeliverCertificateState::new(child_certificate.clone()));
            }
            for id in data.shard.siblings.clone() {
                data.child_shard_deliver_recipients
                    .insert(id, DeliverCertificateState::new(child_certificate.clone()));
            }
            let parent_certificate = data.parent_shard_deliver_certificate.clone();
            for id in data.shard.children.clone() {
                data.parent_shard_deliver_recipients
                    .insert(id, DeliverCertificateState::new(parent_certificate.clone()));
            }

            commit_to_neighbours = Some(data.shard.neighbours.clone());
        }

        // The sender asked for our deliver certificate of its side.
        let from_child_shard_side = data.shard.parent == Some(message.sender)
            || data.shard.siblings.contains(&message.sender);
        let parent_certificate_size = data.parent_shard_deliver_certificate.len();
        let child_certificate_size = data.child_shard_deliver_certificate.len();
        let network_quorum_collected = parent_certificate_size + child_certificate_size
            >= data.network_quorum_size + 1;
        let parent_quorum_size = data.parent_shard_quorum_size;
        let child_quorum_size = data.child_shard_quorum_size;

        let recipients = if from_child_shard_side {
            &mut data.child_shard_deliver_recipients
        } else {
            &mut data.parent_shard_deliver_recipients
        };
        let mut deliver_to_sender = None;
        if let Some(state) = recipients.get_mut(&message.sender) {
            if !state.quorum_collected {
                state.quorum_collected = if from_child_shard_side {
                    child_certificate_size >= child_quorum_size
                } else {
                    network_quorum_collected || parent_certificate_size >= parent_quorum_size
                };
            }
            state.requested = true;
            if state.quorum_collected && !state.certificate.is_empty() {
                deliver_to_sender = Some(state.certificate.clone());
                state.requested = false;
            }
        }

        if let Some(recipients) = commit_to_neighbours {
            log::trace!("ShardCommit: re-disseminating Commit to neighbours");
            let commit = ShardCommitMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                certificate: message.certificate.clone(),
            };
            self.disseminate(Message::ShardCommit(commit), recipients);
        }

        if let Some(certificate) = deliver_to_sender {
            log::trace!("ShardCommit: sending Deliver to {}", message.sender);
            let deliver = ShardDeliverMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                certificate,
            };
            self.send(Message::ShardDeliver(deliver), message.sender);
        }
    }

    fn on_deliver(&mut self, message: ShardDeliverMessage) {
        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("ShardDeliver: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("ShardDeliver: aborting, no payload");
            return;
        };

        if !data.shard.neighbours.contains(&message.sender) {
            log::debug!("ShardDeliver: aborting, sender is not a neighbour");
            return;
        }

        // Which side of the tree the signatures come from decides the
        // certificate they feed and the sub-view the signers must be in.
        let from_parent_side = data.shard.parent == Some(message.sender)
            || data.shard.siblings.contains(&message.sender);
        let expected_view = if data.shard.parent == Some(message.sender) {
            data.shard.parent_view.clone()
        } else if let Some(sibling_view) = data.shard.sibling_views.get(&message.sender) {
            sibling_view.clone()
        } else if let Some(child_view) = data.shard.child_views.get(&message.sender) {
            child_view.clone()
        } else {
            return;
        };

        for (signer, signature) in &message.certificate {
            if !expected_view.contains(signer) {
                log::warn!("ShardDeliver: rejected, invalid signer {signer}");
                return;
            }
            if !self.signer.verify_shard_payload(
                signer,
                PacketType::ShardDeliver,
                &payload,
                &data.tree,
                signature,
            ) {
                log::warn!("ShardDeliver: rejected, invalid signature of {signer}");
                return;
            }
        }

        // Parent-side signatures flow down to the children, child-side
        // signatures flow up to the parent and siblings.
        if from_parent_side {
            for (signer, signature) in &message.certificate {
                data.parent_shard_deliver_certificate
                    .insert(*signer, *signature);
                for state in data.parent_shard_deliver_recipients.values_mut() {
                    state.certificate.insert(*signer, *signature);
                }
            }
        } else {
            for (signer, signature) in &message.certificate {
                data.child_shard_deliver_certificate
                    .insert(*signer, *signature);
                for state in data.child_shard_deliver_recipients.values_mut() {
                    state.certificate.insert(*signer, *signature);
                }
            }
        }

        let parent_certificate_size = data.parent_shard_deliver_certificate.len();
        let child_certificate_size = data.child_shard_deliver_certificate.len();
        let network_quorum_collected = parent_certificate_size + child_certificate_size
            >= data.network_quorum_size + 1;

        let mut deliveries = Vec::new();
        for (id, state) in data.parent_shard_deliver_recipients.iter_mut() {
            if !state.quorum_collected {
                state.quorum_collected = network_quorum_collected
                    || parent_certificate_size >= data.parent_shard_quorum_size;
            }
            if state.requested && state.quorum_collected && !state.certificate.is_empty() {
                deliveries.push((*id, state.certificate.clone()));
                state.requested = false;
            }
        }
        for (id, state) in data.child_shard_deliver_recipients.iter_mut() {
            if !state.quorum_collected {
                state.quorum_collected = child_certificate_size >= data.child_shard_quorum_size;
            }
            if state.requested && state.quorum_collected && !state.certificate.is_empty() {
                deliveries.push((*id, state.certificate.clone()));
                state.requested = false;
            }
        }

        let mut deliver_payload = None;
        if !data.delivered && network_quorum_collected {
            data.delivered = true;
            deliver_payload = Some((payload, data.begin));
        }

        for (recipient, certificate) in deliveries {
            let deliver = ShardDeliverMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                certificate,
            };
            self.send(Message::ShardDeliver(deliver), recipient);
        }

        if let Some((payload, begin)) = deliver_payload {
            if let Some(deliver) = &mut self.deliver_callback {
                deliver(payload);
            }
            log::debug!(
                "sharded broadcast took {} ms to deliver",
                DbrbTime::now().saturating_sub(begin)
            );
        }
    }

    /// Refetches the membership, clears per-view state and renews this
    /// process' registration when required.
    pub(crate) fn update_view(&mut self, now: u64) {
        let mut view = match membership::fetch_merged_view(self.view_fetcher.as_ref(), now) {
            Ok(view) => view,
            Err(err) => {
                log::error!("view update failed: {err}");
                return;
            }
        };
        view.merge(&self.bootstrap_view);

        if let Some(message_sender) = &self.message_sender {
            message_sender.clear_queue();
            message_sender.clear_unreachable_nodes();
        }
        self.broadcast_data.clear();
        self.current_view = view;
        log::debug!(
            "current view ({}) is now set to {}",
            self.current_view.len(),
            self.current_view
        );

        match membership::registration_required(
            self.view_fetcher.as_ref(),
            &self.id,
            now,
            self.config.registration_grace_period_ms,
        ) {
            Ok(true) => {
                log::debug!("renewing DBRB registration of {}", self.id);
                self.transaction_sender.send_add_dbrb_process_transaction();
            }
            Ok(false) => {}
            Err(err) => log::error!("registration check failed: {err}"),
        }
    }

    fn clear_data(&mut self) {
        self.broadcast_data.clear();
    }
}
