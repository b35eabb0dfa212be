//! The flat DBRB engine.
//!
//! One [`DbrbProcess`] owns all protocol state of this node: the current
//! view, the per-payload broadcast data and the reconfiguration machinery.
//! State is mutated only from the engine's run loop, which consumes a
//! command channel; public entry points post commands through [`DbrbHandle`]
//! and return immediately. This realises the serial-executor model: handlers
//! run to completion on the loop task and need no locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::api::{
    DbrbMode, DeliverCallback, GetDbrbModeCallback, ValidationCallback,
};
use crate::config::{ConfigurationError, DbrbConfig};
use crate::core::Shutdown;
use crate::utilities::crypto::{Keypair, ProcessId};
use crate::membership::{
    self, MembershipChange, MembershipState, PendingChanges, TransactionSender, ViewFetcher,
};
use crate::message::{
    codec, Certificate, InstallMessageData, Message, Payload, PrepareMessage, ProcessState,
    ReconfigMessage,
};
use crate::network::MessageSink;
use crate::process::state::BroadcastData;
use crate::quorum::QuorumManager;
use crate::signing::PayloadSigner;
use crate::utilities::hash::HashType;
use crate::utilities::time::DbrbTime;
use crate::view::{Sequence, View, ViewData};

pub(crate) mod broadcast;
pub(crate) mod reconfig;
pub(crate) mod state;

/// Broadcast entries older than this are considered stale and purged by
/// `clear_broadcast_data`.
const STALE_BROADCAST_AGE_MS: u64 = 600_000;

/// A signed packet waiting to be handed to the transport.
#[derive(Debug)]
pub struct OutboundPacket {
    pub packet: Bytes,
    pub recipients: ViewData,
}

#[derive(Debug)]
pub(crate) enum Command {
    Broadcast(Payload),
    Leave,
    Message(Box<Message>),
    ClearBroadcastData,
    ViewDiscovered(ViewData),
    UpdateView { now: u64 },
}

/// Cheap cloneable front of a [`DbrbProcess`]. Every call posts onto the
/// engine's executor and returns immediately.
#[derive(Clone)]
pub struct DbrbHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DbrbHandle {
    /// Broadcast arbitrary `payload` into the system.
    pub fn broadcast(&self, payload: Payload) {
        self.post(Command::Broadcast(payload));
    }

    /// Request to leave the system.
    pub fn leave(&self) {
        self.post(Command::Leave);
    }

    pub fn process_message(&self, message: Message) {
        self.post(Command::Message(Box::new(message)));
    }

    /// Purge delivered and stale broadcast entries.
    pub fn clear_broadcast_data(&self) {
        self.post(Command::ClearBroadcastData);
    }

    /// Inject an externally discovered membership.
    pub fn on_view_discovered(&self, view: ViewData) {
        self.post(Command::ViewDiscovered(view));
    }

    /// Refetch the view from the view fetcher and renew the registration if
    /// it is about to expire.
    pub fn update_view(&self, now: u64) {
        self.post(Command::UpdateView { now });
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("DBRB engine is gone, dropping command");
        }
    }
}

impl MessageSink for DbrbHandle {
    fn post(&self, message: Message) {
        self.process_message(message);
    }
}

/// An Install this process is waiting to complete with a quorum of state
/// updates.
#[derive(Debug)]
pub(crate) struct PendingInstall {
    pub(crate) data: InstallMessageData,
    pub(crate) converged_signatures: Certificate,
}

pub struct DbrbProcess {
    pub(crate) id: ProcessId,
    pub(crate) signer: PayloadSigner,
    pub(crate) config: DbrbConfig,

    pub(crate) membership_state: MembershipState,
    pub(crate) current_view: View,
    pub(crate) current_view_installed: bool,
    /// While set, no Prepare, Commit or Reconfig messages are processed.
    pub(crate) limited_processing: bool,
    /// Cleared when conflicting Prepares were observed.
    pub(crate) acknowledge_allowed: bool,
    pub(crate) can_leave: bool,
    /// Keep disseminating Reconfig messages on every installed view while
    /// joining or leaving.
    pub(crate) disseminate_reconfig: bool,

    pub(crate) pending_changes: PendingChanges,
    pub(crate) proposed_sequences: HashMap<View, Sequence>,
    pub(crate) last_converged_sequences: HashMap<View, Sequence>,
    pub(crate) current_install: Option<PendingInstall>,

    pub(crate) broadcast_data: HashMap<HashType, BroadcastData>,
    pub(crate) state: ProcessState,
    pub(crate) quorum_manager: QuorumManager,
    pub(crate) bootstrap_view: View,

    pub(crate) view_fetcher: Arc<dyn ViewFetcher>,
    pub(crate) transaction_sender: Arc<dyn TransactionSender>,
    pub(crate) deliver_callback: Option<DeliverCallback>,
    pub(crate) validation_callback: Option<ValidationCallback>,
    pub(crate) get_mode_callback: Option<GetDbrbModeCallback>,

    pub(crate) outbound: mpsc::UnboundedSender<OutboundPacket>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundPacket>>,
    pub(crate) loopback: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl DbrbProcess {
    pub fn new(
        keypair: Arc<Keypair>,
        config: DbrbConfig,
        view_fetcher: Arc<dyn ViewFetcher>,
        transaction_sender: Arc<dyn TransactionSender>,
    ) -> Result<(DbrbProcess, DbrbHandle), ConfigurationError> {
        let bootstrap_view = config.bootstrap_view()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let process = DbrbProcess {
            id: keypair.process_id(),
            signer: PayloadSigner::new(keypair),
            config,
            membership_state: MembershipState::NotJoined,
            current_view: View::default(),
            current_view_installed: false,
            limited_processing: false,
            acknowledge_allowed: true,
            can_leave: false,
            disseminate_reconfig: false,
            pending_changes: PendingChanges::default(),
            proposed_sequences: HashMap::new(),
            last_converged_sequences: HashMap::new(),
            current_install: None,
            broadcast_data: HashMap::new(),
            state: ProcessState::default(),
            quorum_manager: QuorumManager::default(),
            bootstrap_view,
            view_fetcher,
            transaction_sender,
            deliver_callback: None,
            validation_callback: None,
            get_mode_callback: None,
            outbound: outbound_tx,
            outbound_rx: Some(outbound_rx),
            loopback: commands_tx.clone(),
            commands_rx: Some(commands_rx),
        };
        let handle = DbrbHandle {
            commands: commands_tx,
        };
        Ok((process, handle))
    }

    /// Installs the application deliver sink, invoked at most once per
    /// payload.
    pub fn set_deliver_callback(&mut self, callback: DeliverCallback) {
        self.deliver_callback = Some(callback);
    }

    pub fn set_validation_callback(&mut self, callback: ValidationCallback) {
        self.validation_callback = Some(callback);
    }

    pub fn set_get_dbrb_mode_callback(&mut self, callback: GetDbrbModeCallback) {
        self.get_mode_callback = Some(callback);
    }

    /// Stream of signed packets for the transport; taken once by the
    /// embedding node.
    pub fn take_outbound(&mut self) -> Option<mpsc::UnboundedReceiver<OutboundPacket>> {
        self.outbound_rx.take()
    }

    /// Main loop of the process: the serial executor all state mutations run
    /// on.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut commands = self
            .commands_rx
            .take()
            .expect("engine run loop started twice");

        log::info!("Starting DBRB process {}", self.id);
        let mut resend = tokio::time::interval(Duration::from_millis(
            self.config.resend_messages_interval_ms.max(1),
        ));
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command),
                _ = resend.tick() => self.resend_stalled_broadcasts(),
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down DBRB process {}", self.id);
                    break;
                }
            }
        }
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Broadcast(payload) => self.broadcast(payload),
            Command::Leave => self.leave(),
            Command::Message(message) => self.process_message(*message),
            Command::ClearBroadcastData => self.clear_broadcast_data(),
            Command::ViewDiscovered(view) => self.on_view_discovered(view),
            Command::UpdateView { now } => self.handle_update_view(now),
        }
    }

    pub(crate) fn process_message(&mut self, message: Message) {
        log::trace!(
            "received {} message from {}",
            message.packet_type(),
            message.sender()
        );
        match message {
            Message::Prepare(message) => self.on_prepare(message),
            Message::Acknowledged(message) => self.on_acknowledged(message),
            Message::Commit(message) => self.on_commit(message),
            Message::Deliver(message) => self.on_deliver(message),
            Message::ConfirmDeliver(message) => self.on_confirm_deliver(message),
            Message::Reconfig(message) => self.on_reconfig(message),
            Message::ReconfigConfirm(message) => self.on_reconfig_confirm(message),
            Message::Propose(message) => self.on_propose(message),
            Message::Converged(message) => self.on_converged(message),
            Message::Install(message) => self.on_install(message),
            Message::StateUpdate(message) => self.on_state_update(message),
            Message::ShardPrepare(_)
            | Message::ShardAcknowledged(_)
            | Message::ShardCommit(_)
            | Message::ShardDeliver(_) => {
                log::warn!("sharded message on a flat engine, dropping");
            }
        }
    }

    /// Whether Prepare, Commit and Reconfig handling is currently
    /// suspended, either by a view transition or by the application.
    pub(crate) fn is_limited_processing(&self) -> bool {
        if self.limited_processing {
            return true;
        }
        matches!(
            self.get_mode_callback.as_ref().map(|mode| mode()),
            Some(DbrbMode::LimitedProcessing)
        )
    }

    /// Hands `message` to every recipient. A self-addressed copy goes back
    /// through the command channel so it interleaves with other messages
    /// instead of bypassing them.
    pub(crate) fn disseminate(&mut self, message: Message, mut recipients: ViewData) {
        log::trace!(
            "disseminating {} to {} recipients",
            message.packet_type(),
            recipients.len()
        );
        if recipients.remove(&self.id)
            && self
                .loopback
                .send(Command::Message(Box::new(message.clone())))
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

    pub(crate) fn send(&mut self, message: Message, recipient: ProcessId) {
        self.disseminate(message, ViewData::from([recipient]));
    }

    /// A membership was discovered out of band (boot, or a refetch). The
    /// bootstrap set is always merged in.
    pub(crate) fn on_view_discovered(&mut self, data: ViewData) {
        if data.is_empty() {
            log::debug!("discovered view is empty");
            return;
        }

        let mut view = View::new(data);
        view.merge(&self.bootstrap_view);
        self.current_view = view;
        log::debug!(
            "current view ({}) is now set to {}",
            self.current_view.len(),
            self.current_view
        );

        if self.current_view.is_member(&self.id) {
            self.membership_state = MembershipState::Participating;
            self.current_view_installed = true;
            log::debug!("current view is now installed");
        } else if self.membership_state == MembershipState::Leaving {
            self.membership_state = MembershipState::Left;
        }

        if self.membership_state == MembershipState::NotJoined {
            self.membership_state = MembershipState::Joining;
            self.disseminate_reconfig = true;
        }

        if self.disseminate_reconfig {
            match self.membership_state {
                MembershipState::Joining => {
                    let message = ReconfigMessage {
                        sender: self.id,
                        process_id: self.id,
                        change: MembershipChange::Join,
                        view: self.current_view.clone(),
                    };
                    let recipients = self.current_view.members().clone();
                    self.disseminate(Message::Reconfig(message), recipients);
                }
                MembershipState::Leaving if self.current_view_installed => {
                    let message = ReconfigMessage {
                        sender: self.id,
                        process_id: self.id,
                        change: MembershipChange::Leave,
                        view: self.current_view.clone(),
                    };
                    let recipients = self.current_view.members().clone();
                    self.disseminate(Message::Reconfig(message), recipients);
                }
                _ => {}
            }
        }
    }

    fn handle_update_view(&mut self, now: u64) {
        let view = match membership::fetch_merged_view(self.view_fetcher.as_ref(), now) {
            Ok(view) => view,
            Err(err) => {
                log::error!("view update failed: {err}");
                return;
            }
        };

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

        self.on_view_discovered(view.into_members());
    }

    fn clear_broadcast_data(&mut self) {
        let now = DbrbTime::now();
        let before = self.broadcast_data.len();
        self.broadcast_data.retain(|_, data| {
            !data.delivered
                && !data.deliver_confirmed
                && now.saturating_sub(data.begin) <= STALE_BROADCAST_AGE_MS
        });
        log::debug!(
            "purged {} of {before} broadcast entries",
            before - self.broadcast_data.len()
        );
    }

    /// Periodic task: re-disseminate Prepare for every broadcast this
    /// process initiated whose certificate is not yet sealed.
    fn resend_stalled_broadcasts(&mut self) {
        if !self.current_view_installed
            || self.membership_state != MembershipState::Participating
        {
            return;
        }

        let now = DbrbTime::now();
        let interval = self.config.resend_messages_interval_ms;
        let stalled: Vec<Payload> = self
            .broadcast_data
            .values()
            .filter(|data| {
                data.certificate.is_empty()
                    && data.prepare_sender == Some(self.id)
                    && now.saturating_sub(data.begin) >= interval
            })
            .filter_map(|data| data.payload.clone())
            .collect();

        for payload in stalled {
            log::debug!("re-disseminating stalled broadcast in view {}", self.current_view);
            let message = PrepareMessage {
                sender: self.id,
                payload,
                view: self.current_view.clone(),
                bootstrap_view: self.bootstrap_view.clone(),
            };
            let recipients = self.current_view.members().clone();
            self.disseminate(Message::Prepare(message), recipients);
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use parking_lot::Mutex;

    use crate::membership::test::StaticViewFetcher;
    use crate::message::{AcknowledgedMessage, InstallMessage};
    use crate::signing;
    use crate::utilities::crypto::Signature;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingTransactionSender {
        pub(crate) add_process_transactions: Mutex<usize>,
        pub(crate) install_transactions: Mutex<Vec<InstallMessage>>,
    }

    impl TransactionSender for RecordingTransactionSender {
        fn send_add_dbrb_process_transaction(&self) {
            *self.add_process_transactions.lock() += 1;
        }

        fn send_install_message_transaction(&self, install: &InstallMessage) {
            self.install_transactions.lock().push(install.clone());
        }

        fn send_remove_dbrb_process_by_network_transaction(
            &self,
            _id: &ProcessId,
            _timestamp: u64,
            _votes: Vec<ProcessId>,
        ) {
        }
    }

    /// A flat engine driven synchronously: commands loop back through the
    /// taken command channel, outbound packets are captured and decoded.
    pub(crate) struct TestProcess {
        pub(crate) engine: DbrbProcess,
        commands: mpsc::UnboundedReceiver<Command>,
        outbound: mpsc::UnboundedReceiver<OutboundPacket>,
        pub(crate) delivered: Arc<Mutex<Vec<Payload>>>,
        pub(crate) transactions: Arc<RecordingTransactionSender>,
    }

    impl TestProcess {
        pub(crate) fn new(keypair: Arc<Keypair>, view: View) -> TestProcess {
            Self::with_bootstrap(keypair, view, View::default())
        }

        pub(crate) fn with_bootstrap(
            keypair: Arc<Keypair>,
            view: View,
            bootstrap: View,
        ) -> TestProcess {
            let fetcher = Arc::new(StaticViewFetcher::new(view.clone(), bootstrap.clone()));
            let transactions = Arc::new(RecordingTransactionSender::default());
            let config = DbrbConfig {
                bootstrap_processes: bootstrap.members().iter().map(ProcessId::to_hex).collect(),
                ..DbrbConfig::default()
            };

            let (mut engine, _handle) =
                DbrbProcess::new(keypair, config, fetcher, transactions.clone()).unwrap();
            let commands = engine.commands_rx.take().unwrap();
            let outbound = engine.outbound_rx.take().unwrap();

            let delivered = Arc::new(Mutex::new(Vec::new()));
            let sink = delivered.clone();
            engine.set_deliver_callback(Box::new(move |payload| sink.lock().push(payload)));

            engine.on_view_discovered(view.into_members());

            let mut process = TestProcess {
                engine,
                commands,
                outbound,
                delivered,
                transactions,
            };
            process.pump();
            process
        }

        /// Runs queued self-addressed messages to completion.
        pub(crate) fn pump(&mut self) {
            while let Ok(command) = self.commands.try_recv() {
                self.engine.handle_command(command);
            }
        }

        pub(crate) fn broadcast(&mut self, payload: Payload) {
            self.engine.broadcast(payload);
            self.pump();
        }

        pub(crate) fn handle(&mut self, message: Message) {
            self.engine.process_message(message);
            self.pump();
        }

        /// Decoded outbound traffic since the last call.
        pub(crate) fn sent(&mut self) -> Vec<(Message, ViewData)> {
            let mut sent = Vec::new();
            while let Ok(entry) = self.outbound.try_recv() {
                let decoded = codec::decode(entry.packet).unwrap();
                sent.push((decoded.message, entry.recipients));
            }
            sent
        }
    }

    pub(crate) fn keypairs(count: usize) -> Vec<Arc<Keypair>> {
        (0..count)
            .map(|seed| Arc::new(Keypair::generate(Some(100 + seed as u64))))
            .collect()
    }

    pub(crate) fn view_of_keypairs(keypairs: &[Arc<Keypair>]) -> View {
        keypairs.iter().map(|keypair| keypair.process_id()).collect()
    }

    pub(crate) fn acknowledged_from(
        keypair: &Keypair,
        payload: &Payload,
        view: &View,
    ) -> AcknowledgedMessage {
        AcknowledgedMessage {
            sender: keypair.process_id(),
            payload_hash: crate::utilities::hash::Sha3Hasher::digest_buffers(&[payload]),
            view: view.clone(),
            payload_signature: payload_signature(keypair, payload, view),
        }
    }

    pub(crate) fn payload_signature(
        keypair: &Keypair,
        payload: &Payload,
        view: &View,
    ) -> Signature {
        keypair.sign(signing::payload_digest(payload, view).as_bytes())
    }
}
