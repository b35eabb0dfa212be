//! The view-reconfiguration cascade: Reconfig → Propose → Converged →
//! Install → StateUpdate.

use std::collections::HashMap;

use crate::membership::{MembershipChange, MembershipState, PendingChanges};
use crate::message::{
    Certificate, CommitMessage, ConvergedMessage, InstallMessage, InstallMessageData, Message,
    PrepareMessage, ProposeMessage, ReconfigConfirmMessage, ReconfigMessage, StateUpdateMessage,
};
use crate::process::broadcast::member_union;
use crate::process::{DbrbProcess, PendingInstall};
use crate::signing;
use crate::utilities::hash::HashType;
use crate::view::{Sequence, View};

impl DbrbProcess {
    pub(crate) fn on_reconfig(&mut self, message: ReconfigMessage) {
        if self.is_limited_processing() {
            log::debug!("Reconfig: aborting, limited processing is enabled");
            return;
        }
        if message.view != self.current_view {
            log::debug!(
                "Reconfig: aborting, supplied view {} does not match current view {}",
                message.view,
                self.current_view
            );
            return;
        }

        // The requested change must not already be reflected in the view.
        match message.change {
            MembershipChange::Join => {
                if message.view.is_member(&message.process_id) {
                    log::debug!(
                        "Reconfig: aborting, {} already joined {}",
                        message.process_id,
                        message.view
                    );
                    return;
                }
            }
            MembershipChange::Leave => {
                if !message.view.is_member(&message.process_id) {
                    log::debug!(
                        "Reconfig: aborting, no corresponding join of {} in {}",
                        message.process_id,
                        message.view
                    );
                    return;
                }
            }
        }

        let confirm = ReconfigConfirmMessage {
            sender: self.id,
            view: message.view.clone(),
        };
        self.send(Message::ReconfigConfirm(confirm), message.sender);

        let changes: PendingChanges = [(message.process_id, message.change)].into_iter().collect();
        self.extend_pending_changes(changes);
    }

    /// Accumulates `changes` and, while a view is installed, proposes the
    /// membership they produce.
    pub(crate) fn extend_pending_changes(&mut self, changes: PendingChanges) {
        self.pending_changes.merge(&changes);
        log::debug!("Reconfig: {} pending changes", self.pending_changes.len());

        if !self.current_view_installed {
            return;
        }

        let new_view = self.pending_changes.applied_to(&self.current_view);
        if new_view == self.current_view {
            return;
        }

        let mut proposed_sequence = Sequence::default();
        proposed_sequence.try_append(&new_view);
        self.proposed_sequences
            .insert(self.current_view.clone(), proposed_sequence.clone());
        log::debug!(
            "Reconfig: proposing sequence {proposed_sequence} to replace {}",
            self.current_view
        );

        let propose = ProposeMessage {
            sender: self.id,
            proposed_sequence,
            replaced_view: self.current_view.clone(),
        };
        let recipients = self.current_view.members().clone();
        self.disseminate(Message::Propose(propose), recipients);
    }

    pub(crate) fn on_reconfig_confirm(&mut self, message: ReconfigConfirmMessage) {
        let quorum_collected = self.quorum_manager.update_reconfig_confirm(&message);
        if quorum_collected {
            self.on_reconfig_confirm_quorum_collected();
        }
    }

    fn on_reconfig_confirm_quorum_collected(&mut self) {
        log::debug!("ReconfigConfirm: quorum collected");
        if self.membership_state == MembershipState::Joining
            || self.membership_state == MembershipState::Leaving
        {
            log::debug!("ReconfigConfirm: disabling Reconfig dissemination");
            self.disseminate_reconfig = false;
        }
    }

    pub(crate) fn on_propose(&mut self, message: ProposeMessage) {
        if !message.replaced_view.is_member(&message.sender) {
            log::debug!("Propose: aborting, sender is not a member of the replaced view");
            return;
        }
        let Some(least_recent) = message.proposed_sequence.maybe_least_recent() else {
            log::debug!("Propose: aborting, proposed sequence is empty");
            return;
        };
        // A proposal must actually move the membership somewhere.
        if *least_recent == message.replaced_view
            || message
                .proposed_sequence
                .data()
                .contains(&message.replaced_view)
        {
            log::debug!("Propose: aborting, proposed sequence is not more recent");
            return;
        }

        let current_sequence = self
            .proposed_sequences
            .entry(message.replaced_view.clone())
            .or_default();
        log::debug!(
            "Propose: local sequence for {} is {current_sequence}, proposed {}",
            message.replaced_view,
            message.proposed_sequence
        );

        if current_sequence.can_merge(&message.proposed_sequence) {
            current_sequence.try_merge(&message.proposed_sequence);
        } else {
            // Conflicting proposals converge on the union of their most
            // recent views, appended to the last converged sequence.
            log::debug!("Propose: sequences are conflicting");
            let local_most_recent = current_sequence
                .maybe_most_recent()
                .cloned()
                .unwrap_or_default();
            let proposed_most_recent = message
                .proposed_sequence
                .maybe_most_recent()
                .cloned()
                .unwrap_or_default();
            let merged_view = View::merged(&local_most_recent, &proposed_most_recent);

            let mut last_converged = self
                .last_converged_sequences
                .get(&message.replaced_view)
                .cloned()
                .unwrap_or_default();
            last_converged.try_append(&merged_view);
            self.proposed_sequences
                .insert(message.replaced_view.clone(), last_converged);
        }

        let quorum_collected = self.quorum_manager.update_propose(&message);
        if quorum_collected {
            self.on_propose_quorum_collected(&message);
        }

        // A proposal received from self is already disseminated.
        if message.sender == self.id {
            return;
        }

        let Some(updated_sequence) = self.proposed_sequences.get(&message.replaced_view).cloned()
        else {
            return;
        };
        let mut recipients = message.replaced_view.members().clone();
        if let Some(already_counted) = self
            .quorum_manager
            .proposed_processes(&message.replaced_view, &message.proposed_sequence)
        {
            for id in already_counted {
                recipients.remove(id);
            }
        }
        log::debug!("Propose: re-disseminating merged sequence");
        let propose = ProposeMessage {
            sender: self.id,
            proposed_sequence: updated_sequence,
            replaced_view: message.replaced_view.clone(),
        };
        self.disseminate(Message::Propose(propose), recipients);
    }

    fn on_propose_quorum_collected(&mut self, message: &ProposeMessage) {
        log::debug!("Propose: quorum collected in view {}", message.replaced_view);
        self.last_converged_sequences.insert(
            message.replaced_view.clone(),
            message.proposed_sequence.clone(),
        );

        let digest = ConvergedMessage::signed_digest(
            &message.replaced_view,
            &message.proposed_sequence,
        );
        let converged = ConvergedMessage {
            sender: self.id,
            converged_sequence: message.proposed_sequence.clone(),
            replaced_view: message.replaced_view.clone(),
            signature: self.signer.sign_digest(&digest),
        };

        log::debug!("Propose: disseminating Converged message");
        let recipients = message.replaced_view.members().clone();
        self.disseminate(Message::Converged(converged), recipients);
    }

    pub(crate) fn on_converged(&mut self, message: ConvergedMessage) {
        if !message.replaced_view.is_member(&message.sender) {
            log::debug!("Converged: aborting, sender is not a member of the replaced view");
            return;
        }
        let digest =
            ConvergedMessage::signed_digest(&message.replaced_view, &message.converged_sequence);
        if !signing::verify_digest(&message.sender, &digest, &message.signature) {
            log::warn!(
                "Converged: rejected, invalid converged signature from {}",
                message.sender
            );
            return;
        }

        let quorum_collected = self.quorum_manager.update_converged(&message);
        if quorum_collected {
            self.on_converged_quorum_collected(&message);
        }
    }

    fn on_converged_quorum_collected(&mut self, message: &ConvergedMessage) {
        log::debug!("Converged: quorum collected in view {}", message.replaced_view);
        let Some(converged_signatures) = self
            .quorum_manager
            .converged_signatures(&message.replaced_view, &message.converged_sequence)
            .cloned()
        else {
            return;
        };

        let install = InstallMessage {
            sender: self.id,
            replaced_view: message.replaced_view.clone(),
            converged_sequence: message.converged_sequence.clone(),
            converged_signatures,
        };

        let most_recent_view = message
            .converged_sequence
            .maybe_most_recent()
            .cloned()
            .unwrap_or_default();
        let recipients = member_union(&message.replaced_view, &most_recent_view);
        log::debug!("Converged: disseminating Install to {} processes", recipients.len());
        self.disseminate(Message::Install(install), recipients);
    }

    pub(crate) fn on_install(&mut self, message: InstallMessage) {
        let Some(data) = message.try_get_message_data() else {
            log::warn!("Install: message is ill-formed");
            return;
        };

        // An Install is only as good as its converged-signature quorum.
        if message.converged_signatures.len() < data.replaced_view.quorum_size() {
            log::warn!("Install: rejected, not enough converged signatures");
            return;
        }
        let digest =
            ConvergedMessage::signed_digest(&data.replaced_view, &data.converged_sequence);
        for (signer, signature) in &message.converged_signatures {
            if !data.replaced_view.is_member(signer) {
                log::warn!("Install: rejected, signer {signer} is not in the replaced view");
                return;
            }
            if !signing::verify_digest(signer, &digest, signature) {
                log::warn!("Install: rejected, invalid converged signature of {signer}");
                return;
            }
        }

        if data.replaced_view.is_member(&self.id) {
            if self.current_view != data.most_recent_view {
                // Stop processing Prepare, Commit and Reconfig messages
                // until the transition completes.
                self.limited_processing = true;
            }

            let state_update = StateUpdateMessage {
                sender: self.id,
                state: self.state.clone(),
                view: data.replaced_view.clone(),
                pending_changes: self.pending_changes.clone(),
            };
            let recipients = member_union(&data.replaced_view, &data.most_recent_view);
            self.disseminate(Message::StateUpdate(state_update), recipients);
        }

        if self.current_view != data.most_recent_view {
            log::debug!("Install: preparing for state updates");
            self.prepare_for_state_updates(data, message.converged_signatures);
        }
    }

    fn prepare_for_state_updates(
        &mut self,
        data: InstallMessageData,
        converged_signatures: Certificate,
    ) {
        let replaced_view = data.replaced_view.clone();
        self.current_install = Some(PendingInstall {
            data,
            converged_signatures,
        });

        // State updates may already have reached a quorum before the
        // Install arrived.
        if self.quorum_manager.state_updates(&replaced_view).len() >= replaced_view.quorum_size() {
            self.on_state_update_quorum_collected();
        }
    }

    pub(crate) fn on_state_update(&mut self, message: StateUpdateMessage) {
        if !message.view.is_member(&message.sender) {
            log::debug!("StateUpdate: aborting, sender is not in supplied view");
            return;
        }

        let triggered = self.quorum_manager.update_state_update(message.clone());
        let quorum_collected = triggered
            && matches!(
                &self.current_install,
                Some(install) if install.data.replaced_view == message.view
            );
        if quorum_collected {
            self.on_state_update_quorum_collected();
        }
    }

    fn on_state_update_quorum_collected(&mut self) {
        let Some(install) = self.current_install.take() else {
            return;
        };
        let replaced_view = install.data.replaced_view.clone();
        let most_recent_view = install.data.most_recent_view.clone();
        log::debug!("StateUpdate: quorum collected in view {replaced_view}");

        let collected: Vec<StateUpdateMessage> = self
            .quorum_manager
            .state_updates(&replaced_view)
            .into_iter()
            .cloned()
            .collect();

        // Reconfig requests travelling inside the state updates; changes the
        // new view already absorbed are dropped.
        let mut requested = PendingChanges::default();
        for state_update in &collected {
            requested.merge(&state_update.pending_changes);
        }
        requested.subtract_absorbed(&most_recent_view);
        self.pending_changes.merge(&requested);
        self.pending_changes.subtract_absorbed(&most_recent_view);

        // Uninstall the current view for the duration of the switch.
        self.current_view_installed = false;

        self.update_state(&collected);

        log::debug!("StateUpdate: most recent view is {most_recent_view}");
        if most_recent_view.is_member(&self.id) {
            let joined = !replaced_view.is_member(&self.id);
            self.current_view = most_recent_view;
            log::debug!("StateUpdate: current view advanced to {}", self.current_view);

            if joined {
                self.on_join_complete();
            }

            // A deeper proposal for the new view keeps the reconfiguration
            // running; otherwise the transition is complete.
            let deeper = self
                .proposed_sequences
                .get(&self.current_view)
                .filter(|sequence| !sequence.is_empty())
                .cloned();
            match deeper {
                Some(proposed_sequence) => {
                    let propose = ProposeMessage {
                        sender: self.id,
                        proposed_sequence,
                        replaced_view: self.current_view.clone(),
                    };
                    let recipients = self.current_view.members().clone();
                    self.disseminate(Message::Propose(propose), recipients);
                }
                None => {
                    self.current_view_installed = true;

                    let install_message = InstallMessage {
                        sender: self.id,
                        replaced_view: install.data.replaced_view.clone(),
                        converged_sequence: install.data.converged_sequence.clone(),
                        converged_signatures: install.converged_signatures.clone(),
                    };
                    self.transaction_sender
                        .send_install_message_transaction(&install_message);
                    log::debug!("StateUpdate: sent install message transaction");

                    let installed_view = self.current_view.clone();
                    self.on_view_installed(installed_view);
                }
            }
        } else {
            self.on_leave_complete();
        }
    }

    /// Reconciles the local process state from a quorum of state updates.
    ///
    /// A single acknowledgeable payload across the quorum may be adopted;
    /// two distinct payloads mark the broadcast irreconcilable and disable
    /// acknowledging. A stored commit with a certificate that verifies
    /// against a locally held payload may be adopted as stored.
    fn update_state(&mut self, messages: &[StateUpdateMessage]) {
        let mut payloads: HashMap<HashType, PrepareMessage> = HashMap::new();
        let mut stored_commits: Vec<CommitMessage> = Vec::new();

        for message in messages {
            if let Some(acknowledgeable) = &message.state.acknowledgeable {
                payloads
                    .entry(acknowledgeable.payload_hash())
                    .or_insert_with(|| acknowledgeable.clone());
            }
            if let Some(conflicting) = &message.state.conflicting {
                payloads
                    .entry(conflicting.payload_hash())
                    .or_insert_with(|| conflicting.clone());
            }

            if let Some(stored) = &message.state.stored {
                if self.stored_commit_is_valid(stored) {
                    stored_commits.push(stored.clone());
                }
            }
        }

        if payloads.len() == 1 && self.acknowledge_allowed {
            if self.state.acknowledgeable.is_none() {
                log::debug!("StateUpdate: adopting acknowledgeable payload");
                self.state.acknowledgeable = payloads.into_values().next();
            }
        } else if payloads.len() > 1 {
            log::warn!("StateUpdate: conflicting payloads across state updates");
            self.acknowledge_allowed = false;
            let conflicting = self
                .state
                .acknowledgeable
                .take()
                .or_else(|| payloads.into_values().next());
            if self.state.conflicting.is_none() {
                self.state.conflicting = conflicting;
            }
        }

        if self.state.stored.is_none() {
            if let Some(first) = stored_commits.into_iter().next() {
                log::debug!("StateUpdate: adopting stored commit");
                self.state.stored = Some(first);
            }
        }
    }

    fn stored_commit_is_valid(&mut self, stored: &CommitMessage) -> bool {
        let Some(payload) = self
            .broadcast_data
            .get(&stored.payload_hash)
            .and_then(|data| data.payload.clone())
        else {
            return false;
        };
        if stored.certificate.len() < stored.certificate_view.quorum_size() {
            return false;
        }
        stored.certificate.iter().all(|(signer, signature)| {
            stored.certificate_view.is_member(signer)
                && self
                    .signer
                    .verify_payload(signer, &payload, &stored.certificate_view, signature)
        })
    }

    /// Resume normal processing under `new_view` and restart whatever the
    /// transition interrupted.
    pub(crate) fn on_view_installed(&mut self, new_view: View) {
        log::debug!("view installed: {new_view}");
        self.limited_processing = false;

        // Pending changes not yet absorbed start the next round.
        if !self.pending_changes.is_empty() && !self.proposed_sequences.contains_key(&new_view) {
            let merged_view = self.pending_changes.applied_to(&new_view);
            if merged_view != new_view {
                let mut proposed_sequence = Sequence::default();
                proposed_sequence.try_append(&merged_view);
                self.proposed_sequences
                    .insert(new_view.clone(), proposed_sequence.clone());

                let propose = ProposeMessage {
                    sender: self.id,
                    proposed_sequence,
                    replaced_view: new_view.clone(),
                };
                let recipients = new_view.members().clone();
                self.disseminate(Message::Propose(propose), recipients);
            }
        }

        // Re-disseminate broadcasts the transition left unfinished: our own
        // Prepares without a sealed certificate, and the stored Commit of an
        // undelivered payload.
        let stalled: Vec<PrepareMessage> = self
            .broadcast_data
            .values()
            .filter(|data| data.certificate.is_empty() && data.prepare_sender == Some(self.id))
            .filter_map(|data| {
                data.payload.as_ref().map(|payload| PrepareMessage {
                    sender: self.id,
                    payload: payload.clone(),
                    view: new_view.clone(),
                    bootstrap_view: self.bootstrap_view.clone(),
                })
            })
            .collect();
        for prepare in stalled {
            let recipients = new_view.members().clone();
            self.disseminate(Message::Prepare(prepare), recipients);
        }

        if let Some(stored) = self.state.stored.clone() {
            let delivered = self
                .broadcast_data
                .get(&stored.payload_hash)
                .map(|data| data.delivered)
                .unwrap_or(false);
            if !delivered {
                let commit = CommitMessage {
                    sender: self.id,
                    payload_hash: stored.payload_hash,
                    certificate: stored.certificate.clone(),
                    certificate_view: stored.certificate_view.clone(),
                    current_view: new_view.clone(),
                };
                let recipients = new_view.members().clone();
                self.disseminate(Message::Commit(commit), recipients);
            }
        }

        // A leaving process keeps requesting departure under every new view.
        if self.membership_state == MembershipState::Leaving {
            log::debug!("view installed: node is leaving");
            let reconfig = ReconfigMessage {
                sender: self.id,
                process_id: self.id,
                change: MembershipChange::Leave,
                view: new_view.clone(),
            };
            let recipients = new_view.members().clone();
            self.disseminate(Message::Reconfig(reconfig), recipients);
        }
    }

    fn on_join_complete(&mut self) {
        log::debug!("join completed, node is now participating");
        self.disseminate_reconfig = false;
        self.membership_state = MembershipState::Participating;
        self.quorum_manager.clear_reconfig_confirm();
        self.pending_changes.clear();
    }

    pub(crate) fn on_leave_complete(&mut self) {
        log::debug!("leave completed, node has left the system");
        self.disseminate_reconfig = false;
        self.membership_state = MembershipState::Left;
        self.quorum_manager.clear_reconfig_counters();
        self.pending_changes.clear();
    }
}
