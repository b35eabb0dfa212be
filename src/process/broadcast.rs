//! Prepare/Acknowledged/Commit/Deliver handlers of the flat engine.

use crate::api::ValidationResult;
use crate::membership::{MembershipChange, MembershipState};
use crate::message::{
    AcknowledgedMessage, CommitMessage, ConfirmDeliverMessage, DeliverMessage, Message, Payload,
    PrepareMessage, ReconfigMessage,
};
use crate::process::DbrbProcess;
use crate::utilities::time::DbrbTime;
use crate::view::View;

impl DbrbProcess {
    /// Caller-initiated broadcast. Succeeds only while a view is installed
    /// and this process is one of its members.
    pub(crate) fn broadcast(&mut self, payload: Payload) {
        if !self.current_view_installed {
            log::debug!("broadcast: current view is not installed, aborting");
            return;
        }
        if !self.current_view.is_member(&self.id) {
            log::debug!(
                "broadcast: not a member of the current view {}, aborting",
                self.current_view
            );
            return;
        }

        log::debug!("broadcast: sending payload of {} bytes", payload.len());
        let message = PrepareMessage {
            sender: self.id,
            payload,
            view: self.current_view.clone(),
            bootstrap_view: self.bootstrap_view.clone(),
        };
        let recipients = message.view.members().clone();
        self.disseminate(Message::Prepare(message), recipients);
    }

    /// Request to depart. Valid only while participating; Reconfig
    /// dissemination keeps running until a quorum confirms.
    pub(crate) fn leave(&mut self) {
        if self.membership_state != MembershipState::Participating {
            return;
        }

        self.membership_state = MembershipState::Leaving;

        if self.current_view_installed {
            let message = ReconfigMessage {
                sender: self.id,
                process_id: self.id,
                change: MembershipChange::Leave,
                view: self.current_view.clone(),
            };
            let recipients = self.current_view.members().clone();
            self.disseminate(Message::Reconfig(message), recipients);
        }

        self.disseminate_reconfig = true;
    }

    pub(crate) fn on_prepare(&mut self, message: PrepareMessage) {
        if self.membership_state != MembershipState::Participating {
            log::debug!("Prepare: aborting, node is not a participant");
            return;
        }
        if self.is_limited_processing() {
            log::debug!("Prepare: aborting, limited processing is enabled");
            return;
        }
        if let Some(validate) = &self.validation_callback {
            if validate(&message.payload) != ValidationResult::Valid {
                log::debug!("Prepare: aborting, application rejected payload");
                return;
            }
        }
        if !message.view.is_member(&message.sender) {
            log::debug!("Prepare: aborting, sender is not in supplied view");
            return;
        }
        if message.view != self.current_view {
            log::debug!(
                "Prepare: aborting, supplied view {} is not the current view {}",
                message.view,
                self.current_view
            );
            return;
        }

        let payload_hash = message.payload_hash();

        // A second Prepare with a different payload from a sender we already
        // committed to acknowledge poisons this process' acknowledgements.
        if let Some(acknowledgeable) = &self.state.acknowledgeable {
            if acknowledgeable.sender == message.sender
                && acknowledgeable.payload_hash() != payload_hash
            {
                log::warn!("Prepare: conflicting payload from {}", message.sender);
                self.acknowledge_allowed = false;
                if self.state.conflicting.is_none() {
                    self.state.conflicting = Some(message);
                }
                return;
            }
        }

        let data = self.broadcast_data.entry(payload_hash).or_default();
        if data.payload.is_some() {
            log::warn!("Prepare: duplicate payload from {}", message.sender);
            return;
        }
        data.begin = DbrbTime::now();
        data.payload = Some(message.payload.clone());
        data.prepare_sender = Some(message.sender);
        data.broadcast_view = message.view.clone();
        data.bootstrap_view = message.bootstrap_view.clone();

        if !self.acknowledge_allowed {
            log::debug!("Prepare: acknowledging is disabled");
            return;
        }
        if self.state.acknowledgeable.is_none() {
            log::debug!("Prepare: adopting payload as acknowledgeable");
            self.state.acknowledgeable = Some(message.clone());
        }

        log::debug!("Prepare: sending Acknowledged to {}", message.sender);
        let payload_signature = self
            .signer
            .sign_payload(&message.payload, &self.current_view);
        let acknowledged = AcknowledgedMessage {
            sender: self.id,
            payload_hash,
            view: self.current_view.clone(),
            payload_signature,
        };
        self.send(Message::Acknowledged(acknowledged), message.sender);
    }

    pub(crate) fn on_acknowledged(&mut self, message: AcknowledgedMessage) {
        if !message.view.is_member(&message.sender) {
            log::debug!("Acknowledged: aborting, sender is not in supplied view");
            return;
        }

        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("Acknowledged: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("Acknowledged: aborting, no payload");
            return;
        };

        if !self.signer.verify_payload(
            &message.sender,
            &payload,
            &message.view,
            &message.payload_signature,
        ) {
            log::warn!(
                "Acknowledged: rejected, invalid payload signature from {}",
                message.sender
            );
            return;
        }

        data.signatures.insert(
            (message.view.clone(), message.sender),
            message.payload_signature,
        );
        let quorum_collected = data.quorum_manager.update_acknowledged(&message);
        if quorum_collected && data.certificate.is_empty() {
            self.on_acknowledged_quorum_collected(&message);
        }
    }

    fn on_acknowledged_quorum_collected(&mut self, message: &AcknowledgedMessage) {
        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            return;
        };
        log::debug!("Acknowledged: quorum collected in view {}", message.view);

        data.certificate_view = message.view.clone();
        data.certificate.clear();
        let acknowledged = data
            .quorum_manager
            .acknowledged_payloads(&message.view)
            .cloned()
            .unwrap_or_default();
        for (process_id, payload_hash) in acknowledged {
            if payload_hash != message.payload_hash {
                continue;
            }
            if let Some(signature) = data
                .signatures
                .get(&(message.view.clone(), process_id))
            {
                data.certificate.insert(process_id, *signature);
            }
        }

        if !self.current_view_installed {
            log::debug!("Acknowledged: current view is not installed, holding Commit back");
            return;
        }

        log::debug!("Acknowledged: disseminating Commit");
        let commit = CommitMessage {
            sender: self.id,
            payload_hash: message.payload_hash,
            certificate: data.certificate.clone(),
            certificate_view: data.certificate_view.clone(),
            current_view: self.current_view.clone(),
        };
        let recipients = self.current_view.members().clone();
        self.disseminate(Message::Commit(commit), recipients);
    }

    pub(crate) fn on_commit(&mut self, message: CommitMessage) {
        if self.is_limited_processing() {
            log::debug!("Commit: aborting, limited processing is enabled");
            return;
        }
        if message.current_view != self.current_view {
            log::debug!("Commit: aborting, supplied view is not the current view");
            return;
        }

        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("Commit: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("Commit: aborting, no payload");
            return;
        };

        // The whole certificate must be valid: a quorum of certificate-view
        // members, every signature verifying against the payload.
        if message.certificate.len() < message.certificate_view.quorum_size() {
            log::warn!("Commit: rejected, certificate is below quorum size");
            return;
        }
        for (signer, signature) in &message.certificate {
            if !message.certificate_view.is_member(signer) {
                log::warn!("Commit: rejected, signer {signer} is not in certificate view");
                return;
            }
            if !self.signer.verify_payload(
                signer,
                &payload,
                &message.certificate_view,
                signature,
            ) {
                log::warn!("Commit: rejected, invalid signature of {signer}");
                return;
            }
        }

        let first_commit = !data.commit_message_received;
        if first_commit {
            data.commit_message_received = true;
            self.state.stored = Some(message.clone());

            log::debug!("Commit: re-disseminating under the current view");
            let commit = CommitMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                certificate: message.certificate.clone(),
                certificate_view: message.certificate_view.clone(),
                current_view: self.current_view.clone(),
            };
            let recipients = self.current_view.members().clone();
            self.disseminate(Message::Commit(commit), recipients);
        }

        // Delivery quorum accumulates at the Commit sender.
        log::debug!("Commit: sending Deliver to {}", message.sender);
        let deliver = DeliverMessage {
            sender: self.id,
            payload_hash: message.payload_hash,
            view: self.current_view.clone(),
        };
        self.send(Message::Deliver(deliver), message.sender);
    }

    pub(crate) fn on_deliver(&mut self, message: DeliverMessage) {
        if self.membership_state != MembershipState::Participating {
            log::debug!("Deliver: aborting, node is not a participant");
            return;
        }
        if !message.view.is_member(&message.sender) {
            log::debug!("Deliver: aborting, sender is not in supplied view");
            return;
        }

        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("Deliver: aborting, unknown broadcast");
            return;
        };
        let Some(payload) = data.payload.clone() else {
            log::debug!("Deliver: aborting, no payload");
            return;
        };

        let quorum_collected = data.quorum_manager.update_deliver(&message);
        if !quorum_collected || data.delivered {
            return;
        }
        data.delivered = true;
        let begin = data.begin;
        let bootstrap_view = if data.bootstrap_view.is_empty() {
            self.bootstrap_view.clone()
        } else {
            data.bootstrap_view.clone()
        };

        if let Some(deliver) = &mut self.deliver_callback {
            deliver(payload);
        }
        log::debug!(
            "broadcast took {} ms to deliver",
            DbrbTime::now().saturating_sub(begin)
        );
        self.on_leave_allowed();

        // Cross-check delivery against the bootstrap set.
        if !bootstrap_view.is_empty() {
            let confirm = ConfirmDeliverMessage {
                sender: self.id,
                payload_hash: message.payload_hash,
                view: self.current_view.clone(),
            };
            let recipients = bootstrap_view.into_members();
            self.disseminate(Message::ConfirmDeliver(confirm), recipients);
        }
    }

    pub(crate) fn on_confirm_deliver(&mut self, message: ConfirmDeliverMessage) {
        if !message.view.is_member(&message.sender) {
            log::debug!("ConfirmDeliver: aborting, sender is not in supplied view");
            return;
        }

        let bootstrap_view = self.bootstrap_view.clone();
        let Some(data) = self.broadcast_data.get_mut(&message.payload_hash) else {
            log::debug!("ConfirmDeliver: aborting, unknown broadcast");
            return;
        };
        let bootstrap_view = if data.bootstrap_view.is_empty() {
            bootstrap_view
        } else {
            data.bootstrap_view.clone()
        };
        if bootstrap_view.is_empty() {
            return;
        }

        let quorum_collected = data
            .quorum_manager
            .update_confirm_deliver(&message, &bootstrap_view);
        if quorum_collected {
            data.deliver_confirmed = true;
            log::debug!(
                "ConfirmDeliver: bootstrap quorum confirmed delivery of {}",
                message.payload_hash
            );
        }
    }

    fn on_leave_allowed(&mut self) {
        log::debug!("leave is now allowed");
        self.can_leave = true;
    }
}

/// The union of two views' members; Install and StateUpdate recipients.
pub(crate) fn member_union(a: &View, b: &View) -> crate::view::ViewData {
    let mut union = a.members().clone();
    union.extend(b.members().iter().copied());
    union
}
