//! Quorum counters for every protocol event.
//!
//! Each `update_*` method returns `true` exactly once per (view, event)
//! pair: on the update that makes the counter first hit the quorum size.
//! Re-adding an already-counted sender is a no-op. Counters are only ever
//! touched from the engine's run loop, so no locking is needed here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::utilities::crypto::ProcessId;
use crate::message::{
    AcknowledgedMessage, Certificate, ConfirmDeliverMessage, ConvergedMessage, DeliverMessage,
    ProposeMessage, ReconfigConfirmMessage, StateUpdateMessage,
};
use crate::utilities::hash::HashType;
use crate::view::{Sequence, View};

#[derive(Debug, Default)]
pub(crate) struct QuorumManager {
    /// Pairs of process and payload hash received from Acknowledged
    /// messages, per view.
    acknowledged_payloads: HashMap<View, BTreeSet<(ProcessId, HashType)>>,

    /// Processes ready for delivery, per view.
    delivered_processes: HashMap<View, BTreeSet<ProcessId>>,

    /// Processes that confirmed delivery; counted against the bootstrap
    /// view's quorum.
    confirmed_deliver_processes: HashMap<View, BTreeSet<ProcessId>>,

    /// Processes that confirmed a reconfig request, per view.
    reconfig_confirm: HashMap<View, BTreeSet<ProcessId>>,

    /// Processes that proposed a given sequence to replace a given view.
    proposed: HashMap<(View, Sequence), BTreeSet<ProcessId>>,

    /// Converged signatures per (replaced view, converged sequence) pair.
    converged_signatures: HashMap<(View, Sequence), Certificate>,

    /// State updates collected per replaced view.
    state_updates: HashMap<View, BTreeMap<ProcessId, StateUpdateMessage>>,
}

impl QuorumManager {
    pub(crate) fn update_acknowledged(&mut self, message: &AcknowledgedMessage) -> bool {
        log::trace!("quorum: Acknowledged from {} in view {}", message.sender, message.view);
        let set = self.acknowledged_payloads.entry(message.view.clone()).or_default();
        if !set.insert((message.sender, message.payload_hash)) {
            return false;
        }

        let acknowledged_count = set
            .iter()
            .filter(|(_, hash)| *hash == message.payload_hash)
            .count();
        let quorum_size = message.view.quorum_size();
        let triggered = acknowledged_count == quorum_size;
        log::debug!(
            "quorum: Acknowledged {acknowledged_count}/{quorum_size}{}",
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    /// Acknowledged (process, payload hash) pairs recorded for `view`.
    pub(crate) fn acknowledged_payloads(
        &self,
        view: &View,
    ) -> Option<&BTreeSet<(ProcessId, HashType)>> {
        self.acknowledged_payloads.get(view)
    }

    pub(crate) fn update_deliver(&mut self, message: &DeliverMessage) -> bool {
        let set = self.delivered_processes.entry(message.view.clone()).or_default();
        if !set.insert(message.sender) {
            return false;
        }

        let quorum_size = message.view.quorum_size();
        let triggered = set.len() == quorum_size;
        log::debug!(
            "quorum: Deliver {}/{quorum_size}{}",
            set.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    pub(crate) fn update_confirm_deliver(
        &mut self,
        message: &ConfirmDeliverMessage,
        bootstrap_view: &View,
    ) -> bool {
        let set = self
            .confirmed_deliver_processes
            .entry(message.view.clone())
            .or_default();
        if !set.insert(message.sender) {
            return false;
        }

        let quorum_size = bootstrap_view.quorum_size();
        let triggered = set.len() == quorum_size;
        log::debug!(
            "quorum: ConfirmDeliver {}/{quorum_size}{}",
            set.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    pub(crate) fn update_reconfig_confirm(&mut self, message: &ReconfigConfirmMessage) -> bool {
        let set = self.reconfig_confirm.entry(message.view.clone()).or_default();
        if !set.insert(message.sender) {
            return false;
        }

        let quorum_size = message.view.quorum_size();
        let triggered = set.len() == quorum_size;
        log::debug!(
            "quorum: ReconfigConfirm {}/{quorum_size}{}",
            set.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    pub(crate) fn update_propose(&mut self, message: &ProposeMessage) -> bool {
        let key = (message.replaced_view.clone(), message.proposed_sequence.clone());
        let set = self.proposed.entry(key).or_default();
        if !set.insert(message.sender) {
            return false;
        }

        let quorum_size = message.replaced_view.quorum_size();
        let triggered = set.len() == quorum_size;
        log::debug!(
            "quorum: Propose {}/{quorum_size}{}",
            set.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    /// Processes already counted for a proposed (view, sequence) pair.
    pub(crate) fn proposed_processes(
        &self,
        replaced_view: &View,
        sequence: &Sequence,
    ) -> Option<&BTreeSet<ProcessId>> {
        self.proposed
            .get(&(replaced_view.clone(), sequence.clone()))
    }

    /// Records a converged signature. Triggers when a quorum of the replaced
    /// view has converged on the same sequence.
    pub(crate) fn update_converged(&mut self, message: &ConvergedMessage) -> bool {
        let key = (
            message.replaced_view.clone(),
            message.converged_sequence.clone(),
        );
        let signatures = self.converged_signatures.entry(key).or_default();
        if signatures.contains_key(&message.sender) {
            return false;
        }
        signatures.insert(message.sender, message.signature);

        let quorum_size = message.replaced_view.quorum_size();
        let triggered = signatures.len() == quorum_size;
        log::debug!(
            "quorum: Converged {}/{quorum_size}{}",
            signatures.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    pub(crate) fn converged_signatures(
        &self,
        replaced_view: &View,
        sequence: &Sequence,
    ) -> Option<&Certificate> {
        self.converged_signatures
            .get(&(replaced_view.clone(), sequence.clone()))
    }

    /// Stores a state update; triggers on a quorum of the replaced view.
    pub(crate) fn update_state_update(&mut self, message: StateUpdateMessage) -> bool {
        let view = message.view.clone();
        let quorum_size = view.quorum_size();
        let map = self.state_updates.entry(view).or_default();
        if map.contains_key(&message.sender) {
            return false;
        }
        map.insert(message.sender, message);

        let triggered = map.len() == quorum_size;
        log::debug!(
            "quorum: StateUpdate {}/{quorum_size}{}",
            map.len(),
            if triggered { " (triggered)" } else { "" }
        );
        triggered
    }

    pub(crate) fn state_updates(&self, view: &View) -> Vec<&StateUpdateMessage> {
        self.state_updates
            .get(view)
            .map(|map| map.values().collect())
            .unwrap_or_default()
    }

    /// Reset the reconfig confirmation counters when a join completes.
    pub(crate) fn clear_reconfig_confirm(&mut self) {
        self.reconfig_confirm.clear();
    }

    /// Reset all reconfiguration counters when a leave completes.
    pub(crate) fn clear_reconfig_counters(&mut self) {
        self.reconfig_confirm.clear();
        self.proposed.clear();
        self.converged_signatures.clear();
        self.state_updates.clear();
    }
}

#[cfg(test)]
mod test {
    use crate::utilities::crypto::Signature;
    use crate::view::test::{process_id, view_of};

    use super::*;

    fn ack(sender_tag: u8, view: &View, hash: HashType) -> AcknowledgedMessage {
        AcknowledgedMessage {
            sender: process_id(sender_tag),
            payload_hash: hash,
            view: view.clone(),
            payload_signature: Signature::new([0u8; 64]),
        }
    }

    fn deliver(sender_tag: u8, view: &View) -> DeliverMessage {
        DeliverMessage {
            sender: process_id(sender_tag),
            payload_hash: HashType::new([1u8; 32]),
            view: view.clone(),
        }
    }

    #[test]
    fn test_acknowledged_triggers_exactly_once() {
        // Quorum of a four-member view is three.
        let view = view_of(&[1, 2, 3, 4]);
        let hash = HashType::new([7u8; 32]);
        let mut manager = QuorumManager::default();

        assert!(!manager.update_acknowledged(&ack(1, &view, hash)));
        assert!(!manager.update_acknowledged(&ack(2, &view, hash)));
        assert!(manager.update_acknowledged(&ack(3, &view, hash)));
        assert!(!manager.update_acknowledged(&ack(4, &view, hash)));
    }

    #[test]
    fn test_acknowledged_duplicate_sender_is_noop() {
        let view = view_of(&[1, 2, 3, 4]);
        let hash = HashType::new([7u8; 32]);
        let mut manager = QuorumManager::default();

        assert!(!manager.update_acknowledged(&ack(1, &view, hash)));
        assert!(!manager.update_acknowledged(&ack(1, &view, hash)));
        assert!(!manager.update_acknowledged(&ack(2, &view, hash)));
        // The third distinct sender triggers, duplicates never did.
        assert!(manager.update_acknowledged(&ack(3, &view, hash)));
    }

    #[test]
    fn test_acknowledged_counts_per_payload_hash() {
        let view = view_of(&[1, 2, 3, 4]);
        let hash = HashType::new([7u8; 32]);
        let other_hash = HashType::new([8u8; 32]);
        let mut manager = QuorumManager::default();

        assert!(!manager.update_acknowledged(&ack(1, &view, hash)));
        assert!(!manager.update_acknowledged(&ack(2, &view, other_hash)));
        assert!(!manager.update_acknowledged(&ack(3, &view, hash)));
        assert!(manager.update_acknowledged(&ack(4, &view, hash)));
    }

    #[test]
    fn test_single_member_view_needs_one_acknowledgement() {
        let view = view_of(&[1]);
        let hash = HashType::new([7u8; 32]);
        let mut manager = QuorumManager::default();

        assert!(manager.update_acknowledged(&ack(1, &view, hash)));
    }

    #[test]
    fn test_deliver_triggers_once_per_view() {
        let view = view_of(&[1, 2, 3]);
        let mut manager = QuorumManager::default();

        assert!(!manager.update_deliver(&deliver(1, &view)));
        assert!(!manager.update_deliver(&deliver(1, &view)));
        assert!(!manager.update_deliver(&deliver(2, &view)));
        assert!(manager.update_deliver(&deliver(3, &view)));

        // A different view counts independently.
        let larger = view_of(&[1, 2, 3, 4]);
        assert!(!manager.update_deliver(&deliver(1, &larger)));
    }

    #[test]
    fn test_confirm_deliver_uses_bootstrap_quorum() {
        let view = view_of(&[1, 2, 3, 4, 5, 6, 7]);
        let bootstrap = view_of(&[1, 2, 3]);
        let mut manager = QuorumManager::default();

        let confirm = |tag: u8| ConfirmDeliverMessage {
            sender: process_id(tag),
            payload_hash: HashType::new([1u8; 32]),
            view: view.clone(),
        };

        assert!(!manager.update_confirm_deliver(&confirm(1), &bootstrap));
        assert!(!manager.update_confirm_deliver(&confirm(2), &bootstrap));
        assert!(manager.update_confirm_deliver(&confirm(3), &bootstrap));
    }

    #[test]
    fn test_converged_collects_signatures() {
        let replaced = view_of(&[1, 2, 3, 4]);
        let converged =
            Sequence::from_views(vec![view_of(&[1, 2, 3, 4, 5])]).unwrap();
        let mut manager = QuorumManager::default();

        let converged_message = |tag: u8| ConvergedMessage {
            sender: process_id(tag),
            converged_sequence: converged.clone(),
            replaced_view: replaced.clone(),
            signature: Signature::new([tag; 64]),
        };

        assert!(!manager.update_converged(&converged_message(1)));
        assert!(!manager.update_converged(&converged_message(2)));
        assert!(manager.update_converged(&converged_message(3)));

        let signatures = manager.converged_signatures(&replaced, &converged).unwrap();
        assert_eq!(3, signatures.len());
        assert_eq!(Signature::new([2u8; 64]), signatures[&process_id(2)]);
    }
}
