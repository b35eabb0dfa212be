//! Per-payload broadcast state.

use std::collections::HashMap;

use crate::utilities::crypto::{ProcessId, Signature};
use crate::message::{Certificate, Payload};
use crate::quorum::QuorumManager;
use crate::view::View;

/// Everything the engine tracks about one payload being broadcast, keyed by
/// the payload hash. Exclusively owned by the engine; handlers only ever see
/// message views.
#[derive(Debug, Default)]
pub(crate) struct BroadcastData {
    /// Payload being broadcast; unset until a Prepare is seen.
    pub(crate) payload: Option<Payload>,

    /// Process whose Prepare installed the payload.
    pub(crate) prepare_sender: Option<ProcessId>,

    /// When the payload was first observed locally, in milliseconds.
    pub(crate) begin: u64,

    /// View under which this broadcast runs.
    pub(crate) broadcast_view: View,

    /// Bootstrap set carried by the Prepare; used for the deliver
    /// confirmation cross check.
    pub(crate) bootstrap_view: View,

    /// Signatures received from Acknowledged messages.
    pub(crate) signatures: HashMap<(View, ProcessId), Signature>,

    /// Certificate sealed when the Acknowledged quorum first closes.
    pub(crate) certificate: Certificate,

    /// View in which the certificate was sealed.
    pub(crate) certificate_view: View,

    /// Per-broadcast quorum counters.
    pub(crate) quorum_manager: QuorumManager,

    pub(crate) commit_message_received: bool,

    /// Guards the at-most-once deliver callback.
    pub(crate) delivered: bool,

    /// A bootstrap-view quorum confirmed delivery; the entry is eligible for
    /// purging.
    pub(crate) deliver_confirmed: bool,
}
