//! Membership primitives and the seams towards the chain: the view fetcher
//! supplying the registered process set and the transaction sender anchoring
//! protocol artefacts in the ledger.

use std::collections::BTreeMap;
use std::fmt::Display;

use thiserror::Error;

use crate::utilities::crypto::ProcessId;
use crate::message::InstallMessage;
use crate::view::{View, ViewData};

/// A single requested change of a process' membership.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MembershipChange {
    Join,
    Leave,
}

impl MembershipChange {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            MembershipChange::Join => 0,
            MembershipChange::Leave => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MembershipChange::Join),
            1 => Some(MembershipChange::Leave),
            _ => None,
        }
    }
}

impl Display for MembershipChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipChange::Join => write!(f, "join"),
            MembershipChange::Leave => write!(f, "leave"),
        }
    }
}

/// State of the process membership. Transitions are monotonic, except that a
/// process discovered as an existing member skips `Joining`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MembershipState {
    NotJoined,
    Joining,
    Participating,
    Leaving,
    Left,
}

/// Accumulating set of join/leave requests to be absorbed into the next
/// installed view. Keyed by process, so a later request from the same
/// process supersedes the earlier one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingChanges {
    changes: BTreeMap<ProcessId, MembershipChange>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProcessId, &MembershipChange)> {
        self.changes.iter()
    }

    pub(crate) fn insert(&mut self, id: ProcessId, change: MembershipChange) {
        self.changes.insert(id, change);
    }

    pub(crate) fn merge(&mut self, other: &PendingChanges) {
        for (id, change) in &other.changes {
            self.changes.insert(*id, *change);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.changes.clear();
    }

    /// The view obtained by applying all pending changes to `view`.
    pub(crate) fn applied_to(&self, view: &View) -> View {
        let mut next = view.clone();
        for (id, change) in &self.changes {
            match change {
                MembershipChange::Join => next.insert(*id),
                MembershipChange::Leave => next.remove(id),
            }
        }
        next
    }

    /// Drop changes whose effect is already reflected in `view`: joins of
    /// members and leaves of non-members.
    pub(crate) fn subtract_absorbed(&mut self, view: &View) {
        self.changes.retain(|id, change| match change {
            MembershipChange::Join => !view.is_member(id),
            MembershipChange::Leave => view.is_member(id),
        });
    }
}

impl FromIterator<(ProcessId, MembershipChange)> for PendingChanges {
    fn from_iter<I: IntoIterator<Item = (ProcessId, MembershipChange)>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("no DBRB processes available")]
    NoDbrbProcesses,
    #[error("invalid expiration time for process {0}")]
    InvalidExpirationTime(ProcessId),
}

/// Read-only access to the registered process set as anchored in the chain.
/// Implementations must be thread-safe; the engines only ever read.
pub trait ViewFetcher: Send + Sync {
    /// The active registered process set at `timestamp` (milliseconds).
    fn get_view(&self, timestamp: u64) -> ViewData;

    /// When the registration of `id` expires, in milliseconds.
    fn get_expiration_time(&self, id: &ProcessId) -> u64;

    /// Remaining ban period of `id` in milliseconds; zero when not banned.
    fn get_ban_period(&self, id: &ProcessId) -> u64;

    /// Static membership seed, always merged into the fetched view.
    fn bootstrap_processes(&self) -> ViewData;
}

/// Sends protocol-level transactions towards the ledger.
pub trait TransactionSender: Send + Sync {
    /// Registers (or renews the registration of) this process.
    fn send_add_dbrb_process_transaction(&self);

    /// Anchors a notarised view transition.
    fn send_install_message_transaction(&self, install: &InstallMessage);

    /// Votes a misbehaving or unreachable process out of the system.
    fn send_remove_dbrb_process_by_network_transaction(
        &self,
        id: &ProcessId,
        timestamp: u64,
        votes: Vec<ProcessId>,
    );
}

/// The fetched view merged with the bootstrap set. An empty result means the
/// system has no processes at all, which is fatal at boot.
pub(crate) fn fetch_merged_view(
    fetcher: &dyn ViewFetcher,
    now: u64,
) -> Result<View, MembershipError> {
    let mut view = View::new(fetcher.get_view(now));
    view.merge(&View::new(fetcher.bootstrap_processes()));
    if view.is_empty() {
        return Err(MembershipError::NoDbrbProcesses);
    }
    Ok(view)
}

/// Decides whether this process has to (re-)register itself.
///
/// Registration is required when the process is absent from both the fetched
/// view and the bootstrap set (and not banned), or when its current
/// registration enters the grace period before expiry.
pub(crate) fn registration_required(
    fetcher: &dyn ViewFetcher,
    id: &ProcessId,
    now: u64,
    grace_period: u64,
) -> Result<bool, MembershipError> {
    let is_registered = fetcher.get_view(now).contains(id);
    let is_bootstrap = fetcher.bootstrap_processes().contains(id);

    if !is_registered && !is_bootstrap {
        if fetcher.get_ban_period(id) == 0 {
            log::debug!("process {id} is not registered in the DBRB system");
            return Ok(true);
        }
        return Ok(false);
    }

    if is_registered {
        let expiration_time = fetcher.get_expiration_time(id);
        if expiration_time < grace_period {
            return Err(MembershipError::InvalidExpirationTime(*id));
        }
        if now >= expiration_time - grace_period {
            log::debug!("registration of process {id} expires soon");
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::BTreeMap;

    use crate::view::test::{process_id, view_of};

    use super::*;

    pub(crate) struct StaticViewFetcher {
        pub(crate) view: ViewData,
        pub(crate) bootstrap: ViewData,
        pub(crate) expirations: BTreeMap<ProcessId, u64>,
        pub(crate) bans: BTreeMap<ProcessId, u64>,
    }

    impl StaticViewFetcher {
        pub(crate) fn new(view: View, bootstrap: View) -> Self {
            Self {
                view: view.into_members(),
                bootstrap: bootstrap.into_members(),
                expirations: BTreeMap::new(),
                bans: BTreeMap::new(),
            }
        }
    }

    impl ViewFetcher for StaticViewFetcher {
        fn get_view(&self, _timestamp: u64) -> ViewData {
            self.view.clone()
        }

        fn get_expiration_time(&self, id: &ProcessId) -> u64 {
            self.expirations.get(id).copied().unwrap_or(u64::MAX)
        }

        fn get_ban_period(&self, id: &ProcessId) -> u64 {
            self.bans.get(id).copied().unwrap_or(0)
        }

        fn bootstrap_processes(&self) -> ViewData {
            self.bootstrap.clone()
        }
    }

    #[test]
    fn test_pending_changes_applied_to_view() {
        let view = view_of(&[1, 2, 3]);
        let changes: PendingChanges = [
            (process_id(4), MembershipChange::Join),
            (process_id(2), MembershipChange::Leave),
        ]
        .into_iter()
        .collect();

        assert_eq!(view_of(&[1, 3, 4]), changes.applied_to(&view));
    }

    #[test]
    fn test_pending_changes_subtract_absorbed() {
        let mut changes: PendingChanges = [
            (process_id(4), MembershipChange::Join),
            (process_id(2), MembershipChange::Leave),
            (process_id(5), MembershipChange::Join),
        ]
        .into_iter()
        .collect();

        // A view that already contains 4 and no longer contains 2.
        changes.subtract_absorbed(&view_of(&[1, 3, 4]));

        assert_eq!(1, changes.len());
        assert_eq!(
            Some((&process_id(5), &MembershipChange::Join)),
            changes.iter().next()
        );
    }

    #[test]
    fn test_fetch_merged_view_merges_bootstrap() {
        let fetcher = StaticViewFetcher::new(view_of(&[1, 2]), view_of(&[3]));
        let view = fetch_merged_view(&fetcher, 0).unwrap();
        assert_eq!(view_of(&[1, 2, 3]), view);
    }

    #[test]
    fn test_fetch_merged_view_fails_on_empty_system() {
        let fetcher = StaticViewFetcher::new(View::default(), View::default());
        assert!(matches!(
            fetch_merged_view(&fetcher, 0),
            Err(MembershipError::NoDbrbProcesses)
        ));
    }

    #[test]
    fn test_registration_required_for_unknown_process() {
        let fetcher = StaticViewFetcher::new(view_of(&[1]), view_of(&[2]));
        assert!(registration_required(&fetcher, &process_id(9), 0, 100).unwrap());
    }

    #[test]
    fn test_registration_not_required_for_banned_process() {
        let mut fetcher = StaticViewFetcher::new(view_of(&[1]), view_of(&[2]));
        fetcher.bans.insert(process_id(9), 1000);
        assert!(!registration_required(&fetcher, &process_id(9), 0, 100).unwrap());
    }

    #[test]
    fn test_registration_required_within_grace_period() {
        let mut fetcher = StaticViewFetcher::new(view_of(&[1]), View::default());
        fetcher.expirations.insert(process_id(1), 1_000);

        assert!(!registration_required(&fetcher, &process_id(1), 800, 100).unwrap());
        assert!(registration_required(&fetcher, &process_id(1), 900, 100).unwrap());
    }

    #[test]
    fn test_registration_rejects_impossible_expiration() {
        let mut fetcher = StaticViewFetcher::new(view_of(&[1]), View::default());
        fetcher.expirations.insert(process_id(1), 50);

        assert!(matches!(
            registration_required(&fetcher, &process_id(1), 0, 100),
            Err(MembershipError::InvalidExpirationTime(_))
        ));
    }
}
