//! Pool bookkeeping and the acquisition decision routine
//!
//! Everything in here runs with the pool lock held and never awaits. Every
//! transition that can make room for a queued request ends in
//! [`PoolState::dispatch`], so while requests are queued the pool has no
//! free connection and no spare capacity.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::connection::{ConnectionId, Lease};
use crate::errors::{PoolError, PoolResult};
use crate::status::PoolStatus;

/// Queue length at which abandoned waiters are first swept out
const MIN_PRUNE_AT: usize = 16;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConnectionState {
    /// The factory is still producing this connection
    Pending,

    /// Live and idle
    Free,

    /// Live and checked out
    Acquired,

    /// No longer tracked: evicted, failed creation, or never issued
    Removed,
}

enum Slot<T> {
    Pending,
    Free(Arc<T>),
    Acquired { connection: Arc<T>, lease: Lease },
}

impl<T> Slot<T> {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::Pending => ConnectionState::Pending,
            Slot::Free(_) => ConnectionState::Free,
            Slot::Acquired { .. } => ConnectionState::Acquired,
        }
    }

    fn connection(&self) -> Option<&Arc<T>> {
        match self {
            Slot::Pending => None,
            Slot::Free(connection) | Slot::Acquired { connection, .. } => Some(connection),
        }
    }
}

/// Outcome handed to an admitted request.
pub(crate) enum Grant<T> {
    Closed,
    /// Run the factory for this reserved slot
    Create(ConnectionId),
    /// An idle connection, already checked out under `lease`
    Reuse {
        id: ConnectionId,
        connection: Arc<T>,
        lease: Lease,
    },
}

pub(crate) enum Decision<T> {
    Admitted(Grant<T>),
    Unavailable,
    Queued(oneshot::Receiver<Grant<T>>),
}

pub(crate) struct PoolState<T> {
    connection_limit: usize,
    slots: HashMap<ConnectionId, Slot<T>>,
    free: VecDeque<ConnectionId>,
    waiters: VecDeque<oneshot::Sender<Grant<T>>>,
    prune_at: usize,
    closing: VecDeque<Arc<T>>,
    pending: usize,
    acquired: usize,
    next_id: u64,
    next_lease: Lease,
    closed: bool,
}

impl<T> PoolState<T> {
    pub fn new(connection_limit: usize) -> Self {
        Self {
            connection_limit,
            slots: HashMap::new(),
            free: VecDeque::new(),
            waiters: VecDeque::new(),
            prune_at: MIN_PRUNE_AT,
            closing: VecDeque::new(),
            pending: 0,
            acquired: 0,
            next_id: 0,
            next_lease: 0,
            closed: false,
        }
    }

    /// Number of created, not yet removed connections
    fn live(&self) -> usize {
        self.slots.len() - self.pending
    }

    /// Run the decision routine for a fresh request.
    pub fn decide(&mut self, wait_for_connection: bool) -> Decision<T> {
        if let Some(grant) = self.admit() {
            return Decision::Admitted(grant);
        }
        if !wait_for_connection {
            return Decision::Unavailable;
        }
        if self.waiters.len() >= self.prune_at {
            self.waiters.retain(|waiter| !waiter.is_closed());
            self.prune_at = (self.waiters.len() * 2).max(MIN_PRUNE_AT);
        }
        let (sender, receiver) = oneshot::channel();
        self.waiters.push_back(sender);
        Decision::Queued(receiver)
    }

    fn admit(&mut self) -> Option<Grant<T>> {
        if self.closed {
            return Some(Grant::Closed);
        }
        if self.live() + self.pending < self.connection_limit {
            return Some(Grant::Create(self.reserve()));
        }
        while let Some(id) = self.free.pop_front() {
            if let Some(grant) = self.check_out(id) {
                return Some(grant);
            }
        }
        None
    }

    fn reserve(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, Slot::Pending);
        self.pending += 1;
        id
    }

    fn check_out(&mut self, id: ConnectionId) -> Option<Grant<T>> {
        let lease = self.next_lease;
        let slot = self.slots.get_mut(&id)?;
        let connection = match mem::replace(slot, Slot::Pending) {
            Slot::Free(connection) => connection,
            other => {
                *slot = other;
                return None;
            }
        };
        *slot = Slot::Acquired {
            connection: Arc::clone(&connection),
            lease,
        };
        self.next_lease += 1;
        self.acquired += 1;
        Some(Grant::Reuse {
            id,
            connection,
            lease,
        })
    }

    /// Serve queued requests, oldest first, until nothing more can be admitted.
    fn dispatch(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let Some(grant) = self.admit() else {
                self.waiters.push_front(waiter);
                break;
            };
            match waiter.send(grant) {
                Ok(()) => tracing::trace!(queued = self.waiters.len(), "Served queued request"),
                Err(grant) => self.reclaim(grant),
            }
        }
    }

    /// Undo a grant whose receiver went away.
    ///
    /// A reused connection is only taken back while it is still checked out
    /// under the granted lease; the checkout may already have been ended by id.
    fn reclaim(&mut self, grant: Grant<T>) {
        match grant {
            Grant::Closed => {}
            Grant::Create(id) => {
                if matches!(self.slots.get(&id), Some(Slot::Pending)) {
                    self.slots.remove(&id);
                    self.pending -= 1;
                }
            }
            Grant::Reuse {
                id,
                connection,
                lease,
            } => {
                let Some(slot) = self.slots.get_mut(&id) else {
                    return;
                };
                if !matches!(slot, Slot::Acquired { lease: current, .. } if *current == lease) {
                    return;
                }
                *slot = Slot::Free(connection);
                self.acquired -= 1;
                self.free.push_front(id);
            }
        }
    }

    /// Take back a grant its requester never consumed, then serve the queue.
    pub fn restore(&mut self, grant: Grant<T>) {
        self.reclaim(grant);
        self.dispatch();
    }

    /// Turn a pending slot into an acquired connection.
    ///
    /// Hands the connection back if the pool was closed in the meantime.
    pub fn complete(&mut self, id: ConnectionId, connection: Arc<T>) -> Result<Lease, Arc<T>> {
        if !matches!(self.slots.get(&id), Some(Slot::Pending)) {
            return Err(connection);
        }
        self.pending -= 1;
        if self.closed {
            self.slots.remove(&id);
            return Err(connection);
        }
        let lease = self.next_lease;
        self.next_lease += 1;
        self.slots.insert(id, Slot::Acquired { connection, lease });
        self.acquired += 1;
        Ok(lease)
    }

    /// Give up a pending slot after a failed or cancelled creation.
    pub fn abandon(&mut self, id: ConnectionId) {
        if matches!(self.slots.get(&id), Some(Slot::Pending)) {
            self.slots.remove(&id);
            self.pending -= 1;
            self.dispatch();
        }
    }

    /// Return an acquired connection to the free queue.
    ///
    /// With `lease` set, only that checkout may be ended.
    pub fn release<E>(&mut self, id: ConnectionId, lease: Option<Lease>) -> PoolResult<(), E> {
        let current = match self.slots.get(&id) {
            Some(Slot::Free(_)) => return Err(PoolError::AlreadyReleased(id)),
            Some(Slot::Acquired { lease, .. }) => *lease,
            _ => return Err(PoolError::NotAcquired(id)),
        };
        if lease.is_some_and(|lease| lease != current) {
            return Err(PoolError::NotAcquired(id));
        }

        if let Some(slot) = self.slots.get_mut(&id)
            && let Slot::Acquired { connection, .. } = mem::replace(slot, Slot::Pending)
        {
            *slot = Slot::Free(connection);
        }
        self.acquired -= 1;
        self.free.push_back(id);
        self.dispatch();
        Ok(())
    }

    /// Evict a live connection, whatever its current state.
    ///
    /// Returns `None` for pending, removed or unknown ids.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<T>> {
        let connection = match self.slots.remove(&id)? {
            Slot::Pending => {
                self.slots.insert(id, Slot::Pending);
                return None;
            }
            Slot::Free(connection) => {
                if let Some(position) = self.free.iter().position(|free| *free == id) {
                    self.free.remove(position);
                }
                connection
            }
            Slot::Acquired { connection, .. } => {
                self.acquired -= 1;
                connection
            }
        };
        self.dispatch();
        Some(connection)
    }

    /// Mark the pool closed, reject every queued request, and queue the live
    /// connections, in creation order, for [`next_to_close`](Self::next_to_close).
    /// Returns `false` if the pool was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Grant::Closed);
        }

        let mut live: Vec<(ConnectionId, Arc<T>)> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| slot.connection().map(|c| (*id, Arc::clone(c))))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        self.closing = live.into_iter().map(|(_, connection)| connection).collect();
        true
    }

    /// Take the next connection that still has to be closed after [`close`](Self::close).
    /// Each one is handed out exactly once.
    pub fn next_to_close(&mut self) -> Option<Arc<T>> {
        self.closing.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state_of(&self, id: ConnectionId) -> ConnectionState {
        self.slots
            .get(&id)
            .map_or(ConnectionState::Removed, Slot::state)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            connection_limit: self.connection_limit,
            total: self.live(),
            free: self.free.len(),
            acquired: self.acquired,
            pending: self.pending,
            waiters: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            closed: self.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type State = PoolState<&'static str>;

    fn expect_create(decision: Decision<&'static str>) -> ConnectionId {
        match decision {
            Decision::Admitted(Grant::Create(id)) => id,
            _ => panic!("expected a creation grant"),
        }
    }

    fn expect_reuse(decision: Decision<&'static str>) -> (ConnectionId, Lease) {
        match decision {
            Decision::Admitted(Grant::Reuse { id, lease, .. }) => (id, lease),
            _ => panic!("expected a reused connection"),
        }
    }

    fn expect_queued(decision: Decision<&'static str>) -> oneshot::Receiver<Grant<&'static str>> {
        match decision {
            Decision::Queued(receiver) => receiver,
            _ => panic!("expected the request to be queued"),
        }
    }

    fn created(state: &mut State, name: &'static str) -> (ConnectionId, Lease) {
        let id = expect_create(state.decide(true));
        let lease = state.complete(id, Arc::new(name)).unwrap();
        (id, lease)
    }

    fn assert_consistent(state: &State) {
        let status = state.status();
        assert!(status.total + status.pending <= status.connection_limit);
        assert_eq!(status.total, status.free + status.acquired);
        for id in &state.free {
            assert_eq!(state.state_of(*id), ConnectionState::Free);
        }
    }

    #[test]
    fn test_capacity_is_checked_before_free_connections() {
        let mut state = State::new(2);
        let (a, _) = created(&mut state, "a");
        state.release::<()>(a, None).unwrap();

        let b = expect_create(state.decide(true));
        assert_ne!(a, b);
        assert_eq!(state.state_of(a), ConnectionState::Free);
        assert_eq!(state.state_of(b), ConnectionState::Pending);
        assert_consistent(&state);
    }

    #[test]
    fn test_free_connections_are_reused_in_release_order() {
        let mut state = State::new(2);
        let (a, _) = created(&mut state, "a");
        let (b, _) = created(&mut state, "b");
        state.release::<()>(b, None).unwrap();
        state.release::<()>(a, None).unwrap();

        assert_eq!(expect_reuse(state.decide(false)).0, b);
        assert_eq!(expect_reuse(state.decide(false)).0, a);
        assert!(matches!(state.decide(false), Decision::Unavailable));
        assert_consistent(&state);
    }

    #[test]
    fn test_pending_creations_count_against_limit() {
        let mut state = State::new(2);
        expect_create(state.decide(true));
        expect_create(state.decide(true));

        assert!(matches!(state.decide(false), Decision::Unavailable));
        let status = state.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.pending, 2);
        assert_eq!(status.waiters, 0);
    }

    #[test]
    fn test_release_hands_connection_to_oldest_waiter() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let mut first = expect_queued(state.decide(true));
        let mut second = expect_queued(state.decide(true));

        state.release::<()>(a, None).unwrap();

        match first.try_recv() {
            Ok(Grant::Reuse { id, .. }) => assert_eq!(id, a),
            _ => panic!("oldest waiter should receive the released connection"),
        }
        assert!(second.try_recv().is_err());
        assert_eq!(state.state_of(a), ConnectionState::Acquired);
        assert_eq!(state.status().free, 0);
        assert_eq!(state.status().waiters, 1);
        assert_consistent(&state);
    }

    #[test]
    fn test_new_requests_queue_behind_waiters() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let _waiter = expect_queued(state.decide(true));
        state.release::<()>(a, None).unwrap();

        // the released connection went to the waiter, nothing left for a newcomer
        assert!(matches!(state.decide(false), Decision::Unavailable));
    }

    #[test]
    fn test_release_errors_do_not_mutate_state() {
        let mut state = State::new(2);
        let (a, _) = created(&mut state, "a");
        let pending = expect_create(state.decide(true));
        state.release::<()>(a, None).unwrap();
        let before = state.status();

        assert_eq!(state.release::<()>(a, None), Err(PoolError::AlreadyReleased(a)));
        assert_eq!(state.release::<()>(pending, None), Err(PoolError::NotAcquired(pending)));
        let unknown = ConnectionId(99);
        assert_eq!(state.release::<()>(unknown, None), Err(PoolError::NotAcquired(unknown)));
        assert_eq!(state.status(), before);
    }

    #[test]
    fn test_stale_lease_cannot_release() {
        let mut state = State::new(1);
        let (a, stale) = created(&mut state, "a");
        state.release::<()>(a, None).unwrap();
        let (_, current) = expect_reuse(state.decide(true));

        assert_eq!(state.release::<()>(a, Some(stale)), Err(PoolError::NotAcquired(a)));
        assert_eq!(state.state_of(a), ConnectionState::Acquired);
        state.release::<()>(a, Some(current)).unwrap();
        assert_eq!(state.state_of(a), ConnectionState::Free);
    }

    #[test]
    fn test_remove_idle_connection_keeps_bookkeeping() {
        let mut state = State::new(2);
        let (a, _) = created(&mut state, "a");
        let (b, _) = created(&mut state, "b");
        state.release::<()>(a, None).unwrap();
        state.release::<()>(b, None).unwrap();

        assert_eq!(state.remove(a).as_deref(), Some(&"a"));
        assert_eq!(state.state_of(a), ConnectionState::Removed);
        assert_eq!(state.free.iter().copied().collect::<Vec<_>>(), vec![b]);
        assert_consistent(&state);

        assert!(state.remove(a).is_none());
        assert_eq!(state.release::<()>(a, None), Err(PoolError::NotAcquired(a)));
        assert_eq!(state.status().total, 1);
    }

    #[test]
    fn test_remove_ignores_pending_slot() {
        let mut state = State::new(1);
        let id = expect_create(state.decide(true));

        assert!(state.remove(id).is_none());
        assert_eq!(state.state_of(id), ConnectionState::Pending);
        assert_eq!(state.status().pending, 1);
    }

    #[test]
    fn test_removal_grants_creation_to_waiter() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let mut waiter = expect_queued(state.decide(true));

        state.remove(a).unwrap();

        match waiter.try_recv() {
            Ok(Grant::Create(id)) => assert_eq!(state.state_of(id), ConnectionState::Pending),
            _ => panic!("waiter should be allowed to create a connection"),
        }
        assert_consistent(&state);
    }

    #[test]
    fn test_abandoned_creation_is_granted_to_waiter() {
        let mut state = State::new(1);
        let id = expect_create(state.decide(true));
        let mut waiter = expect_queued(state.decide(true));

        state.abandon(id);

        assert_eq!(state.state_of(id), ConnectionState::Removed);
        assert!(matches!(waiter.try_recv(), Ok(Grant::Create(_))));
        assert_eq!(state.status().pending, 1);
    }

    #[test]
    fn test_cancelled_waiter_is_skipped() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let gone = expect_queued(state.decide(true));
        let mut next = expect_queued(state.decide(true));
        drop(gone);
        assert_eq!(state.status().waiters, 1);

        state.release::<()>(a, None).unwrap();

        assert!(matches!(next.try_recv(), Ok(Grant::Reuse { id, .. }) if id == a));
        assert_consistent(&state);
    }

    #[test]
    fn test_cancelled_waiters_leave_connection_free() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        drop(expect_queued(state.decide(true)));

        state.release::<()>(a, None).unwrap();

        assert_eq!(state.state_of(a), ConnectionState::Free);
        assert_eq!(state.status().waiters, 0);
        assert_consistent(&state);
    }

    #[test]
    fn test_close_rejects_waiters_and_returns_live_connections() {
        let mut state = State::new(3);
        let (a, _) = created(&mut state, "a");
        created(&mut state, "b");
        let pending = expect_create(state.decide(true));
        state.release::<()>(a, None).unwrap();
        expect_reuse(state.decide(true));
        let mut waiter = expect_queued(state.decide(true));

        assert!(state.close());

        let live: Vec<_> = std::iter::from_fn(|| state.next_to_close()).collect();
        assert_eq!(live.iter().map(|c| **c).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(matches!(waiter.try_recv(), Ok(Grant::Closed)));
        assert!(matches!(state.decide(true), Decision::Admitted(Grant::Closed)));
        assert!(!state.close());
        assert!(state.next_to_close().is_none());

        // an in-flight creation finishing after close is refused
        assert!(state.complete(pending, Arc::new("late")).is_err());
        assert_eq!(state.status().pending, 0);
        assert_eq!(state.state_of(pending), ConnectionState::Removed);
    }

    #[test]
    fn test_close_hands_out_each_connection_once() {
        let mut state = State::new(2);
        created(&mut state, "a");
        created(&mut state, "b");
        assert!(state.close());

        assert_eq!(state.next_to_close().map(|c| *c), Some("a"));
        // a second close neither re-queues nor skips what is left
        assert!(!state.close());
        assert_eq!(state.next_to_close().map(|c| *c), Some("b"));
        assert!(state.next_to_close().is_none());
    }

    #[test]
    fn test_double_release_before_cancelled_waiter_keeps_counts() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let mut waiter = expect_queued(state.decide(true));

        // handed straight to the waiter, then ended again by id
        state.release::<()>(a, None).unwrap();
        state.release::<()>(a, None).unwrap();
        assert_eq!(state.status().free, 1);

        // the waiter gives up before seeing its grant
        waiter.close();
        let grant = waiter.try_recv().unwrap();
        state.restore(grant);

        let status = state.status();
        assert_eq!(status.acquired, 0);
        assert_eq!(status.free, 1);
        assert_eq!(state.free.iter().filter(|id| **id == a).count(), 1);
        assert_consistent(&state);

        expect_reuse(state.decide(true));
        assert!(matches!(state.decide(false), Decision::Unavailable));
    }

    #[test]
    fn test_restore_keeps_checkout_of_new_holder() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let mut waiter = expect_queued(state.decide(true));

        state.release::<()>(a, None).unwrap();
        state.release::<()>(a, None).unwrap();
        let (_, lease) = expect_reuse(state.decide(true));

        waiter.close();
        state.restore(waiter.try_recv().unwrap());

        assert_eq!(state.state_of(a), ConnectionState::Acquired);
        assert_eq!(state.status().acquired, 1);
        assert!(state.free.is_empty());
        state.release::<()>(a, Some(lease)).unwrap();
        assert_consistent(&state);
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let mut state = State::new(1);
        let (a, _) = created(&mut state, "a");
        let mut first = expect_queued(state.decide(true));

        for _ in 0..10_000 {
            drop(expect_queued(state.decide(true)));
        }

        assert!(state.waiters.len() <= 2 * MIN_PRUNE_AT);
        assert_eq!(state.status().waiters, 1);

        // the live waiter kept its place at the head
        state.release::<()>(a, None).unwrap();
        assert!(matches!(first.try_recv(), Ok(Grant::Reuse { id, .. }) if id == a));
        assert_consistent(&state);
    }
}
