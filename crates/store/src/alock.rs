//! Adaptive per-resource lock
//!
//! A FIFO-ish queue of read/write requests over a single resource, with
//! asynchronous grants: every request registers a grant continuation and a
//! fail continuation, and exactly one of them eventually fires. The fail
//! continuation receives the reason for the denial: `LockDenied` for a
//! priority loss, `Wounded` with the preempting transaction, or
//! `LockTimeout` for an expired deadline. The scheduling policy
//! (wait-die, wound-die, timeout) is a variant on the lock, selected once
//! per process.
//!
//! Callbacks are collected under the internal mutex and invoked after it
//! is released, so a grant continuation may immediately re-enter the lock.

use crate::error::Error;
use parking_lot::Mutex;
use rill_common::{LockPolicy, TxnId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifies one lock request for cancellation and release.
pub type ReqId = u64;

/// Requested access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// Readers share; a writer is exclusive.
    pub fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Read, LockMode::Read))
    }
}

type GrantFn = Box<dyn FnOnce(ReqId) + Send>;
type FailFn = Box<dyn FnOnce(Error) + Send>;

struct Waiter {
    id: ReqId,
    mode: LockMode,
    owner: TxnId,
    deadline: Instant,
    on_grant: Option<GrantFn>,
    on_fail: Option<FailFn>,
}

struct Holder {
    id: ReqId,
    mode: LockMode,
    owner: TxnId,
    /// Retained after the grant so wound-die can abort the holder.
    on_fail: Option<FailFn>,
}

#[derive(Default)]
struct LockQueue {
    held: Vec<Holder>,
    waiting: VecDeque<Waiter>,
    next_req: ReqId,
}

/// Deferred callback invocations, fired outside the lock.
enum Wake {
    Grant(GrantFn, ReqId),
    Fail(FailFn, Error),
}

fn run_wakes(wakes: Vec<Wake>) {
    for wake in wakes {
        match wake {
            Wake::Grant(grant, id) => grant(id),
            Wake::Fail(fail, reason) => fail(reason),
        }
    }
}

/// An adaptive lock over one resource (in practice, one row column).
pub struct ALock {
    policy: LockPolicy,
    timeout: Duration,
    queue: Mutex<LockQueue>,
}

impl std::fmt::Debug for ALock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ALock")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ALock {
    pub fn new(policy: LockPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            queue: Mutex::new(LockQueue::default()),
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Enqueue a write request. Exactly one of the callbacks eventually
    /// fires: `on_grant` with the request id, or `on_fail` with the
    /// denial reason.
    pub fn reg_wlock<G, F>(&self, owner: TxnId, on_grant: G, on_fail: F) -> ReqId
    where
        G: FnOnce(ReqId) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.register(LockMode::Write, owner, Box::new(on_grant), Box::new(on_fail))
    }

    /// Enqueue a read request.
    pub fn reg_rlock<G, F>(&self, owner: TxnId, on_grant: G, on_fail: F) -> ReqId
    where
        G: FnOnce(ReqId) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.register(LockMode::Read, owner, Box::new(on_grant), Box::new(on_fail))
    }

    fn register(&self, mode: LockMode, owner: TxnId, on_grant: GrantFn, on_fail: FailFn) -> ReqId {
        let mut wakes = Vec::new();
        let id;
        {
            let mut queue = self.queue.lock();
            if self.policy == LockPolicy::Timeout {
                Self::sweep_expired(&mut queue, &mut wakes);
            }
            queue.next_req += 1;
            id = queue.next_req;

            let holder_conflict = queue
                .held
                .iter()
                .any(|h| h.owner != owner && !h.mode.compatible_with(mode));
            let waiter_conflict = queue
                .waiting
                .iter()
                .any(|w| w.owner != owner && !w.mode.compatible_with(mode));

            if !holder_conflict && !waiter_conflict {
                queue.held.push(Holder {
                    id,
                    mode,
                    owner,
                    on_fail: Some(on_fail),
                });
                wakes.push(Wake::Grant(on_grant, id));
            } else {
                match self.policy {
                    LockPolicy::WaitDie => {
                        let outranks_holders = queue.held.iter().all(|h| {
                            h.owner == owner
                                || h.mode.compatible_with(mode)
                                || owner.is_older_than(h.owner)
                        });
                        let outranks_waiters = queue.waiting.iter().all(|w| {
                            w.owner == owner
                                || w.mode.compatible_with(mode)
                                || owner.is_older_than(w.owner)
                        });
                        if outranks_holders && outranks_waiters {
                            queue.waiting.push_back(Waiter {
                                id,
                                mode,
                                owner,
                                deadline: Instant::now() + self.timeout,
                                on_grant: Some(on_grant),
                                on_fail: Some(on_fail),
                            });
                        } else {
                            debug!(%owner, req = id, "lock denied (wait-die)");
                            wakes.push(Wake::Fail(on_fail, Error::LockDenied));
                        }
                    }
                    LockPolicy::WoundDie => {
                        let wins_holders = queue
                            .held
                            .iter()
                            .filter(|h| h.owner != owner && !h.mode.compatible_with(mode))
                            .all(|h| owner.is_older_than(h.owner));
                        if !holder_conflict || wins_holders {
                            // Wound every conflicting younger holder, then
                            // take the grant.
                            let mut kept = Vec::with_capacity(queue.held.len());
                            for mut h in queue.held.drain(..) {
                                if h.owner != owner && !h.mode.compatible_with(mode) {
                                    debug!(victim = %h.owner, by = %owner, "holder wounded");
                                    if let Some(fail) = h.on_fail.take() {
                                        wakes.push(Wake::Fail(fail, Error::Wounded { by: owner }));
                                    }
                                } else {
                                    kept.push(h);
                                }
                            }
                            queue.held = kept;
                            queue.held.push(Holder {
                                id,
                                mode,
                                owner,
                                on_fail: Some(on_fail),
                            });
                            wakes.push(Wake::Grant(on_grant, id));
                        } else {
                            debug!(%owner, req = id, "lock denied (wound-die)");
                            wakes.push(Wake::Fail(on_fail, Error::LockDenied));
                        }
                    }
                    LockPolicy::Timeout => {
                        queue.waiting.push_back(Waiter {
                            id,
                            mode,
                            owner,
                            deadline: Instant::now() + self.timeout,
                            on_grant: Some(on_grant),
                            on_fail: Some(on_fail),
                        });
                    }
                }
            }
        }
        run_wakes(wakes);
        id
    }

    /// Cancel a pending request; a granted request is released instead.
    /// Neither callback fires for a cancelled pending request.
    pub fn abort_lock_req(&self, req: ReqId) {
        let mut wakes = Vec::new();
        {
            let mut queue = self.queue.lock();
            if let Some(pos) = queue.waiting.iter().position(|w| w.id == req) {
                queue.waiting.remove(pos);
            } else {
                queue.held.retain(|h| h.id != req);
            }
            Self::promote(&mut queue, &mut wakes);
        }
        run_wakes(wakes);
    }

    /// Release a held grant and promote eligible waiters.
    pub fn unlock_by(&self, req: ReqId) {
        let mut wakes = Vec::new();
        {
            let mut queue = self.queue.lock();
            if self.policy == LockPolicy::Timeout {
                Self::sweep_expired(&mut queue, &mut wakes);
            }
            queue.held.retain(|h| h.id != req);
            Self::promote(&mut queue, &mut wakes);
        }
        run_wakes(wakes);
    }

    /// Fail every pending request past its deadline. Expiry is also swept
    /// on every lock event under the timeout policy; this entry point lets
    /// an external timer drive it.
    pub fn expire_stale(&self) {
        let mut wakes = Vec::new();
        {
            let mut queue = self.queue.lock();
            Self::sweep_expired(&mut queue, &mut wakes);
            Self::promote(&mut queue, &mut wakes);
        }
        run_wakes(wakes);
    }

    pub fn is_held(&self, req: ReqId) -> bool {
        self.queue.lock().held.iter().any(|h| h.id == req)
    }

    pub fn is_waiting(&self, req: ReqId) -> bool {
        self.queue.lock().waiting.iter().any(|w| w.id == req)
    }

    pub fn holders_count(&self) -> usize {
        self.queue.lock().held.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    fn sweep_expired(queue: &mut LockQueue, wakes: &mut Vec<Wake>) {
        let now = Instant::now();
        let mut i = 0;
        while i < queue.waiting.len() {
            if queue.waiting[i].deadline <= now {
                let mut waiter = queue.waiting.remove(i).expect("index in bounds");
                debug!(owner = %waiter.owner, req = waiter.id, "lock request timed out");
                if let Some(fail) = waiter.on_fail.take() {
                    wakes.push(Wake::Fail(fail, Error::LockTimeout));
                }
            } else {
                i += 1;
            }
        }
    }

    /// Grant from the queue front while the head is compatible with the
    /// holders. FIFO: a blocked head blocks everything behind it.
    fn promote(queue: &mut LockQueue, wakes: &mut Vec<Wake>) {
        loop {
            let compatible = match queue.waiting.front() {
                None => break,
                Some(front) => queue
                    .held
                    .iter()
                    .all(|h| h.owner == front.owner || h.mode.compatible_with(front.mode)),
            };
            if !compatible {
                break;
            }
            let mut waiter = queue.waiting.pop_front().expect("front exists");
            let grant = waiter.on_grant.take();
            let id = waiter.id;
            queue.held.push(Holder {
                id,
                mode: waiter.mode,
                owner: waiter.owner,
                on_fail: waiter.on_fail.take(),
            });
            if let Some(grant) = grant {
                wakes.push(Wake::Grant(grant, id));
            }
        }
    }
}
