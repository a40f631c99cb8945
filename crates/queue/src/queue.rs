//! Bounded, dependency-aware operation queue.
//!
//! Every accepted operation is a spawned task. It first waits for its
//! dependencies (each operation publishes its state on a watch channel) and
//! only then takes a worker permit, so a waiting final op holds no worker.
//!
//! A dependency does not have to be queued yet: the dependent waits on a
//! placeholder channel that the dependency adopts once it is added. The
//! final state of operations that already left the roster is remembered, so
//! depending on a finished operation resolves immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use blobferry_model::{TransferId, TransferKey, TransferState};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::QueueError;
use crate::operation::{
    Operation, OperationKind, OperationRunner, QueueEvent, RunContext, blocking_state, is_finished,
};

/// Number of finished operations whose outcome is remembered.
const OUTCOME_HISTORY: usize = 4096;

struct Slot {
    key: TransferKey,
    state: TransferState,
    status: watch::Sender<TransferState>,
    /// Placeholder channels of ids this slot took over through `replace`.
    aliases: Vec<watch::Sender<TransferState>>,
    cancel: CancellationToken,
}

impl Slot {
    fn publish(&self, state: TransferState) {
        self.status.send_replace(state);
        for alias in &self.aliases {
            alias.send_replace(state);
        }
    }
}

#[derive(Default)]
struct Inner {
    roster: Vec<TransferId>,
    slots: HashMap<TransferId, Slot>,
    outcomes: HashMap<TransferId, TransferState>,
    outcome_order: VecDeque<TransferId>,
    /// Status channels of dependencies that are not queued yet.
    waiting: HashMap<TransferId, watch::Sender<TransferState>>,
}

impl Inner {
    /// Removes `id` from the roster and sets its final state.
    fn finish(&mut self, id: TransferId, state: TransferState) -> Option<(TransferId, TransferKey, TransferState)> {
        let mut slot = self.slots.remove(&id)?;
        self.roster.retain(|r| *r != id);
        slot.state = state;
        slot.publish(state);
        if state != TransferState::Complete {
            slot.cancel.cancel();
        }
        self.record(id, state);
        Some((id, slot.key, state))
    }

    fn record(&mut self, id: TransferId, state: TransferState) {
        if self.outcomes.insert(id, state).is_none() {
            self.outcome_order.push_back(id);
        }
        while self.outcome_order.len() > OUTCOME_HISTORY {
            if let Some(old) = self.outcome_order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }

    /// Status channel for a newly queued operation, adopting the placeholder
    /// dependents may already be waiting on.
    fn claim_status(&mut self, id: TransferId) -> watch::Sender<TransferState> {
        match self.waiting.remove(&id) {
            Some(status) => {
                status.send_replace(TransferState::Pending);
                status
            }
            None => watch::channel(TransferState::Pending).0,
        }
    }

    /// One status receiver per dependency: the live slot, the remembered
    /// outcome, or a placeholder until the dependency is queued.
    fn subscribe(&mut self, deps: &[TransferId]) -> Vec<watch::Receiver<TransferState>> {
        self.waiting.retain(|_, tx| tx.receiver_count() > 0);
        deps.iter()
            .map(|d| {
                if let Some(slot) = self.slots.get(d) {
                    return slot.status.subscribe();
                }
                if let Some(state) = self.outcomes.get(d) {
                    return watch::channel(*state).1;
                }
                self.waiting
                    .entry(*d)
                    .or_insert_with(|| watch::channel(TransferState::Pending).0)
                    .subscribe()
            })
            .collect()
    }

    fn drain(&mut self, state: TransferState) -> Vec<(TransferId, TransferKey, TransferState)> {
        let ids = std::mem::take(&mut self.roster);
        ids.into_iter().filter_map(|id| self.finish(id, state)).collect()
    }
}

struct Spawn {
    id: TransferId,
    key: TransferKey,
    kind: OperationKind,
    deps: Vec<watch::Receiver<TransferState>>,
    cancel: CancellationToken,
}

struct Shared {
    inner: Mutex<Inner>,
    semaphore: Arc<Semaphore>,
    runner: Weak<dyn OperationRunner>,
    events: Mutex<Option<mpsc::UnboundedSender<QueueEvent>>>,
    max_concurrency: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    fn emit_changes(&self, mut changes: Vec<(TransferId, TransferKey, TransferState)>) {
        match changes.len() {
            0 => {}
            1 => {
                if let Some((op, key, state)) = changes.pop() {
                    self.emit(QueueEvent::Changed { op, key, state });
                }
            }
            _ => self.emit(QueueEvent::BatchChanged { changes }),
        }
    }

    /// Marks a pending operation as running. Returns `false` if it was
    /// paused, canceled or removed in the meantime.
    fn start(&self, id: TransferId) -> bool {
        let change = {
            let mut inner = self.lock();
            match inner.slots.get_mut(&id) {
                Some(slot) if slot.state == TransferState::Pending && !slot.cancel.is_cancelled() => {
                    slot.state = TransferState::InProgress;
                    slot.publish(TransferState::InProgress);
                    Some((id, slot.key, TransferState::InProgress))
                }
                _ => None,
            }
        };
        let started = change.is_some();
        self.emit_changes(change.into_iter().collect());
        started
    }

    fn finish(&self, id: TransferId, state: TransferState) {
        let change = self.lock().finish(id, state);
        if let Some((_, key, state)) = &change {
            trace!(op = %id, key = %key, state = ?state, "operation finished");
        }
        self.emit_changes(change.into_iter().collect());
    }
}

/// Executes operations under a concurrency limit, honoring dependency edges.
#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    /// Creates a queue running at most `max_concurrency` operations at once.
    ///
    /// The runner is held weakly so its owner can also own the queue.
    pub fn new(max_concurrency: usize, runner: Weak<dyn OperationRunner>) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                runner,
                events: Mutex::new(None),
                max_concurrency,
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        let mut events = self.shared.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *events = Some(tx);
        Some(rx)
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.max_concurrency
    }

    /// Queues one operation.
    pub fn add(&self, op: Operation) -> Result<(), QueueError> {
        let (accepted, mut rejected) = self.enqueue(vec![op]);
        if let Some(err) = rejected.pop() {
            return Err(err);
        }
        self.shared.emit_changes(accepted);
        Ok(())
    }

    /// Queues a batch atomically: dependencies between operations of the
    /// same batch are resolved before any of them can finish.
    ///
    /// Returns the number of accepted operations.
    pub fn add_all(&self, ops: Vec<Operation>) -> usize {
        let (accepted, rejected) = self.enqueue(ops);
        for err in &rejected {
            warn!(error = %err, "operation rejected");
        }
        let count = accepted.len();
        self.shared.emit_changes(accepted);
        count
    }

    fn enqueue(&self, ops: Vec<Operation>) -> (Vec<(TransferId, TransferKey, TransferState)>, Vec<QueueError>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut spawns = Vec::new();
        {
            let mut inner = self.shared.lock();
            let mut batch = Vec::new();
            for op in ops {
                if !op.state.is_active() {
                    rejected.push(QueueError::NotQueueable { id: op.id, state: op.state });
                    continue;
                }
                if inner.slots.contains_key(&op.id) {
                    rejected.push(QueueError::AlreadyQueued(op.id));
                    continue;
                }
                let status = inner.claim_status(op.id);
                let cancel = CancellationToken::new();
                inner.roster.push(op.id);
                inner.slots.insert(
                    op.id,
                    Slot {
                        key: op.key,
                        state: TransferState::Pending,
                        status,
                        aliases: Vec::new(),
                        cancel: cancel.clone(),
                    },
                );
                accepted.push((op.id, op.key, TransferState::Pending));
                batch.push((op, cancel));
            }
            for (op, cancel) in batch {
                spawns.push(Spawn {
                    id: op.id,
                    key: op.key,
                    kind: op.kind,
                    deps: inner.subscribe(&op.dependencies),
                    cancel,
                });
            }
        }
        for spawn in spawns {
            trace!(op = %spawn.id, key = %spawn.key, kind = %spawn.kind, deps = spawn.deps.len(), "operation queued");
            tokio::spawn(drive(Arc::clone(&self.shared), spawn));
        }
        (accepted, rejected)
    }

    /// Cancels an operation. A running operation has its token fired.
    pub fn cancel(&self, id: TransferId) -> Result<(), QueueError> {
        self.finish_now(id, TransferState::Canceled)
    }

    /// Takes an operation off the roster without canceling its transfer.
    pub fn pause(&self, id: TransferId) -> Result<(), QueueError> {
        self.finish_now(id, TransferState::Paused)
    }

    /// Removes an operation, canceling it if it has not finished.
    ///
    /// Returns `false` if the operation was not queued.
    pub fn remove(&self, id: TransferId) -> bool {
        self.finish_now(id, TransferState::Canceled).is_ok()
    }

    fn finish_now(&self, id: TransferId, state: TransferState) -> Result<(), QueueError> {
        let change = self.shared.lock().finish(id, state).ok_or(QueueError::NotFound(id))?;
        debug!(op = %id, key = %change.1, state = ?state, "operation stopped");
        self.shared.emit_changes(vec![change]);
        Ok(())
    }

    /// Substitutes queued operation `old` with `new` at the same roster
    /// position. Operations waiting on `old` now wait on `new`.
    pub fn replace(&self, old: TransferId, new: Operation) -> Result<(), QueueError> {
        if !new.state.is_active() {
            return Err(QueueError::NotQueueable { id: new.id, state: new.state });
        }
        let spawn = {
            let mut inner = self.shared.lock();
            if inner.slots.contains_key(&new.id) {
                return Err(QueueError::AlreadyQueued(new.id));
            }
            let old_slot = inner.slots.remove(&old).ok_or(QueueError::NotFound(old))?;
            old_slot.cancel.cancel();
            if let Some(pos) = inner.roster.iter().position(|r| *r == old) {
                inner.roster[pos] = new.id;
            }

            let cancel = CancellationToken::new();
            let mut aliases = old_slot.aliases;
            aliases.extend(inner.waiting.remove(&new.id));
            let slot = Slot {
                key: new.key,
                state: TransferState::Pending,
                status: old_slot.status,
                aliases,
                cancel: cancel.clone(),
            };
            slot.publish(TransferState::Pending);
            inner.slots.insert(new.id, slot);
            self.shared.emit(QueueEvent::BatchChanged {
                changes: vec![
                    (old, old_slot.key, TransferState::Canceled),
                    (new.id, new.key, TransferState::Pending),
                ],
            });
            Spawn {
                id: new.id,
                key: new.key,
                kind: new.kind,
                deps: inner.subscribe(&new.dependencies),
                cancel,
            }
        };
        tokio::spawn(drive(Arc::clone(&self.shared), spawn));
        Ok(())
    }

    /// Cancels every queued operation.
    pub fn cancel_all(&self) -> usize {
        self.drain(TransferState::Canceled)
    }

    /// Pauses every queued operation.
    pub fn pause_all(&self) -> usize {
        self.drain(TransferState::Paused)
    }

    fn drain(&self, state: TransferState) -> usize {
        let changes = self.shared.lock().drain(state);
        let count = changes.len();
        self.shared.emit_changes(changes);
        count
    }

    pub fn len(&self) -> usize {
        self.shared.lock().roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.shared.lock().slots.contains_key(&id)
    }

    /// Queued operation ids in submission order.
    pub fn roster(&self) -> Vec<TransferId> {
        self.shared.lock().roster.clone()
    }

    /// State of a queued operation, `None` once it left the roster.
    pub fn state(&self, id: TransferId) -> Option<TransferState> {
        self.shared.lock().slots.get(&id).map(|s| s.state)
    }
}

async fn wait_finished(rx: &mut watch::Receiver<TransferState>) -> TransferState {
    loop {
        let state = *rx.borrow_and_update();
        if is_finished(state) {
            return state;
        }
        if rx.changed().await.is_err() {
            let state = *rx.borrow();
            return if is_finished(state) { state } else { TransferState::Canceled };
        }
    }
}

fn normalize(outcome: TransferState) -> TransferState {
    match outcome {
        TransferState::Deleted => TransferState::Canceled,
        TransferState::Pending | TransferState::InProgress => {
            warn!(state = ?outcome, "runner returned an unfinished state");
            TransferState::Failed
        }
        other => other,
    }
}

async fn drive(shared: Arc<Shared>, spawn: Spawn) {
    let Spawn { id, key, kind, deps, cancel } = spawn;

    let mut blocked = None;
    for mut rx in deps {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            state = wait_finished(&mut rx) => state,
        };
        if state != TransferState::Complete {
            blocked = Some(blocking_state(blocked, state));
        }
    }
    if let Some(state) = blocked {
        trace!(op = %id, key = %key, state = ?state, "dependency did not complete");
        shared.finish(id, state);
        return;
    }

    let semaphore = Arc::clone(&shared.semaphore);
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = semaphore.acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return;
    };
    if !shared.start(id) {
        return;
    }

    let Some(runner) = shared.runner.upgrade() else {
        shared.finish(id, TransferState::Canceled);
        return;
    };
    trace!(op = %id, key = %key, kind = %kind, "operation started");
    let outcome = runner.run(RunContext { op: id, key, kind, cancel }).await;
    shared.finish(id, normalize(outcome));
}
