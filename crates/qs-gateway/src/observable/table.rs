//! Active observable table.
//!
//! One entry per distinct (route, payload) fingerprint, shared by every client
//! that asks for it. Each entry caches the encoded full frame for its current
//! checksum and, when worthwhile, a diff frame from the previous checksum.
//!
//! Locking: the map hands out `Arc<Mutex<Entry>>` slots. A map guard is never
//! held while an entry is locked, and no entry lock is held while calling
//! user code (executors, close handles).

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use qs_wire::{frame, Payload, HEADER_SIZE};
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::emitter::{ObservableEmitter, Update};
use crate::domain::config::ObservablesConfig;
use crate::domain::error::{ErrorTarget, SyncError, SyncResult};
use crate::domain::route::{RouteHandler, RouteKind, RouteSpec};
use crate::domain::session::ClientId;
use crate::lifecycle::{self, Sweep};
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::{CloseHandle, FrameSink, FunctionError};

/// Values whose full body is smaller than this are always sent whole.
pub const MIN_DIFF_BODY: usize = 32;

/// Header, id and checksum in front of a full-value body.
const FULL_FRAME_PREFIX: usize = HEADER_SIZE + 16;

/// The cached state for one checksum.
#[derive(Debug)]
pub struct CachedValue {
    pub checksum: u64,
    pub payload: Payload,
    /// Full-value frame under the table id
    pub full: Bytes,
    pub diff: Option<DiffFrame>,
}

/// Diff frame from `previous` to the owning value's checksum.
#[derive(Debug)]
pub struct DiffFrame {
    pub previous: u64,
    pub frame: Bytes,
}

impl CachedValue {
    /// Best frame for a client that last saw `known`, `None` if it is current.
    pub fn frame_for(&self, known: u64) -> Option<(&Bytes, bool)> {
        if known == self.checksum {
            return None;
        }
        match &self.diff {
            Some(diff) if known != 0 && diff.previous == known => Some((&diff.frame, true)),
            _ => Some((&self.full, false)),
        }
    }
}

/// Result of a one-shot read.
#[derive(Debug, Clone)]
pub enum GetOutcome {
    /// The caller's checksum is current
    UpToDate { checksum: u64 },
    Value(Arc<CachedValue>),
}

impl GetOutcome {
    fn resolve(value: Arc<CachedValue>, known: u64) -> Self {
        if value.checksum == known {
            GetOutcome::UpToDate { checksum: known }
        } else {
            GetOutcome::Value(value)
        }
    }
}

enum State {
    Pending,
    Ready(Arc<CachedValue>),
    Failed(SyncError),
}

struct Subscriber {
    sink: Arc<dyn FrameSink>,
    /// Id the client used, echoed on every frame it receives
    wire_id: u64,
    last_checksum: u64,
}

type Waiter = oneshot::Sender<SyncResult<Arc<CachedValue>>>;

struct ObservableEntry {
    id: u64,
    route: Arc<RouteSpec>,
    payload: Payload,
    state: State,
    clients: HashMap<ClientId, Subscriber>,
    waiters: Vec<Waiter>,
    idle_deadline: Option<Instant>,
    generation: u64,
    close: Option<CloseHandle>,
    closed: bool,
}

impl ObservableEntry {
    fn is_referenced(&self) -> bool {
        !self.clients.is_empty() || !self.waiters.is_empty()
    }

    fn checksum(&self) -> u64 {
        match &self.state {
            State::Ready(value) => value.checksum,
            _ => 0,
        }
    }
}

/// What a closed entry still owns, released outside its lock.
struct Teardown {
    close: Option<CloseHandle>,
    waiters: Vec<Waiter>,
    clients: HashMap<ClientId, Subscriber>,
}

type Slot = Arc<Mutex<ObservableEntry>>;

/// Registry of live query subscriptions.
pub struct ObservableTable {
    me: Weak<ObservableTable>,
    entries: DashMap<u64, Slot>,
    config: ObservablesConfig,
    metrics: Arc<GatewayMetrics>,
    waker: Notify,
}

fn check_query(route: &RouteSpec) -> SyncResult<()> {
    match route.kind() {
        RouteKind::Query => Ok(()),
        actual => Err(SyncError::FunctionIsWrongType {
            name: route.name.clone(),
            expected: RouteKind::Query,
            actual,
        }),
    }
}

impl ObservableTable {
    pub fn new(config: ObservablesConfig, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            entries: DashMap::new(),
            config,
            metrics,
            waker: Notify::new(),
        })
    }

    pub fn config(&self) -> &ObservablesConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, id: u64) -> Option<Slot> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    fn slots(&self) -> Vec<(u64, Slot)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    pub fn has(&self, id: u64) -> bool {
        self.slot(id).is_some_and(|s| !s.lock().closed)
    }

    /// Current checksum, `0` while pending or failed.
    pub fn checksum(&self, id: u64) -> Option<u64> {
        let slot = self.slot(id)?;
        let entry = slot.lock();
        (!entry.closed).then(|| entry.checksum())
    }

    /// Whether `client_id` is attached to a healthy `id` under `wire_id`.
    pub fn is_attached(&self, id: u64, client_id: ClientId, wire_id: u64) -> bool {
        self.slot(id).is_some_and(|s| {
            let entry = s.lock();
            !entry.closed
                && !matches!(entry.state, State::Failed(_))
                && entry.clients.get(&client_id).is_some_and(|sub| sub.wire_id == wire_id)
        })
    }

    /// Total subscribers over all observables
    pub fn subscriber_count(&self) -> usize {
        self.slots().iter().map(|(_, s)| s.lock().clients.len()).sum()
    }

    /// Route names with at least one live observable.
    pub fn names(&self) -> HashSet<String> {
        self.slots()
            .iter()
            .filter_map(|(_, s)| {
                let entry = s.lock();
                (!entry.closed).then(|| entry.route.name.clone())
            })
            .collect()
    }

    pub(crate) fn is_current(&self, id: u64, generation: u64) -> bool {
        self.slot(id).is_some_and(|s| {
            let entry = s.lock();
            !entry.closed && entry.generation == generation
        })
    }

    fn new_slot(&self, id: u64, route: Arc<RouteSpec>, payload: Payload) -> Slot {
        let idle = route.close_after_idle.unwrap_or(self.config.close_after_idle);
        debug!(observable_id = id, route = %route.name, "observable created");
        self.metrics.record_observable_created();
        Arc::new(Mutex::new(ObservableEntry {
            id,
            route,
            payload,
            state: State::Pending,
            clients: HashMap::new(),
            waiters: Vec::new(),
            // unreferenced until somebody attaches
            idle_deadline: Some(Instant::now() + idle),
            generation: 0,
            close: None,
            closed: false,
        }))
    }

    /// Register a new observable and start its executor.
    ///
    /// Fails if `id` is already present.
    pub fn create(&self, id: u64, route: Arc<RouteSpec>, payload: Payload) -> SyncResult<()> {
        check_query(&route)?;
        match self.entries.entry(id) {
            MapEntry::Occupied(_) => {
                return Err(SyncError::internal(format!("observable {id} already exists")))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.new_slot(id, Arc::clone(&route), payload.clone()));
            }
        }
        self.waker.notify_one();
        self.start(id, 0, route, payload);
        Ok(())
    }

    /// Live slot for `id`, created when absent.
    fn ensure(&self, id: u64, route: &Arc<RouteSpec>, payload: &Payload) -> SyncResult<Slot> {
        check_query(route)?;
        loop {
            let (slot, created) = match self.entries.entry(id) {
                MapEntry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
                MapEntry::Vacant(vacant) => {
                    let slot = self.new_slot(id, Arc::clone(route), payload.clone());
                    vacant.insert(Arc::clone(&slot));
                    (slot, true)
                }
            };
            if created {
                self.start(id, 0, Arc::clone(route), payload.clone());
                return Ok(slot);
            }
            if !slot.lock().closed {
                return Ok(slot);
            }
            // destroyed under us; drop the stale slot and retry
            self.entries.remove_if(&id, |_, v| Arc::ptr_eq(v, &slot));
        }
    }

    /// Look up `id` and cancel any idle countdown.
    pub fn get_and_extend(&self, id: u64) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.closed {
            return false;
        }
        entry.idle_deadline = None;
        true
    }

    fn start(&self, id: u64, generation: u64, route: Arc<RouteSpec>, payload: Payload) {
        let RouteHandler::Query(executor) = &route.handler else {
            return;
        };
        let executor = Arc::clone(executor);
        let emitter = ObservableEmitter::new(self.me.clone(), id, generation);
        let table = self.me.clone();
        let name = route.name.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(executor.start(payload, emitter))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(FunctionError::new("query panicked while starting")));
            let Some(table) = table.upgrade() else {
                return;
            };
            match result {
                Ok(handle) => table.store_close(id, generation, handle),
                Err(e) => {
                    warn!(observable_id = id, route = %name, error = %e, "query failed to start");
                    table.on_error(id, generation, e);
                }
            }
        });
    }

    fn store_close(&self, id: u64, generation: u64, handle: CloseHandle) {
        if let Some(slot) = self.slot(id) {
            let mut entry = slot.lock();
            if !entry.closed && entry.generation == generation {
                entry.close = Some(handle);
                return;
            }
        }
        // entry went away while the executor was starting
        handle.close();
    }

    /// Attach to an existing observable.
    pub fn subscribe(
        &self,
        id: u64,
        sink: Arc<dyn FrameSink>,
        wire_id: u64,
        known_checksum: u64,
    ) -> SyncResult<()> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SyncError::internal(format!("observable {id} not found")))?;
        let mut entry = slot.lock();
        if entry.closed {
            return Err(SyncError::internal(format!("observable {id} closed")));
        }
        self.attach(&mut entry, sink, wire_id, known_checksum);
        Ok(())
    }

    /// Attach to the observable for `id`, creating it first if needed.
    pub fn join(
        &self,
        id: u64,
        route: &Arc<RouteSpec>,
        payload: &Payload,
        sink: Arc<dyn FrameSink>,
        wire_id: u64,
        known_checksum: u64,
    ) -> SyncResult<()> {
        loop {
            let slot = self.ensure(id, route, payload)?;
            let mut entry = slot.lock();
            if entry.closed {
                continue;
            }
            self.attach(&mut entry, sink, wire_id, known_checksum);
            return Ok(());
        }
    }

    fn attach(
        &self,
        entry: &mut ObservableEntry,
        sink: Arc<dyn FrameSink>,
        wire_id: u64,
        known: u64,
    ) {
        entry.idle_deadline = None;
        let mut last_checksum = known;
        match &entry.state {
            State::Ready(value) => {
                if let Some((frame, is_diff)) = value.frame_for(known) {
                    self.deliver(entry.id, sink.as_ref(), wire_id, frame, is_diff);
                    last_checksum = value.checksum;
                }
            }
            State::Failed(error) => {
                let frame = error
                    .report(Some(ErrorTarget::Observable(wire_id)))
                    .with_payload(&entry.payload)
                    .to_frame();
                self.metrics.record_frame(frame.len(), false);
                sink.send_frame(frame);
                last_checksum = 0;
            }
            State::Pending => {}
        }
        let client_id = sink.client_id();
        debug!(observable_id = entry.id, %client_id, "subscribed");
        let previous = entry.clients.insert(
            client_id,
            Subscriber {
                sink,
                wire_id,
                last_checksum,
            },
        );
        if previous.is_none() {
            self.metrics.record_subscribe();
        }
    }

    /// Detach a client. Idempotent.
    pub fn unsubscribe(&self, id: u64, client_id: ClientId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.clients.remove(&client_id).is_none() {
            return false;
        }
        debug!(observable_id = id, %client_id, "unsubscribed");
        self.metrics.record_unsubscribe();
        self.release(&mut entry);
        true
    }

    /// Start the idle countdown if nothing references the entry.
    fn release(&self, entry: &mut ObservableEntry) {
        if entry.closed || entry.is_referenced() || entry.idle_deadline.is_some() {
            return;
        }
        let idle = entry
            .route
            .close_after_idle
            .unwrap_or(self.config.close_after_idle);
        entry.idle_deadline = Some(Instant::now() + idle);
        debug!(observable_id = entry.id, idle_ms = idle.as_millis() as u64, "idle countdown started");
        self.waker.notify_one();
    }

    /// One-shot read, creating the observable if needed and waiting for its
    /// first value.
    pub async fn get(
        &self,
        id: u64,
        route: &Arc<RouteSpec>,
        payload: &Payload,
        known_checksum: u64,
    ) -> SyncResult<GetOutcome> {
        let waiter = match self.begin_get(id, route, payload, known_checksum)? {
            Ok(outcome) => return Ok(outcome),
            Err(waiter) => waiter,
        };
        match waiter.await {
            Ok(Ok(value)) => Ok(GetOutcome::resolve(value, known_checksum)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SyncError::internal(format!(
                "observable {id} closed before producing a value"
            ))),
        }
    }

    #[allow(clippy::type_complexity)]
    fn begin_get(
        &self,
        id: u64,
        route: &Arc<RouteSpec>,
        payload: &Payload,
        known: u64,
    ) -> SyncResult<Result<GetOutcome, oneshot::Receiver<SyncResult<Arc<CachedValue>>>>> {
        loop {
            let slot = self.ensure(id, route, payload)?;
            let mut entry = slot.lock();
            if entry.closed {
                continue;
            }
            entry.idle_deadline = None;
            let settled = match &entry.state {
                State::Ready(value) => Some(Ok(Arc::clone(value))),
                State::Failed(error) => Some(Err(error.clone())),
                State::Pending => None,
            };
            return match settled {
                Some(result) => {
                    self.release(&mut entry);
                    result.map(|value| Ok(GetOutcome::resolve(value, known)))
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    Ok(Err(rx))
                }
            };
        }
    }

    /// Apply a value emitted by generation `generation` of the executor.
    pub(crate) fn on_update(&self, id: u64, generation: u64, update: Update) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.closed || entry.generation != generation {
            return false;
        }
        let Update {
            data,
            checksum,
            patch,
        } = update;
        let checksum = checksum.unwrap_or_else(|| qs_wire::hash_payload(&data));
        let previous = match &entry.state {
            State::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        };
        if previous.as_ref().is_some_and(|p| p.checksum == checksum) {
            return true;
        }

        let full = match frame::encode_subscription_data(id, checksum, &data) {
            Ok(full) => full,
            Err(e) => {
                warn!(observable_id = id, error = %e, "value cannot be encoded");
                let name = entry.route.name.clone();
                self.fail_locked(&mut entry, SyncError::function(name, e.to_string()));
                return true;
            }
        };
        let diffing = entry.route.diffing.unwrap_or(self.config.diff_enabled);
        let diff = match previous {
            Some(prev) if diffing => encode_diff(id, checksum, &prev, &data, patch, &full),
            _ => None,
        };
        let value = Arc::new(CachedValue {
            checksum,
            payload: data,
            full,
            diff,
        });
        debug!(
            observable_id = id,
            checksum,
            has_diff = value.diff.is_some(),
            "observable updated"
        );
        entry.state = State::Ready(Arc::clone(&value));

        for sub in entry.clients.values_mut() {
            if let Some((frame, is_diff)) = value.frame_for(sub.last_checksum) {
                self.deliver(id, sub.sink.as_ref(), sub.wire_id, frame, is_diff);
                sub.last_checksum = value.checksum;
            }
        }
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Ok(Arc::clone(&value)));
        }
        self.release(&mut entry);
        true
    }

    /// Apply a failure reported by generation `generation` of the executor.
    pub(crate) fn on_error(&self, id: u64, generation: u64, error: FunctionError) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.closed || entry.generation != generation {
            return false;
        }
        let error = error.into_sync(&entry.route.name);
        self.fail_locked(&mut entry, error);
        true
    }

    fn fail_locked(&self, entry: &mut ObservableEntry, error: SyncError) {
        debug!(observable_id = entry.id, error = %error, "observable failed");
        for sub in entry.clients.values_mut() {
            let frame = error
                .report(Some(ErrorTarget::Observable(sub.wire_id)))
                .with_payload(&entry.payload)
                .to_frame();
            self.metrics.record_frame(frame.len(), false);
            sub.sink.send_frame(frame);
            sub.last_checksum = 0;
        }
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        entry.state = State::Failed(error);
        self.release(entry);
    }

    fn deliver(&self, id: u64, sink: &dyn FrameSink, wire_id: u64, frame: &Bytes, is_diff: bool) {
        let out = if wire_id == id {
            frame.clone()
        } else {
            match frame::with_id(frame, wire_id) {
                Ok(aliased) => aliased,
                Err(e) => {
                    warn!(observable_id = id, wire_id, error = %e, "cannot alias frame");
                    return;
                }
            }
        };
        self.metrics.record_frame(out.len(), is_diff);
        sink.send_frame(out);
    }

    fn close_locked(entry: &mut ObservableEntry) -> Teardown {
        entry.closed = true;
        entry.idle_deadline = None;
        Teardown {
            close: entry.close.take(),
            waiters: std::mem::take(&mut entry.waiters),
            clients: std::mem::take(&mut entry.clients),
        }
    }

    fn finish_teardown(&self, id: u64, slot: &Slot, teardown: Teardown) {
        self.entries.remove_if(&id, |_, v| Arc::ptr_eq(v, slot));
        for _ in 0..teardown.clients.len() {
            self.metrics.record_unsubscribe();
        }
        // dropping the waiters wakes pending reads with a closed error
        drop(teardown.waiters);
        if let Some(close) = teardown.close {
            close.close();
        }
        self.metrics.record_observable_destroyed();
        debug!(observable_id = id, "observable destroyed");
    }

    /// Close the executor and remove the entry.
    pub fn destroy(&self, id: u64) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let teardown = {
            let mut entry = slot.lock();
            if entry.closed {
                return false;
            }
            Self::close_locked(&mut entry)
        };
        self.finish_teardown(id, &slot, teardown);
        true
    }

    fn slots_named(&self, name: &str) -> Vec<(u64, Slot)> {
        self.slots()
            .into_iter()
            .filter(|(_, s)| {
                let entry = s.lock();
                !entry.closed && entry.route.name == name
            })
            .collect()
    }

    /// Re-run every observable of `route.name` against a new definition,
    /// keeping subscribers and cached values.
    pub fn restart_by_name(&self, route: &Arc<RouteSpec>) -> usize {
        let slots = self.slots_named(&route.name);
        let wrong_type = check_query(route).err();
        for (id, slot) in &slots {
            let (old, generation, payload) = {
                let mut entry = slot.lock();
                if entry.closed {
                    continue;
                }
                entry.generation += 1;
                entry.route = Arc::clone(route);
                let old = entry.close.take();
                if let Some(error) = &wrong_type {
                    self.fail_locked(&mut entry, error.clone());
                }
                (old, entry.generation, entry.payload.clone())
            };
            if let Some(old) = old {
                old.close();
            }
            if wrong_type.is_none() {
                debug!(observable_id = id, route = %route.name, "observable restarted");
                self.start(*id, generation, Arc::clone(route), payload);
            }
        }
        slots.len()
    }

    /// Stop every observable of `name` and report `error` to its subscribers.
    pub fn fail_by_name(&self, name: &str, error: SyncError) -> usize {
        let slots = self.slots_named(name);
        for (_, slot) in &slots {
            let old = {
                let mut entry = slot.lock();
                if entry.closed {
                    continue;
                }
                entry.generation += 1;
                self.fail_locked(&mut entry, error.clone());
                entry.close.take()
            };
            if let Some(old) = old {
                old.close();
            }
        }
        slots.len()
    }

    /// Destroy everything, for shutdown.
    pub fn close_all(&self) {
        for (id, _) in self.slots() {
            self.destroy(id);
        }
    }
}

fn encode_diff(
    id: u64,
    checksum: u64,
    previous: &CachedValue,
    data: &Payload,
    supplied: Option<(u64, Value)>,
    full: &Bytes,
) -> Option<DiffFrame> {
    if full.len() < FULL_FRAME_PREFIX + MIN_DIFF_BODY {
        return None;
    }
    let patch = match supplied {
        Some((base, patch)) if base == previous.checksum => patch,
        // computed against a state this table never delivered
        Some(_) => return None,
        None => qs_wire::diff(previous.payload.as_json()?, data.as_json()?),
    };
    let frame = frame::encode_subscription_diff(id, checksum, previous.checksum, &patch).ok()?;
    (frame.len() < full.len()).then_some(DiffFrame {
        previous: previous.checksum,
        frame,
    })
}

impl Sweep for ObservableTable {
    fn sweep(&self, now: Instant) -> Option<Duration> {
        let mut shortest = None;
        for (id, slot) in self.slots() {
            let teardown = {
                let mut entry = slot.lock();
                if entry.closed {
                    continue;
                }
                // GET callers that gave up
                entry.waiters.retain(|w| !w.is_closed());
                self.release(&mut entry);
                match entry.idle_deadline {
                    Some(deadline) if deadline <= now => Self::close_locked(&mut entry),
                    Some(deadline) => {
                        shortest = lifecycle::shortest(shortest, deadline, now);
                        continue;
                    }
                    None => continue,
                }
            };
            self.finish_teardown(id, &slot, teardown);
        }
        shortest
    }

    fn waker(&self) -> &Notify {
        &self.waker
    }

    fn label(&self) -> &'static str {
        "observables"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ManualQuery, Panicking, RecordingSink};
    use qs_wire::OutgoingFrame;
    use serde_json::json;

    fn table() -> Arc<ObservableTable> {
        ObservableTable::new(ObservablesConfig::default(), Arc::new(GatewayMetrics::new()))
    }

    fn rows(n: u64) -> Value {
        Value::Array(
            (1..=n)
                .map(|i| json!({"id": i, "name": format!("row-{i}")}))
                .collect(),
        )
    }

    async fn setup() -> (
        Arc<ObservableTable>,
        Arc<RouteSpec>,
        ObservableEmitter,
        Arc<ManualQuery>,
    ) {
        let table = table();
        let (query, mut started) = ManualQuery::new();
        let route = Arc::new(RouteSpec::query("region", query.clone()));
        table.create(1, Arc::clone(&route), Payload::from(json!({}))).unwrap();
        let emitter = started.recv().await.unwrap();
        (table, route, emitter, query)
    }

    #[tokio::test]
    async fn test_full_then_silence_then_diff() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();

        assert!(emitter.update(Update::new(rows(2)).with_checksum(111)));
        assert!(emitter.update(Update::new(rows(2)).with_checksum(111)));
        assert!(emitter.update(Update::new(rows(3)).with_checksum(222)));

        let frames = sink.take_decoded();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[0],
            OutgoingFrame::SubscriptionData { id: 1, checksum: 111, .. }
        ));
        assert!(matches!(
            frames[1],
            OutgoingFrame::SubscriptionDiff {
                id: 1,
                checksum: 222,
                previous_checksum: 111,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recomputed_checksum_is_silent() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        emitter.update(rows(2));
        emitter.update(rows(2));
        assert_eq!(sink.take_decoded().len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_frame() {
        let (table, _, emitter, _) = setup().await;
        let first = RecordingSink::new();
        table.subscribe(1, first.clone(), 1, 0).unwrap();
        emitter.update(Update::new(rows(2)).with_checksum(111));
        emitter.update(Update::new(rows(3)).with_checksum(222));

        let second = RecordingSink::new();
        table.subscribe(1, second.clone(), 1, 0).unwrap();
        match &second.take_decoded()[..] {
            [OutgoingFrame::SubscriptionData { checksum, payload, .. }] => {
                assert_eq!(*checksum, 222);
                assert_eq!(payload, &Payload::from(rows(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscriber_at_previous_checksum_gets_diff() {
        let (table, _, emitter, _) = setup().await;
        emitter.update(Update::new(rows(2)).with_checksum(111));
        emitter.update(Update::new(rows(3)).with_checksum(222));

        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 111).unwrap();
        assert!(matches!(
            sink.take_decoded()[..],
            [OutgoingFrame::SubscriptionDiff { previous_checksum: 111, .. }]
        ));

        let current = RecordingSink::new();
        table.subscribe(1, current.clone(), 1, 222).unwrap();
        assert!(current.take_decoded().is_empty());
    }

    #[tokio::test]
    async fn test_small_values_never_diff() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        emitter.update(json!([1]));
        emitter.update(json!([1, 2]));
        let frames = sink.take_decoded();
        assert!(frames
            .iter()
            .all(|f| matches!(f, OutgoingFrame::SubscriptionData { .. })));
    }

    #[tokio::test]
    async fn test_supplied_patch_against_unknown_base_sends_full() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        emitter.update(Update::new(rows(4)).with_checksum(10));
        emitter.update(
            Update::new(rows(5))
                .with_checksum(11)
                .with_patch(999, json!([0, rows(5)])),
        );
        let frames = sink.take_decoded();
        assert!(matches!(frames[1], OutgoingFrame::SubscriptionData { checksum: 11, .. }));
    }

    #[tokio::test]
    async fn test_aliased_client_id() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 77, 0).unwrap();
        emitter.update(rows(2));
        assert!(matches!(
            sink.take_decoded()[..],
            [OutgoingFrame::SubscriptionData { id: 77, .. }]
        ));
    }

    #[tokio::test]
    async fn test_error_broadcast_and_replayed() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        emitter.update(rows(2));
        assert!(emitter.error(FunctionError::new("db down")));
        assert_eq!(table.checksum(1), Some(0));

        let frames = sink.take_decoded();
        match &frames[1] {
            OutgoingFrame::Error { error } => {
                assert_eq!(error["type"], "FunctionError");
                assert_eq!(error["observableId"], "1");
            }
            other => panic!("unexpected {:?}", other),
        }

        let late = RecordingSink::new();
        table.subscribe(1, late.clone(), 1, 0).unwrap();
        assert!(matches!(late.take_decoded()[..], [OutgoingFrame::Error { .. }]));

        // recovery sends the full value again
        emitter.update(rows(2));
        assert!(matches!(
            sink.take_decoded()[..],
            [OutgoingFrame::SubscriptionData { .. }]
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (table, _, _, _) = setup().await;
        let sink = RecordingSink::new();
        assert!(!table.unsubscribe(1, sink.id()));
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        assert!(table.unsubscribe(1, sink.id()));
        assert!(!table.unsubscribe(1, sink.id()));
        assert!(!table.unsubscribe(99, sink.id()));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_and_wrong_kind() {
        let (table, route, _, _) = setup().await;
        assert!(table.create(1, route, Payload::Undefined).is_err());

        let (channel, _) = crate::test_utils::ManualChannel::new();
        let not_query = Arc::new(RouteSpec::channel("chat", channel));
        assert!(matches!(
            table.create(2, not_query, Payload::Undefined),
            Err(SyncError::FunctionIsWrongType { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_resubscribe_keeps_cache() {
        let (table, _, emitter, query) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        emitter.update(rows(2));
        table.unsubscribe(1, sink.id());

        tokio::time::advance(Duration::from_millis(2900)).await;
        assert!(table.sweep(Instant::now()).is_some());
        assert!(table.get_and_extend(1));

        let again = RecordingSink::new();
        table.subscribe(1, again.clone(), 1, 0).unwrap();
        assert_eq!(again.take_decoded().len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(table.sweep(Instant::now()), None);
        assert!(table.has(1));
        assert_eq!(query.closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_destroyed_once() {
        let (table, _, emitter, query) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        table.unsubscribe(1, sink.id());

        tokio::time::advance(Duration::from_millis(2999)).await;
        table.sweep(Instant::now());
        assert!(table.has(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(table.sweep(Instant::now()), None);
        assert!(!table.has(1));
        assert!(!table.destroy(1));
        assert_eq!(query.closed(), 1);
        assert!(!emitter.update(rows(1)));
        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn test_get_waits_for_first_value() {
        let table = table();
        let (query, mut started) = ManualQuery::new();
        let route = Arc::new(RouteSpec::query("region", query));
        let payload = Payload::from(json!({}));

        let reader = {
            let table = Arc::clone(&table);
            let route = Arc::clone(&route);
            let payload = payload.clone();
            tokio::spawn(async move { table.get(5, &route, &payload, 0).await })
        };
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(json!({"n": 1})).with_checksum(9));

        match reader.await.unwrap().unwrap() {
            GetOutcome::Value(value) => assert_eq!(value.checksum, 9),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            table.get(5, &route, &payload, 9).await.unwrap(),
            GetOutcome::UpToDate { checksum: 9 }
        ));
    }

    #[tokio::test]
    async fn test_restart_preserves_subscribers() {
        let (table, route, old_emitter, query) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        old_emitter.update(rows(2));

        let (replacement, mut started) = ManualQuery::new();
        let new_route = Arc::new(RouteSpec::query(route.name.clone(), replacement));
        assert_eq!(table.restart_by_name(&new_route), 1);
        assert_eq!(query.closed(), 1);

        let emitter = started.recv().await.unwrap();
        assert!(!old_emitter.update(rows(9)));
        // same value from the new executor is not re-sent
        emitter.update(rows(2));
        emitter.update(rows(3));
        assert_eq!(sink.take_decoded().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_by_name() {
        let (table, _, emitter, _) = setup().await;
        let sink = RecordingSink::new();
        table.subscribe(1, sink.clone(), 1, 0).unwrap();
        assert_eq!(table.fail_by_name("region", SyncError::not_found("region")), 1);
        assert!(!emitter.update(rows(1)));
        match &sink.take_decoded()[..] {
            [OutgoingFrame::Error { error }] => assert_eq!(error["type"], "FunctionNotFound"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_entry() {
        let table = table();
        let route = Arc::new(RouteSpec::query("boom", Arc::new(Panicking)));
        let sink = RecordingSink::new();
        table.join(9, &route, &Payload::Undefined, sink.clone(), 9, 0).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            table.get(9, &route, &Payload::Undefined, 0),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SyncError::FunctionError { .. })));
        match &sink.take_decoded()[..] {
            [OutgoingFrame::Error { error }] => {
                assert_eq!(error["type"], "FunctionError");
                assert_eq!(error["observableId"], "9");
            }
            other => panic!("unexpected {:?}", other),
        }

        // once the subscriber leaves, the entry expires like any other
        assert!(table.unsubscribe(9, sink.id()));
        assert!(table.sweep(Instant::now() + Duration::from_secs(3600)).is_none());
        assert!(!table.has(9));
    }
}
