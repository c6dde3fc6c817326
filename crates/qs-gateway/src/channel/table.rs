//! Active channel table.
//!
//! Channels share the observable lifecycle (fingerprint key, idle countdown,
//! restart) but keep no value: messages are fanned out live and never replayed
//! to late joiners.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use qs_wire::{frame, Payload};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::emitter::ChannelEmitter;
use crate::domain::config::ChannelsConfig;
use crate::domain::error::{ErrorTarget, SyncError, SyncResult};
use crate::domain::route::{RouteHandler, RouteKind, RouteSpec};
use crate::domain::session::ClientId;
use crate::lifecycle::{self, Sweep};
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::{CloseHandle, FrameSink, FunctionError};

struct ChannelSubscriber {
    sink: Arc<dyn FrameSink>,
    wire_id: u64,
}

#[derive(Default)]
struct Throttle {
    /// A flush timer is running
    armed: bool,
    /// Latest message published while the window was open
    pending: Option<Payload>,
}

struct ChannelEntry {
    id: u64,
    route: Arc<RouteSpec>,
    payload: Payload,
    clients: HashMap<ClientId, ChannelSubscriber>,
    /// Connections registered to publish without receiving
    publishers: HashSet<ClientId>,
    throttle: Throttle,
    error: Option<SyncError>,
    does_not_exist: bool,
    idle_deadline: Option<Instant>,
    generation: u64,
    close: Option<CloseHandle>,
    closed: bool,
}

impl ChannelEntry {
    fn is_referenced(&self) -> bool {
        !self.clients.is_empty() || !self.publishers.is_empty()
    }
}

type Slot = Arc<Mutex<ChannelEntry>>;

/// Where a client publish goes: the route's publish hook and the emitter it
/// should publish through.
pub struct PublishTarget {
    pub route: Arc<RouteSpec>,
    pub payload: Payload,
    pub emitter: ChannelEmitter,
}

/// Registry of live pub/sub channels.
pub struct ChannelTable {
    me: Weak<ChannelTable>,
    entries: DashMap<u64, Slot>,
    config: ChannelsConfig,
    metrics: Arc<GatewayMetrics>,
    waker: Notify,
}

fn check_channel(route: &RouteSpec) -> SyncResult<()> {
    match route.kind() {
        RouteKind::Channel => Ok(()),
        actual => Err(SyncError::FunctionIsWrongType {
            name: route.name.clone(),
            expected: RouteKind::Channel,
            actual,
        }),
    }
}

impl ChannelTable {
    pub fn new(config: ChannelsConfig, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            entries: DashMap::new(),
            config,
            metrics,
            waker: Notify::new(),
        })
    }

    pub fn config(&self) -> &ChannelsConfig {
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

    /// Whether `client_id` holds a healthy `id` in the given role.
    pub fn is_attached(&self, id: u64, client_id: ClientId, wire_id: u64, as_publisher: bool) -> bool {
        self.slot(id).is_some_and(|s| {
            let entry = s.lock();
            if entry.closed || entry.error.is_some() {
                return false;
            }
            if as_publisher {
                entry.publishers.contains(&client_id)
            } else {
                entry.clients.get(&client_id).is_some_and(|sub| sub.wire_id == wire_id)
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots().iter().map(|(_, s)| s.lock().clients.len()).sum()
    }

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
        debug!(channel_id = id, route = %route.name, "channel created");
        self.metrics.record_channel_created();
        Arc::new(Mutex::new(ChannelEntry {
            id,
            route,
            payload,
            clients: HashMap::new(),
            publishers: HashSet::new(),
            throttle: Throttle::default(),
            error: None,
            does_not_exist: false,
            idle_deadline: Some(Instant::now() + idle),
            generation: 0,
            close: None,
            closed: false,
        }))
    }

    /// Register a new channel and start its publisher.
    pub fn create(&self, id: u64, route: Arc<RouteSpec>, payload: Payload) -> SyncResult<()> {
        check_channel(&route)?;
        match self.entries.entry(id) {
            MapEntry::Occupied(_) => {
                return Err(SyncError::internal(format!("channel {id} already exists")))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.new_slot(id, Arc::clone(&route), payload.clone()));
            }
        }
        self.waker.notify_one();
        self.start(id, 0, route, payload);
        Ok(())
    }

    fn ensure(&self, id: u64, route: &Arc<RouteSpec>, payload: &Payload) -> SyncResult<Slot> {
        check_channel(route)?;
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
        let emitter = ChannelEmitter::new(self.me.clone(), id, generation);
        let table = self.me.clone();
        tokio::spawn(async move {
            let started = AssertUnwindSafe(async {
                match &route.handler {
                    RouteHandler::Channel(channel) => Some(channel.subscribe(payload, emitter).await),
                    RouteHandler::Relay(upstream) => {
                        Some(upstream.subscribe_channel(&route.name, payload, emitter).await)
                    }
                    _ => None,
                }
            })
            .catch_unwind()
            .await;
            let result = match started {
                Ok(Some(result)) => result,
                Ok(None) => return,
                Err(_) => Err(FunctionError::new("channel panicked while starting")),
            };
            let Some(table) = table.upgrade() else {
                return;
            };
            match result {
                Ok(handle) => table.store_close(id, generation, handle),
                Err(e) => {
                    warn!(channel_id = id, route = %route.name, error = %e, "channel failed to start");
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
        handle.close();
    }

    /// Attach to an existing channel.
    pub fn subscribe(&self, id: u64, sink: Arc<dyn FrameSink>, wire_id: u64) -> SyncResult<()> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SyncError::internal(format!("channel {id} not found")))?;
        let mut entry = slot.lock();
        if entry.closed {
            return Err(SyncError::internal(format!("channel {id} closed")));
        }
        self.attach(&mut entry, sink, wire_id);
        Ok(())
    }

    /// Attach to the channel for `id`, creating it first if needed.
    pub fn join(
        &self,
        id: u64,
        route: &Arc<RouteSpec>,
        payload: &Payload,
        sink: Arc<dyn FrameSink>,
        wire_id: u64,
    ) -> SyncResult<()> {
        loop {
            let slot = self.ensure(id, route, payload)?;
            let mut entry = slot.lock();
            if entry.closed {
                continue;
            }
            self.attach(&mut entry, sink, wire_id);
            return Ok(());
        }
    }

    fn attach(&self, entry: &mut ChannelEntry, sink: Arc<dyn FrameSink>, wire_id: u64) {
        entry.idle_deadline = None;
        if let Some(error) = &entry.error {
            let frame = error
                .report(Some(ErrorTarget::Channel(wire_id)))
                .with_payload(&entry.payload)
                .to_frame();
            self.metrics.record_frame(frame.len(), false);
            sink.send_frame(frame);
        }
        let client_id = sink.client_id();
        debug!(channel_id = entry.id, %client_id, "joined channel");
        if entry
            .clients
            .insert(client_id, ChannelSubscriber { sink, wire_id })
            .is_none()
        {
            self.metrics.record_subscribe();
        }
    }

    /// Register `client_id` as a publisher, creating the channel if needed.
    /// Publishers keep the channel alive but receive nothing.
    pub fn register_publisher(
        &self,
        id: u64,
        route: &Arc<RouteSpec>,
        payload: &Payload,
        client_id: ClientId,
    ) -> SyncResult<()> {
        loop {
            let slot = self.ensure(id, route, payload)?;
            let mut entry = slot.lock();
            if entry.closed {
                continue;
            }
            entry.idle_deadline = None;
            entry.publishers.insert(client_id);
            debug!(channel_id = id, %client_id, "publisher registered");
            return Ok(());
        }
    }

    /// Detach a subscriber or publisher. Idempotent.
    pub fn unsubscribe(&self, id: u64, client_id: ClientId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        let was_client = entry.clients.remove(&client_id).is_some();
        let was_publisher = entry.publishers.remove(&client_id);
        if was_client {
            self.metrics.record_unsubscribe();
        }
        if !(was_client || was_publisher) {
            return false;
        }
        debug!(channel_id = id, %client_id, "left channel");
        self.release(&mut entry);
        true
    }

    fn release(&self, entry: &mut ChannelEntry) {
        if entry.closed || entry.is_referenced() || entry.idle_deadline.is_some() {
            return;
        }
        let idle = entry
            .route
            .close_after_idle
            .unwrap_or(self.config.close_after_idle);
        entry.idle_deadline = Some(Instant::now() + idle);
        self.waker.notify_one();
    }

    /// Route, payload and emitter for a client publishing into `id`.
    pub fn publisher(&self, id: u64) -> Option<PublishTarget> {
        let slot = self.slot(id)?;
        let entry = slot.lock();
        if entry.closed {
            return None;
        }
        Some(PublishTarget {
            route: Arc::clone(&entry.route),
            payload: entry.payload.clone(),
            emitter: ChannelEmitter::new(self.me.clone(), id, entry.generation),
        })
    }

    pub(crate) fn on_publish(&self, id: u64, generation: u64, message: Payload) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.closed || entry.generation != generation {
            return false;
        }
        entry.error = None;
        match entry.route.throttle {
            None => self.fan_out(&entry, &message),
            Some(_) if entry.throttle.armed => {
                // last write wins inside the window
                entry.throttle.pending = Some(message);
            }
            Some(window) => {
                self.fan_out(&entry, &message);
                entry.throttle.armed = true;
                self.arm_flush(id, generation, window);
            }
        }
        true
    }

    fn arm_flush(&self, id: u64, generation: u64, window: Duration) {
        let table = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(table) = table.upgrade() {
                table.flush(id, generation);
            }
        });
    }

    /// Close a throttle window, sending the latest coalesced message.
    fn flush(&self, id: u64, generation: u64) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let mut entry = slot.lock();
        if entry.closed || entry.generation != generation {
            return;
        }
        match (entry.throttle.pending.take(), entry.route.throttle) {
            (Some(message), Some(window)) => {
                self.fan_out(&entry, &message);
                self.arm_flush(id, generation, window);
            }
            (Some(message), None) => {
                self.fan_out(&entry, &message);
                entry.throttle.armed = false;
            }
            (None, _) => entry.throttle.armed = false,
        }
    }

    fn fan_out(&self, entry: &ChannelEntry, message: &Payload) {
        if entry.clients.is_empty() {
            return;
        }
        let frame = match frame::encode_channel_message(entry.id, message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel_id = entry.id, error = %e, "channel message cannot be encoded");
                return;
            }
        };
        for sub in entry.clients.values() {
            self.deliver(entry.id, sub, &frame);
        }
    }

    fn deliver(&self, id: u64, sub: &ChannelSubscriber, frame: &Bytes) {
        let out = if sub.wire_id == id {
            frame.clone()
        } else {
            match frame::with_id(frame, sub.wire_id) {
                Ok(aliased) => aliased,
                Err(e) => {
                    warn!(channel_id = id, wire_id = sub.wire_id, error = %e, "cannot alias frame");
                    return;
                }
            }
        };
        self.metrics.record_frame(out.len(), false);
        sub.sink.send_frame(out);
    }

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

    fn fail_locked(&self, entry: &mut ChannelEntry, error: SyncError) {
        debug!(channel_id = entry.id, error = %error, "channel failed");
        for sub in entry.clients.values() {
            let frame = error
                .report(Some(ErrorTarget::Channel(sub.wire_id)))
                .with_payload(&entry.payload)
                .to_frame();
            self.metrics.record_frame(frame.len(), false);
            sub.sink.send_frame(frame);
        }
        entry.throttle = Throttle::default();
        entry.error = Some(error);
    }

    /// Close the publisher and remove the entry.
    pub fn destroy(&self, id: u64) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let (close, clients) = {
            let mut entry = slot.lock();
            if entry.closed {
                return false;
            }
            Self::close_locked(&mut entry)
        };
        self.finish_teardown(id, &slot, close, clients);
        true
    }

    fn close_locked(entry: &mut ChannelEntry) -> (Option<CloseHandle>, usize) {
        entry.closed = true;
        entry.idle_deadline = None;
        entry.publishers.clear();
        let clients = std::mem::take(&mut entry.clients).len();
        (entry.close.take(), clients)
    }

    fn finish_teardown(&self, id: u64, slot: &Slot, close: Option<CloseHandle>, clients: usize) {
        self.entries.remove_if(&id, |_, v| Arc::ptr_eq(v, slot));
        for _ in 0..clients {
            self.metrics.record_unsubscribe();
        }
        if let Some(close) = close {
            close.close();
        }
        self.metrics.record_channel_destroyed();
        debug!(channel_id = id, "channel destroyed");
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

    /// Re-run the publisher of every channel named `route.name`, keeping
    /// subscribers. Channels confirmed missing are skipped.
    pub fn restart_by_name(&self, route: &Arc<RouteSpec>) -> usize {
        let wrong_type = check_channel(route).err();
        let mut restarted = 0;
        for (id, slot) in self.slots_named(&route.name) {
            let (old, generation, payload, pending) = {
                let mut entry = slot.lock();
                if entry.closed || entry.does_not_exist {
                    continue;
                }
                // flush what the old window held before its timer goes stale
                let pending = entry.throttle.pending.take();
                if let Some(message) = &pending {
                    self.fan_out(&entry, message);
                }
                entry.throttle = Throttle::default();
                entry.generation += 1;
                entry.route = Arc::clone(route);
                entry.error = None;
                let old = entry.close.take();
                if let Some(error) = &wrong_type {
                    self.fail_locked(&mut entry, error.clone());
                }
                (old, entry.generation, entry.payload.clone(), pending.is_some())
            };
            if let Some(old) = old {
                old.close();
            }
            if wrong_type.is_none() {
                debug!(channel_id = id, route = %route.name, flushed = pending, "channel restarted");
                self.start(id, generation, Arc::clone(route), payload);
            }
            restarted += 1;
        }
        restarted
    }

    /// The backing function of `name` is gone: stop its channels, report
    /// `FunctionNotFound`, and never restart them.
    pub fn mark_missing(&self, name: &str) -> usize {
        let slots = self.slots_named(name);
        for (_, slot) in &slots {
            let old = {
                let mut entry = slot.lock();
                if entry.closed {
                    continue;
                }
                entry.does_not_exist = true;
                entry.generation += 1;
                self.fail_locked(&mut entry, SyncError::not_found(name));
                entry.close.take()
            };
            if let Some(old) = old {
                old.close();
            }
        }
        slots.len()
    }

    pub fn close_all(&self) {
        for (id, _) in self.slots() {
            self.destroy(id);
        }
    }
}

impl Sweep for ChannelTable {
    fn sweep(&self, now: Instant) -> Option<Duration> {
        let mut shortest = None;
        for (id, slot) in self.slots() {
            let (close, clients) = {
                let mut entry = slot.lock();
                if entry.closed {
                    continue;
                }
                match entry.idle_deadline {
                    Some(deadline) if deadline <= now => Self::close_locked(&mut entry),
                    Some(deadline) => {
                        shortest = lifecycle::shortest(shortest, deadline, now);
                        continue;
                    }
                    None => continue,
                }
            };
            self.finish_teardown(id, &slot, close, clients);
        }
        shortest
    }

    fn waker(&self) -> &Notify {
        &self.waker
    }

    fn label(&self) -> &'static str {
        "channels"
    }
}
