//! Per-node protocol engine: message dispatch, periodic driving, and the
//! orchestration that ties the four managers together.
//!
//! A started node runs three tasks: the inbox consumer (protocol receive
//! paths), the update worker (hello-derived PSet transitions), and the
//! periodic driver (failure accounting, activation timeout, hello beacon).
//! Structural state changes from the three tasks are serialized by a
//! per-node mutex; failure counters stay atomic outside it.

use crate::config::ProtocolConfig;
use crate::fabric::Fabric;
use crate::message::{Message, Payload, BROADCAST};
use crate::pset::{LinkStatus, PsetManager};
use crate::pset_state::{classify, next_status, PsetStateTracker, PsetUpdate};
use crate::routing::RoutingTable;
use crate::types::{NodeId, PathId};
use crate::vset::VsetManager;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bounded depth of the upper-layer delivery channel.
const DELIVERY_DEPTH: usize = 64;

/// Retry bound for the best-effort path-id generator.
const PATH_ID_RETRIES: usize = 100;

/// Application data that reached its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub src: NodeId,
    pub payload: Vec<u8>,
}

/// One participant in the virtual ring.
pub struct Node {
    id: NodeId,
    config: ProtocolConfig,
    fabric: Arc<dyn Fabric>,

    active: AtomicBool,
    inactivity_ticks: AtomicU32,

    pset: PsetManager,
    vset: VsetManager,
    routes: RoutingTable,
    tracker: PsetStateTracker,

    /// Serializes structural mutation between the three node tasks.
    state_mu: Mutex<()>,

    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    update_rx: Mutex<Option<mpsc::Receiver<PsetUpdate>>>,

    delivery_tx: mpsc::Sender<Delivery>,
    delivery_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,

    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node attached to `fabric`. The node is inactive and idle
    /// until [`Node::start`] is called.
    pub fn new(id: NodeId, fabric: Arc<dyn Fabric>, config: ProtocolConfig) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_depth);
        let (tracker, update_rx) = PsetStateTracker::new(id, config.update_queue_depth);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_DEPTH);
        let (stop_tx, _) = watch::channel(false);

        Arc::new(Self {
            id,
            fabric,
            active: AtomicBool::new(false),
            inactivity_ticks: AtomicU32::new(0),
            pset: PsetManager::new(id),
            vset: VsetManager::new(id, config.vset_size),
            routes: RoutingTable::new(id),
            tracker,
            state_mu: Mutex::new(()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            update_rx: Mutex::new(Some(update_rx)),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Force the activity flag, e.g. to seed the first overlay member.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn pset(&self) -> &PsetManager {
        &self.pset
    }

    pub fn vset(&self) -> &VsetManager {
        &self.vset
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn tracker(&self) -> &PsetStateTracker {
        &self.tracker
    }

    /// Sender half of the bounded inbox, for fabric registration.
    pub fn inbox_sender(&self) -> mpsc::Sender<Message> {
        self.inbox_tx.clone()
    }

    /// Take the upper-layer delivery channel. Returns `None` after the
    /// first call.
    pub async fn delivery_receiver(&self) -> Option<mpsc::Receiver<Delivery>> {
        self.delivery_rx.lock().await.take()
    }

    /// Spawn the inbox consumer, the update worker, and the periodic
    /// driver.
    pub async fn start(self: &Arc<Self>) {
        let mut inbox_rx = match self.inbox_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!(node = self.id, "node already started");
                return;
            }
        };
        let mut update_rx = match self.update_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        let mut handles = self.tasks.lock().await;

        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = inbox_rx.recv() => match maybe {
                        Some(msg) => node.dispatch(msg).await,
                        None => break,
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(node = node.id, "inbox consumer stopped");
        }));

        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = update_rx.recv() => match maybe {
                        Some(update) => node.apply_pset_update(update).await,
                        None => break,
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(node = node.id, "update worker stopped");
        }));

        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                let period = node.jittered_period();
                tokio::select! {
                    _ = tokio::time::sleep(period) => node.tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(node = node.id, "periodic driver stopped");
        }));

        info!(node = self.id, "node started");
    }

    /// Signal shutdown and wait for all tasks to finish their in-flight
    /// work. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut handles = self.tasks.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!(node = self.id, "node stopped");
    }

    // ------------------------------------------------------------------
    // Public protocol API
    // ------------------------------------------------------------------

    /// Route application data toward `dst`. Returns false when no route
    /// exists.
    pub fn send_data(&self, dst: NodeId, payload: Vec<u8>) -> bool {
        let next_hop = self.routes.next_hop(dst);
        if next_hop == 0 {
            warn!(node = self.id, dst, "no route to destination");
            return false;
        }

        debug!(node = self.id, dst, next_hop, "sending data");
        self.fabric.send(Message {
            src: self.id,
            dst,
            sender: self.id,
            next_hop,
            payload: Payload::Data { payload },
        });
        true
    }

    /// Broadcast a hello beacon out of cycle.
    pub async fn send_hello(&self) {
        let _guard = self.state_mu.lock().await;
        self.emit_hello().await;
    }

    // ------------------------------------------------------------------
    // Periodic driver
    // ------------------------------------------------------------------

    fn jittered_period(&self) -> Duration {
        let base = self.config.hello_period;
        let jitter = self.config.hello_jitter;
        if jitter.is_zero() {
            return base;
        }
        let bound = jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-bound..=bound);
        if offset >= 0 {
            base + Duration::from_millis(offset as u64)
        } else {
            base.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
        }
    }

    async fn tick(&self) {
        let _guard = self.state_mu.lock().await;
        self.detect_failures().await;
        self.activation_tick();
        self.emit_hello().await;
    }

    /// Charge every neighbor one silent tick; mark failed at the timeout,
    /// purge at twice the timeout.
    async fn detect_failures(&self) {
        let mut dirty = false;
        for info in self.pset.snapshot() {
            let count = match self.pset.inc_fail(info.node) {
                Some(count) => count,
                None => continue,
            };

            if count >= self.config.fail_timeout && info.status != LinkStatus::Failed {
                debug!(node = self.id, neighbor = info.node, "marking silent neighbor failed");
                self.pset.update(info.node, LinkStatus::Failed, info.active);
                dirty = true;
            }

            if count >= 2 * self.config.fail_timeout {
                info!(node = self.id, neighbor = info.node, "purging failed neighbor");
                self.pset.remove(info.node);
                dirty = true;
            }
        }
        if dirty {
            self.tracker.refresh(&self.pset).await;
        }
    }

    /// Count idle ticks while inactive; self-activate at the deadline. The
    /// hello emitted at the end of the same tick announces the activation.
    fn activation_tick(&self) {
        if self.is_active() {
            return;
        }
        let ticks = self.inactivity_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks >= self.config.active_timeout {
            self.active.store(true, Ordering::Relaxed);
            info!(node = self.id, ticks, "activating after timeout with no virtual neighbors");
        }
    }

    async fn emit_hello(&self) {
        self.tracker.refresh(&self.pset).await;
        let lists = self.tracker.lists().await;
        self.fabric.send(Message {
            src: self.id,
            dst: BROADCAST,
            sender: self.id,
            next_hop: BROADCAST,
            payload: Payload::Hello {
                active: self.is_active(),
                linked_active: lists.linked_active,
                linked_inactive: lists.linked_inactive,
                pending: lists.pending,
            },
        });
    }

    // ------------------------------------------------------------------
    // Receive paths
    // ------------------------------------------------------------------

    async fn dispatch(&self, msg: Message) {
        let Message {
            src,
            dst,
            sender,
            payload,
            ..
        } = msg;
        trace!(node = self.id, kind = %payload.kind(), src, dst, sender, "received message");

        let _guard = self.state_mu.lock().await;
        self.inactivity_ticks.store(0, Ordering::Relaxed);
        self.pset.reset_fail(src);

        match payload {
            Payload::Hello {
                active,
                linked_active,
                linked_inactive,
                pending,
            } => self.receive_hello(src, active, &linked_active, &linked_inactive, &pending),
            Payload::SetupReq { proxy, vset } => {
                self.receive_setup_req(src, dst, proxy, vset).await
            }
            Payload::Setup {
                path_id,
                proxy,
                vset,
            } => self.receive_setup(src, dst, sender, path_id, proxy, vset).await,
            Payload::SetupFail { proxy, vset } => {
                self.receive_setup_fail(src, dst, proxy, vset).await
            }
            Payload::Teardown {
                path_id,
                endpoint,
                vset,
            } => self.receive_teardown(sender, path_id, endpoint, vset).await,
            Payload::Data { payload } => self.receive_data(src, dst, payload),
        }
    }

    fn receive_hello(
        &self,
        src: NodeId,
        active: bool,
        linked_active: &[NodeId],
        linked_inactive: &[NodeId],
        pending: &[NodeId],
    ) {
        let relation = classify(self.id, linked_active, linked_inactive, pending);
        self.tracker.schedule(PsetUpdate {
            node: src,
            relation,
            active,
        });
    }

    /// Apply one hello-derived transition. Runs on the update worker.
    async fn apply_pset_update(&self, update: PsetUpdate) {
        let _guard = self.state_mu.lock().await;

        let current = self.pset.status(update.node);
        let next = next_status(current, update.relation);

        match current {
            None => {
                self.pset.add(update.node, next, update.active);
                self.tracker.refresh(&self.pset).await;
            }
            Some(status) => {
                let active = self.pset.active(update.node).unwrap_or(false);
                if status != next || active != update.active {
                    self.pset.update(update.node, next, update.active);
                    self.tracker.refresh(&self.pset).await;
                }
            }
        }

        // Node-join trigger: an inactive node that sees an active neighbor
        // settle at Linked asks it to proxy an admission request.
        if !self.is_active() && update.active && next == LinkStatus::Linked {
            debug!(
                node = self.id,
                proxy = update.node,
                "requesting overlay admission via linked neighbor"
            );
            let vset = self.vset.all().await;
            self.send_setup_req(self.id, self.id, update.node, vset, update.node);
        }
    }

    async fn receive_setup_req(&self, src: NodeId, dst: NodeId, proxy: NodeId, vset: Vec<NodeId>) {
        let next_hop = self.routes.next_hop_exclude(dst, src);
        if next_hop != 0 {
            self.send_setup_req(src, dst, proxy, vset, next_hop);
            return;
        }

        // This node terminates the request: admit the requester and answer
        // with a setup carrying the pre-admission vset snapshot.
        let snapshot = self.vset.all().await;
        if self.vset_add(src, &vset).await {
            let path_id = self.new_path_id().await;
            self.send_setup(src, path_id, proxy, snapshot);
        } else {
            self.send_setup_fail(self.id, src, proxy, snapshot, self.id);
        }
    }

    async fn receive_setup(
        &self,
        src: NodeId,
        dst: NodeId,
        sender: NodeId,
        path_id: PathId,
        proxy: NodeId,
        vset: Vec<NodeId>,
    ) {
        // Resolution ends at the destination; en route, a physical neighbor
        // wins over routing toward the proxy.
        let next_hop = if dst == self.id {
            0
        } else if self.pset.contains(dst) {
            dst
        } else {
            self.routes.next_hop(proxy)
        };
        let na = if sender == self.id { 0 } else { sender };

        let added = self.routes.add(src, dst, na, next_hop, path_id);
        if !added || (sender != self.id && !self.pset.is_active_linked(sender)) {
            warn!(node = self.id, path_id, src, "setup not installable, tearing down");
            self.tear_down_path(path_id, src, sender).await;
            return;
        }

        if next_hop != 0 {
            self.forward_setup(src, dst, path_id, proxy, vset, next_hop);
            return;
        }

        if dst == self.id {
            if self.vset_add(src, &vset).await {
                if !self.active.swap(true, Ordering::Relaxed) {
                    info!(node = self.id, "joined overlay, now active");
                }
            } else {
                self.tear_down_path(path_id, src, 0).await;
            }
            return;
        }

        // No next hop and not the destination: unreachable in a well-formed
        // run.
        warn!(node = self.id, path_id, dst, "setup stranded short of destination");
        self.tear_down_path(path_id, src, 0).await;
    }

    async fn receive_setup_fail(&self, src: NodeId, dst: NodeId, proxy: NodeId, vset: Vec<NodeId>) {
        let next_hop = if dst == self.id {
            0
        } else if self.pset.contains(dst) {
            dst
        } else {
            self.routes.next_hop(proxy)
        };
        if next_hop != 0 {
            self.send_setup_fail(src, dst, proxy, vset, next_hop);
            return;
        }

        if dst == self.id {
            // Absorb the refusing side's view without admitting it directly.
            let mut merged = vset;
            merged.push(src);
            self.vset_add(0, &merged).await;
        }
    }

    async fn receive_teardown(
        &self,
        sender: NodeId,
        path_id: PathId,
        endpoint: NodeId,
        vset: Vec<NodeId>,
    ) {
        let entry = match self.routes.remove(path_id, endpoint) {
            Some(entry) => entry,
            None => return,
        };

        let next = if sender == entry.na { entry.nb } else { entry.na };
        if next != 0 {
            self.send_teardown(path_id, endpoint, vset, next);
            return;
        }

        // This node is one of the path endpoints; the severed virtual
        // neighbor is the other one.
        let lost = if entry.na == 0 { entry.eb } else { entry.ea };
        self.vset.remove(lost).await;

        if !vset.is_empty() {
            // Maintenance teardown: converge on the peer's view in a single
            // pass.
            self.vset_add(0, &vset).await;
        }
        // A fault-propagation teardown (empty vset) leaves repair to the
        // next periodic cycle.
    }

    fn receive_data(&self, src: NodeId, dst: NodeId, payload: Vec<u8>) {
        if dst == self.id {
            debug!(node = self.id, src, bytes = payload.len(), "data delivered");
            if let Err(e) = self.delivery_tx.try_send(Delivery { src, payload }) {
                debug!(node = self.id, error = %e, "delivery hook not draining, data lost");
            }
            return;
        }

        let next_hop = self.routes.next_hop(dst);
        if next_hop == 0 {
            warn!(node = self.id, dst, "no route for data, dropping");
            return;
        }
        self.fabric.send(Message {
            src,
            dst,
            sender: self.id,
            next_hop,
            payload: Payload::Data { payload },
        });
    }

    // ------------------------------------------------------------------
    // VSet and teardown orchestration
    // ------------------------------------------------------------------

    /// High-level vset admission: solicit paths to every interesting member
    /// of the peer's view, then admit `src` itself if it belongs. A bump
    /// caused by the admission tears down every path to the displaced
    /// identifier. `src = 0` merges the view without admitting anyone.
    async fn vset_add(&self, src: NodeId, peer_vset: &[NodeId]) -> bool {
        let snapshot = self.vset.all().await;
        for &candidate in peer_vset {
            if !self.vset.should_add(candidate).await {
                continue;
            }
            if let Some(proxy) = self.pset.pick_random_active_proxy() {
                self.send_setup_req(self.id, candidate, proxy, snapshot.clone(), proxy);
            }
        }

        if src != 0 && self.vset.should_add(src).await {
            if let Some(bumped) = self.vset.add(src).await {
                self.tear_down_path_to(bumped).await;
            }
            return true;
        }
        false
    }

    /// Remove the path and notify its live next hops. A `sender` of 0 marks
    /// a self-initiated teardown and attaches the own vset so the far
    /// endpoint can converge instead of rebuilding.
    async fn tear_down_path(&self, path_id: PathId, endpoint: NodeId, sender: NodeId) {
        let entry = match self.routes.remove(path_id, endpoint) {
            Some(entry) => entry,
            None => return,
        };

        let vset = if sender == 0 {
            self.vset.all().await
        } else {
            Vec::new()
        };

        for hop in [entry.na, entry.nb] {
            if hop != 0 && self.pset.is_active_linked(hop) {
                self.send_teardown(path_id, endpoint, vset.clone(), hop);
            }
        }
    }

    /// Tear down every path anchored at `endpoint`, self-initiated.
    async fn tear_down_path_to(&self, endpoint: NodeId) {
        debug!(node = self.id, endpoint, "tearing down all paths to endpoint");
        for entry in self.routes.entries_for_endpoint(endpoint) {
            self.tear_down_path(entry.path_id, entry.ea, 0).await;
        }
    }

    /// Best-effort random path id avoiding 0, the all-ones value, this
    /// node's id and its current vset members.
    async fn new_path_id(&self) -> PathId {
        let vset = self.vset.all().await;
        let mut rng = rand::thread_rng();
        for _ in 0..PATH_ID_RETRIES {
            let candidate: PathId = rng.gen();
            if candidate != 0
                && candidate != u32::MAX
                && candidate != self.id
                && !vset.contains(&candidate)
            {
                return candidate;
            }
        }
        warn!(node = self.id, "path id generator exhausted retries");
        rng.gen()
    }

    // ------------------------------------------------------------------
    // Send helpers
    // ------------------------------------------------------------------

    fn send_setup_req(
        &self,
        src: NodeId,
        dst: NodeId,
        proxy: NodeId,
        vset: Vec<NodeId>,
        next_hop: NodeId,
    ) {
        debug!(node = self.id, src, dst, proxy, next_hop, "sending setup request");
        self.fabric.send(Message {
            src,
            dst,
            sender: self.id,
            next_hop,
            payload: Payload::SetupReq { proxy, vset },
        });
    }

    /// Originate a setup toward the admitted requester, starting with a
    /// local self-receive.
    fn send_setup(&self, dst: NodeId, path_id: PathId, proxy: NodeId, vset: Vec<NodeId>) {
        debug!(node = self.id, dst, path_id, proxy, "originating setup");
        self.fabric.send(Message {
            src: self.id,
            dst,
            sender: self.id,
            next_hop: self.id,
            payload: Payload::Setup {
                path_id,
                proxy,
                vset,
            },
        });
    }

    fn forward_setup(
        &self,
        src: NodeId,
        dst: NodeId,
        path_id: PathId,
        proxy: NodeId,
        vset: Vec<NodeId>,
        next_hop: NodeId,
    ) {
        debug!(node = self.id, src, dst, path_id, next_hop, "forwarding setup");
        self.fabric.send(Message {
            src,
            dst,
            sender: self.id,
            next_hop,
            payload: Payload::Setup {
                path_id,
                proxy,
                vset,
            },
        });
    }

    fn send_setup_fail(
        &self,
        src: NodeId,
        dst: NodeId,
        proxy: NodeId,
        vset: Vec<NodeId>,
        next_hop: NodeId,
    ) {
        debug!(node = self.id, src, dst, next_hop, "sending setup fail");
        self.fabric.send(Message {
            src,
            dst,
            sender: self.id,
            next_hop,
            payload: Payload::SetupFail { proxy, vset },
        });
    }

    fn send_teardown(&self, path_id: PathId, endpoint: NodeId, vset: Vec<NodeId>, next_hop: NodeId) {
        debug!(node = self.id, path_id, endpoint, next_hop, "sending teardown");
        self.fabric.send(Message {
            src: self.id,
            dst: 0,
            sender: self.id,
            next_hop,
            payload: Payload::Teardown {
                path_id,
                endpoint,
                vset,
            },
        });
    }
}
