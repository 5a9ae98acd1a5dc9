//! The Coordinator (§4.1): single owner of reachability state, sole
//! producer of the advertised set, orchestrator of verification.
//!
//! Each table is guarded by its own lock, held only long enough to mutate
//! or snapshot it (§5). No lock is ever held across a callback, store
//! write, or network call.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use libp2p::PeerId;

use crate::address::{
    ip_component, ip_prefix, is_empty_address, is_wildcard, port_component, Address,
    AddressEntry, AddressPriority,
};
use crate::cancel::sleep_cancellable;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::state_machine::{self, StateMachineConfig};
use crate::store::{PersistentStore, StoredEntry};

/// §4.4.4: store and in-memory tables are swept on this fixed cadence,
/// independent of `verification_interval`.
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Bound on a single periodic re-verification pass (§4.1.5); distinct from
/// the per-helper `request_timeout` used inside the dial-back pool itself.
const REVERIFICATION_ROUND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WitnessRecord {
    pub peer_id: PeerId,
    pub ip_prefix: String,
    pub timestamp: std::time::Instant,
}

/// A full-address candidate annotated with confidence, for cold-start
/// sharing with newly-met peers (`bootstrap_candidates`). Never used to
/// populate the DHT (§4.1.1).
#[derive(Debug, Clone)]
pub struct BootstrapCandidate {
    pub addr: Address,
    pub priority: AddressPriority,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

type ChangeCallback = Arc<dyn Fn(Vec<Address>) + Send + Sync>;
type DialBackTrigger = Arc<dyn Fn(Address) + Send + Sync>;
type DiscoverFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Address>, CoordinatorError>> + Send + Sync>;
type ValidateFn =
    Arc<dyn Fn(Vec<Address>) -> BoxFuture<'static, Result<Vec<Address>, CoordinatorError>> + Send + Sync>;
/// Runs one periodic re-verification round (§4.1.5) and returns the
/// `(still_reachable, no_longer_reachable)` partition of the input.
type ReverificationFn =
    Arc<dyn Fn(Vec<Address>) -> BoxFuture<'static, (Vec<Address>, Vec<Address>)> + Send + Sync>;
/// Runs the witness-sender path for one outbound connection (§4.3.2).
type WitnessSenderFn = Arc<dyn Fn(PeerId, Address) -> BoxFuture<'static, ()> + Send + Sync>;

struct Tables {
    verified_addrs: RwLock<HashMap<Address, AddressEntry>>,
    candidate_addrs: RwLock<HashMap<Address, AddressEntry>>,
    relay_addrs: RwLock<Vec<Address>>,
    witness_ledger: RwLock<HashMap<Address, HashMap<(PeerId, String), WitnessRecord>>>,
    source_index: RwLock<HashMap<String, HashSet<Address>>>,
    listen_ports: RwLock<HashSet<u16>>,
    configured_helpers: RwLock<Vec<PeerId>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            verified_addrs: RwLock::new(HashMap::new()),
            candidate_addrs: RwLock::new(HashMap::new()),
            relay_addrs: RwLock::new(Vec::new()),
            witness_ledger: RwLock::new(HashMap::new()),
            source_index: RwLock::new(HashMap::new()),
            listen_ports: RwLock::new(HashSet::new()),
            configured_helpers: RwLock::new(Vec::new()),
        }
    }
}

/// Single owner of reachability state. Cheap to clone: internally an `Arc`,
/// matching the facade pattern used for the mesh network handle elsewhere
/// in this codebase.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    tables: Tables,
    store: RwLock<Option<Arc<PersistentStore>>>,
    on_address_changed: RwLock<Option<ChangeCallback>>,
    dial_back_trigger: RwLock<Option<DialBackTrigger>>,
    discover_fn: RwLock<Option<DiscoverFn>>,
    validate_fn: RwLock<Option<ValidateFn>>,
    reverification_fn: RwLock<Option<ReverificationFn>>,
    witness_sender: RwLock<Option<WitnessSenderFn>>,
    /// Shared with every spawned background loop so `stop()` can cancel all
    /// of them at once; distinct from any per-call `ctx` a caller passes in.
    running: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tables: Tables::default(),
                store: RwLock::new(None),
                on_address_changed: RwLock::new(None),
                dial_back_trigger: RwLock::new(None),
                discover_fn: RwLock::new(None),
                validate_fn: RwLock::new(None),
                reverification_fn: RwLock::new(None),
                witness_sender: RwLock::new(None),
                running: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Wires the persistent store (§9 cyclic component wiring: built
    /// separately, injected after construction).
    pub fn set_store(&self, store: Arc<PersistentStore>) {
        *self.inner.store.write().unwrap() = Some(store);
    }

    /// Registers the advertised-set change callback (§4.1.1).
    pub fn set_on_address_changed(&self, cb: impl Fn(Vec<Address>) + Send + Sync + 'static) {
        *self.inner.on_address_changed.write().unwrap() = Some(Arc::new(cb));
    }

    /// Wires the async dial-back kick-off triggered by new candidates.
    pub fn set_dial_back_trigger(&self, trigger: impl Fn(Address) + Send + Sync + 'static) {
        *self.inner.dial_back_trigger.write().unwrap() = Some(Arc::new(trigger));
    }

    /// Wires the discovery stage of §4.1.4: combining interface-scan IPs
    /// with bound listen ports.
    pub fn set_discover_fn(
        &self,
        f: impl Fn() -> BoxFuture<'static, Result<Vec<Address>, CoordinatorError>> + Send + Sync + 'static,
    ) {
        *self.inner.discover_fn.write().unwrap() = Some(Arc::new(f));
    }

    /// Wires the validation stage of §4.1.4: dial-back verification, or a
    /// pass-through when dial-back is disabled.
    pub fn set_validate_fn(
        &self,
        f: impl Fn(Vec<Address>) -> BoxFuture<'static, Result<Vec<Address>, CoordinatorError>>
            + Send
            + Sync
            + 'static,
    ) {
        *self.inner.validate_fn.write().unwrap() = Some(Arc::new(f));
    }

    /// Wires one periodic re-verification round (§4.1.5).
    pub fn set_reverification_fn(
        &self,
        f: impl Fn(Vec<Address>) -> BoxFuture<'static, (Vec<Address>, Vec<Address>)> + Send + Sync + 'static,
    ) {
        *self.inner.reverification_fn.write().unwrap() = Some(Arc::new(f));
    }

    /// Wires the witness-sender path run after every outbound connection
    /// (§4.3.2), bound to a concrete `ConnectionEndpoint` by the hosting
    /// runtime via [`crate::witness::witness_sender_fn`].
    pub fn set_witness_sender(
        &self,
        f: impl Fn(PeerId, Address) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        *self.inner.witness_sender.write().unwrap() = Some(Arc::new(f));
    }

    /// Seeds the coordinator's tables from a loaded store snapshot (§4.4.5).
    pub fn seed_from_store(
        &self,
        candidates: HashMap<String, StoredEntry>,
        verified: HashMap<String, StoredEntry>,
    ) {
        for (key, stored) in candidates {
            if let Some(addr) = key.parse::<Address>().ok() {
                self.insert_candidate_entry(addr, stored_to_entry(stored));
            }
        }
        for (key, stored) in verified {
            if let Some(addr) = key.parse::<Address>().ok() {
                self.insert_verified_entry(addr, stored_to_entry(stored));
            }
        }
    }

    /// Starts the background loops (§4.1.5, §4.3.6, §4.4.3, §4.4.4) against
    /// the coordinator's own long-lived cancellation signal. Idempotent:
    /// calling it again while already running is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_reverification_loop();
        self.spawn_store_cleanup_loop();
        self.spawn_witness_aging_loop();
        self.spawn_flush_loop();
    }

    /// Cancels every background loop. Does not block on in-flight work and
    /// is idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn spawn_reverification_loop(&self) {
        if !self.inner.config.enable_dial_back {
            return;
        }
        let coordinator = self.clone();
        let interval = self.inner.config.verification_interval;
        async_std::task::spawn(async move {
            loop {
                if !sleep_cancellable(interval, &coordinator.inner.running).await {
                    break;
                }
                let reverify = coordinator.inner.reverification_fn.read().unwrap().clone();
                let Some(reverify) = reverify else { continue };
                let snapshot = coordinator.verified_direct_addresses();
                if snapshot.is_empty() {
                    continue;
                }
                match async_std::future::timeout(REVERIFICATION_ROUND_TIMEOUT, reverify(snapshot)).await {
                    Ok((still_reachable, no_longer_reachable)) => {
                        coordinator.apply_reverification_result(&still_reachable, &no_longer_reachable);
                    }
                    Err(_) => log::warn!("periodic re-verification round timed out"),
                }
            }
        });
    }

    fn spawn_store_cleanup_loop(&self) {
        let coordinator = self.clone();
        async_std::task::spawn(async move {
            loop {
                if !sleep_cancellable(STORE_CLEANUP_INTERVAL, &coordinator.inner.running).await {
                    break;
                }
                let store = coordinator.inner.store.read().unwrap().clone();
                let Some(store) = store else { continue };
                let (expired_candidates, expired_verified) = store.expire_stale(crate::store::unix_now());
                coordinator.mirror_store_expiry(&expired_candidates, &expired_verified);
            }
        });
    }

    fn spawn_witness_aging_loop(&self) {
        let coordinator = self.clone();
        let ttl = self.inner.config.witness_ttl;
        let interval = (ttl / 2).max(Duration::from_secs(60));
        async_std::task::spawn(async move {
            loop {
                if !sleep_cancellable(interval, &coordinator.inner.running).await {
                    break;
                }
                coordinator.age_witness_ledger(ttl);
            }
        });
    }

    fn spawn_flush_loop(&self) {
        let store = self.inner.store.read().unwrap().clone();
        let Some(store) = store else { return };
        let running = self.inner.running.clone();
        let debounce = self.inner.config.flush_debounce;
        async_std::task::spawn(async move {
            store.run_debounced_flush(debounce, running).await;
        });
    }

    /// Mirrors a store-cleanup sweep's removals into the in-memory tables
    /// (§4.4.4): keys that fail to parse back into an `Address` were never
    /// reachable from these tables in the first place and are skipped.
    fn mirror_store_expiry(&self, expired_candidates: &[String], expired_verified: &[String]) {
        let mut changed = false;
        for key in expired_candidates {
            if let Ok(addr) = key.parse::<Address>() {
                if self.inner.tables.candidate_addrs.write().unwrap().remove(&addr).is_some() {
                    self.remove_from_source_index(&addr);
                }
            }
        }
        for key in expired_verified {
            if let Ok(addr) = key.parse::<Address>() {
                if self.inner.tables.verified_addrs.write().unwrap().remove(&addr).is_some() {
                    changed = true;
                }
            }
        }
        if changed {
            self.notify_address_changed();
        }
    }

    /// Drives one discover→validate→publish cycle (§4.1.4) using the
    /// callbacks bound via `set_discover_fn`/`set_validate_fn`. Publishing
    /// credits each validated address as verified directly, without going
    /// back through the dial-back or witness paths. With no state machine
    /// wired, this degrades to firing a bare change notification so
    /// subscribers still see the current advertised set.
    pub fn trigger_address_update(&self) {
        let discover = self.inner.discover_fn.read().unwrap().clone();
        let validate = self.inner.validate_fn.read().unwrap().clone();
        let (discover, validate) = match (discover, validate) {
            (Some(d), Some(v)) => (d, v),
            _ => {
                self.notify_address_changed();
                return;
            }
        };

        let coordinator = self.clone();
        async_std::task::spawn(async move {
            let config = StateMachineConfig::default();
            let publish_coordinator = coordinator.clone();
            let (_transitions, result) = state_machine::run(
                &config,
                move || discover(),
                move |addrs| validate(addrs),
                move |addrs: Vec<Address>| {
                    let coordinator = publish_coordinator.clone();
                    Box::pin(async move {
                        for addr in addrs {
                            coordinator.on_direct_address_verified(
                                addr,
                                "state_machine",
                                AddressPriority::VerifiedDirect,
                            );
                        }
                        Ok(())
                    }) as BoxFuture<'static, Result<(), CoordinatorError>>
                },
            )
            .await;
            if let Err(e) = result {
                log::warn!("discover-validate-publish cycle ended in failure: {}", e);
            }
        });
    }

    /// Ingress: an outbound connection completed. Kicks off the witness
    /// sender path (§4.3.2) asynchronously; the sender itself enforces a 5s
    /// deadline and never blocks or fails the caller's connection.
    pub fn on_outbound_connected(&self, conn: PeerId, dialed: Address) {
        if is_empty_address(&dialed.to_string()) {
            return;
        }
        let sender = self.inner.witness_sender.read().unwrap().clone();
        if let Some(sender) = sender {
            async_std::task::spawn(async move {
                sender(conn, dialed).await;
            });
        }
    }

    // ---- §4.1.1 public contract -------------------------------------------------

    /// The advertised-set algorithm (§4.1.2).
    pub fn advertised_addrs(&self) -> Vec<Address> {
        let verified_snapshot: Vec<AddressEntry> = {
            let verified = self.inner.tables.verified_addrs.read().unwrap();
            verified.values().cloned().collect()
        };
        let listen_ports_snapshot: HashSet<u16> =
            self.inner.tables.listen_ports.read().unwrap().clone();
        let filtered_verified = filter_verified_entries(
            verified_snapshot,
            &listen_ports_snapshot,
            self.inner.config.max_verified_direct_addrs,
        );

        let relay_snapshot: Vec<Address> = self.inner.tables.relay_addrs.read().unwrap().clone();

        let mut tagged: Vec<(Address, AddressPriority, std::time::Instant)> = filtered_verified
            .iter()
            .map(|e| (e.addr.clone(), e.priority, e.last_seen.0))
            .collect();
        for addr in &relay_snapshot {
            tagged.push((addr.clone(), AddressPriority::RelayGuarantee, std::time::Instant::now()));
        }

        // I6: local-listen fallback only when verified and relay are both empty.
        if filtered_verified.is_empty() && relay_snapshot.is_empty() {
            for port in &listen_ports_snapshot {
                // Listen addresses without a known public IP are represented
                // as wildcard-free loopback-free placeholders; the hosting
                // runtime is expected to have already registered a concrete
                // local-listen candidate via `on_direct_address_candidate`
                // with `AddressPriority::LocalListen` for anything richer.
                let _ = port;
            }
            let local_listen_snapshot: Vec<AddressEntry> = {
                let candidates = self.inner.tables.candidate_addrs.read().unwrap();
                candidates
                    .values()
                    .filter(|e| e.priority == AddressPriority::LocalListen && !is_wildcard(&e.addr))
                    .cloned()
                    .collect()
            };
            for e in local_listen_snapshot {
                tagged.push((e.addr, e.priority, e.last_seen.0));
            }
        }

        tagged.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));

        let mut seen = HashSet::new();
        tagged
            .into_iter()
            .filter(|(addr, _, _)| seen.insert(addr.clone()))
            .map(|(addr, _, _)| addr)
            .collect()
    }

    pub fn verified_direct_addresses(&self) -> Vec<Address> {
        self.advertised_addrs()
            .into_iter()
            .filter(|addr| {
                self.inner
                    .tables
                    .verified_addrs
                    .read()
                    .unwrap()
                    .get(addr)
                    .map(|e| e.priority.is_verified_tier())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn candidate_direct_addresses(&self) -> Vec<Address> {
        self.inner
            .tables
            .candidate_addrs
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    pub fn relay_addresses(&self) -> Vec<Address> {
        self.inner.tables.relay_addrs.read().unwrap().clone()
    }

    pub fn has_verified_direct(&self) -> bool {
        !self.inner.tables.verified_addrs.read().unwrap().is_empty()
    }

    pub fn has_relay(&self) -> bool {
        !self.inner.tables.relay_addrs.read().unwrap().is_empty()
    }

    /// Cold-start bootstrap candidates for sharing with a freshly-met peer.
    /// Never used to populate the DHT (§4.1.1).
    pub fn bootstrap_candidates(&self, _local_node_id: PeerId) -> Vec<BootstrapCandidate> {
        let mut out = Vec::new();
        for addr in self.verified_direct_addresses() {
            out.push(BootstrapCandidate {
                addr,
                priority: AddressPriority::VerifiedDirect,
                confidence: Confidence::High,
            });
        }
        for addr in self.candidate_direct_addresses() {
            out.push(BootstrapCandidate {
                addr,
                priority: AddressPriority::Unverified,
                confidence: Confidence::Low,
            });
        }
        for addr in self.relay_addresses() {
            out.push(BootstrapCandidate {
                addr,
                priority: AddressPriority::RelayGuarantee,
                confidence: Confidence::Medium,
            });
        }
        out
    }

    /// Ingress: an unverified candidate was discovered. Triggers an async
    /// dial-back kick-off if one is wired and dial-back is enabled.
    pub fn on_direct_address_candidate(&self, addr: Address, source: &str, priority: AddressPriority) {
        if is_empty_address(&addr.to_string()) {
            log::warn!("rejected empty address candidate from source {}", source);
            return;
        }
        let entry = AddressEntry::new(addr.clone(), priority, source);
        self.insert_candidate_entry(addr.clone(), entry);
        self.persist_candidate(&addr);

        if self.inner.config.enable_dial_back {
            if let Some(trigger) = self.inner.dial_back_trigger.read().unwrap().clone() {
                trigger(addr);
            }
        }
    }

    /// Ingress: the address has been proven reachable. Moves it from
    /// candidate to verified (I1).
    pub fn on_direct_address_verified(&self, addr: Address, source: &str, priority: AddressPriority) {
        if is_empty_address(&addr.to_string()) {
            log::warn!("rejected empty address in on_direct_address_verified");
            return;
        }
        self.inner.tables.candidate_addrs.write().unwrap().remove(&addr);
        self.remove_from_source_index(&addr);
        self.inner
            .store
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.remove_candidate(&addr.to_string()));

        let mut entry = AddressEntry::new(addr.clone(), priority, source);
        entry.mark_verified();
        self.insert_verified_entry(addr.clone(), entry);
        self.persist_verified(&addr, source, priority);
        self.index_source(source, &addr);

        self.notify_address_changed();
    }

    /// Ingress: the address is no longer considered reachable.
    pub fn on_direct_address_expired(&self, addr: Address) {
        if is_empty_address(&addr.to_string()) {
            return;
        }
        let removed = self.inner.tables.verified_addrs.write().unwrap().remove(&addr).is_some();
        if removed {
            self.inner
                .store
                .read()
                .unwrap()
                .as_ref()
                .map(|s| s.remove_verified(&addr.to_string()));
            self.notify_address_changed();
        }
    }

    /// Ingress: replace the relay address set wholesale (I5).
    pub fn on_relay_reserved(&self, addrs: Vec<Address>) {
        let addrs: Vec<Address> = addrs
            .into_iter()
            .filter(|a| !is_empty_address(&a.to_string()))
            .collect();
        *self.inner.tables.relay_addrs.write().unwrap() = addrs;
        self.notify_address_changed();
    }

    /// Ingress: replace all candidates attributed to `source` with `list`,
    /// diffing against the current source-index membership.
    pub fn update_direct_candidates(&self, source: &str, list: Vec<Address>) {
        let list: Vec<Address> = list
            .into_iter()
            .filter(|a| !is_empty_address(&a.to_string()))
            .collect();
        let new_set: HashSet<Address> = list.iter().cloned().collect();

        let previous = self
            .inner
            .tables
            .source_index
            .read()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_default();

        for addr in previous.difference(&new_set) {
            self.inner.tables.candidate_addrs.write().unwrap().remove(addr);
            self.inner
                .store
                .read()
                .unwrap()
                .as_ref()
                .map(|s| s.remove_candidate(&addr.to_string()));
        }

        for addr in &list {
            let entry = AddressEntry::new(addr.clone(), AddressPriority::Unverified, source);
            self.insert_candidate_entry(addr.clone(), entry);
            self.persist_candidate(addr);
        }

        self.inner
            .tables
            .source_index
            .write()
            .unwrap()
            .insert(source.to_string(), new_set);
    }

    /// Ingress: record a witness and possibly promote to `VerifiedDirect`
    /// (§4.3.4, I10/P10).
    pub fn on_inbound_witness(&self, dialed_addr: Address, peer_id: PeerId, remote_ip: IpAddr) {
        if is_empty_address(&dialed_addr.to_string()) {
            return;
        }
        let is_candidate = self
            .inner
            .tables
            .candidate_addrs
            .read()
            .unwrap()
            .contains_key(&dialed_addr);
        if !is_candidate {
            log::debug!("witness for non-candidate address ignored");
            return;
        }

        let prefix = ip_prefix(
            remote_ip,
            self.inner.config.witness_ipv4_prefix,
            self.inner.config.witness_ipv6_prefix,
        );

        let distinct_prefixes = {
            let mut ledger = self.inner.tables.witness_ledger.write().unwrap();
            let bucket = ledger.entry(dialed_addr.clone()).or_default();
            bucket.entry((peer_id, prefix.clone())).or_insert(WitnessRecord {
                peer_id,
                ip_prefix: prefix,
                timestamp: std::time::Instant::now(),
            });
            bucket
                .keys()
                .map(|(_, p)| p.clone())
                .collect::<HashSet<_>>()
                .len()
        };

        if distinct_prefixes >= self.inner.config.min_witnesses {
            self.on_direct_address_verified(
                dialed_addr,
                "witness-threshold",
                AddressPriority::VerifiedDirect,
            );
        }
    }

    /// Once sockets bind, constrain verified entries to those ports
    /// (historical-port pruning, §4.1.6, I4).
    pub fn set_listen_ports(&self, ports: HashSet<u16>) {
        *self.inner.tables.listen_ports.write().unwrap() = ports.clone();
        if ports.is_empty() {
            return;
        }

        let to_remove: Vec<Address> = {
            let verified = self.inner.tables.verified_addrs.read().unwrap();
            verified
                .values()
                .filter(|e| {
                    port_component(&e.addr)
                        .map(|p| !ports.contains(&p))
                        .unwrap_or(false)
                })
                .map(|e| e.addr.clone())
                .collect()
        };

        if to_remove.is_empty() {
            return;
        }

        {
            let mut verified = self.inner.tables.verified_addrs.write().unwrap();
            for addr in &to_remove {
                verified.remove(addr);
            }
        }
        for addr in &to_remove {
            self.inner
                .store
                .read()
                .unwrap()
                .as_ref()
                .map(|s| s.remove_verified(&addr.to_string()));
        }
        self.notify_address_changed();
    }

    /// Operator-declared addresses, inserted as verified with
    /// `ConfiguredAdvertise`.
    pub fn set_configured_addresses(&self, addrs: Vec<Address>) {
        for addr in addrs {
            if is_empty_address(&addr.to_string()) {
                continue;
            }
            self.on_direct_address_verified(addr, "configured", AddressPriority::ConfiguredAdvertise);
        }
    }

    pub fn set_configured_helpers(&self, helpers: Vec<PeerId>) {
        *self.inner.tables.configured_helpers.write().unwrap() = helpers;
    }

    pub fn configured_helpers(&self) -> Vec<PeerId> {
        self.inner.tables.configured_helpers.read().unwrap().clone()
    }

    // ---- periodic loops (§4.1.5, §4.1.6, §4.3.6) -----------------------------

    /// One iteration of periodic re-verification (§4.1.5): `still_reachable`
    /// and `no_longer_reachable` are the output of a completed helper-pool
    /// verification pass against the current verified snapshot.
    pub fn apply_reverification_result(
        &self,
        still_reachable: &[Address],
        no_longer_reachable: &[Address],
    ) {
        let mut changed = false;
        {
            let mut verified = self.inner.tables.verified_addrs.write().unwrap();
            for addr in still_reachable {
                if let Some(entry) = verified.get_mut(addr) {
                    entry.touch();
                    changed = true;
                }
            }
            for addr in no_longer_reachable {
                if verified.remove(addr).is_some() {
                    changed = true;
                }
            }
        }
        for addr in no_longer_reachable {
            self.inner
                .store
                .read()
                .unwrap()
                .as_ref()
                .map(|s| s.remove_verified(&addr.to_string()));
        }
        if changed {
            self.notify_address_changed();
        }
    }

    /// Ages out stale witness ledger entries (§4.3.6).
    pub fn age_witness_ledger(&self, ttl: std::time::Duration) {
        let mut ledger = self.inner.tables.witness_ledger.write().unwrap();
        ledger.retain(|_dialed_addr, bucket| {
            bucket.retain(|_key, record| record.timestamp.elapsed() < ttl);
            !bucket.is_empty()
        });
    }

    fn notify_address_changed(&self) {
        let addrs = self.advertised_addrs();
        if let Some(cb) = self.inner.on_address_changed.read().unwrap().clone() {
            async_std::task::spawn(async move {
                cb(addrs);
            });
        }
    }

    fn insert_candidate_entry(&self, addr: Address, entry: AddressEntry) {
        self.inner.tables.candidate_addrs.write().unwrap().insert(addr, entry);
    }

    fn insert_verified_entry(&self, addr: Address, entry: AddressEntry) {
        self.inner.tables.verified_addrs.write().unwrap().insert(addr, entry);
    }

    fn index_source(&self, source: &str, addr: &Address) {
        self.inner
            .tables
            .source_index
            .write()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .insert(addr.clone());
    }

    fn remove_from_source_index(&self, addr: &Address) {
        let mut index = self.inner.tables.source_index.write().unwrap();
        for set in index.values_mut() {
            set.remove(addr);
        }
    }

    fn persist_candidate(&self, addr: &Address) {
        let entry = match self.inner.tables.candidate_addrs.read().unwrap().get(addr).cloned() {
            Some(e) => e,
            None => return,
        };
        if let Some(store) = self.inner.store.read().unwrap().as_ref() {
            store.put_candidate(&addr.to_string(), entry_to_stored(&entry));
        }
    }

    fn persist_verified(&self, addr: &Address, _source: &str, _priority: AddressPriority) {
        let entry = match self.inner.tables.verified_addrs.read().unwrap().get(addr).cloned() {
            Some(e) => e,
            None => return,
        };
        if let Some(store) = self.inner.store.read().unwrap().as_ref() {
            store.put_verified(&addr.to_string(), entry_to_stored(&entry));
        }
    }
}

/// Verified-entry filtering (§4.1.3).
fn filter_verified_entries(
    mut entries: Vec<AddressEntry>,
    listen_ports: &HashSet<u16>,
    max_verified_direct_addrs: usize,
) -> Vec<AddressEntry> {
    entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.last_seen.cmp(&a.last_seen)));
    entries.retain(|e| e.priority.is_verified_tier());

    if listen_ports.is_empty() {
        entries.truncate(max_verified_direct_addrs);
        return entries;
    }

    entries.retain(|e| {
        port_component(&e.addr)
            .map(|p| listen_ports.contains(&p))
            .unwrap_or(false)
    });

    let mut seen_ips = HashSet::new();
    entries.retain(|e| match ip_component(&e.addr) {
        Some(ip) => seen_ips.insert(ip),
        None => true,
    });

    entries.truncate(max_verified_direct_addrs);
    entries
}

fn entry_to_stored(entry: &AddressEntry) -> StoredEntry {
    StoredEntry {
        addr: entry.addr.to_string(),
        priority: entry.priority,
        source: entry.source.clone(),
        sources: vec![entry.source.clone()],
        verified: entry.verified,
        verified_at: entry.verified_at.map(|_| crate::store::unix_now()),
        last_seen: crate::store::unix_now(),
    }
}

fn stored_to_entry(stored: StoredEntry) -> AddressEntry {
    AddressEntry {
        addr: stored.addr.parse().unwrap_or_else(|_| "/ip4/0.0.0.0/udp/0".parse().unwrap()),
        priority: stored.priority,
        source: stored.source,
        verified: stored.verified,
        verified_at: None,
        last_seen: crate::address::LastSeen::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn scenario_relay_only_node() {
        let c = coordinator();
        let fired = Arc::new(std::sync::Mutex::new(0));
        let fired2 = fired.clone();
        c.set_on_address_changed(move |_addrs| {
            *fired2.lock().unwrap() += 1;
        });

        c.on_relay_reserved(vec!["/ip4/10.0.0.1/tcp/4001/p2p-circuit".parse().unwrap()]);

        assert_eq!(
            c.advertised_addrs(),
            vec!["/ip4/10.0.0.1/tcp/4001/p2p-circuit".parse().unwrap()]
        );
        assert!(!c.has_verified_direct());
        assert!(c.has_relay());
    }

    #[test]
    fn scenario_candidate_then_verify() {
        let c = coordinator();
        let addr: Address = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();

        c.on_direct_address_candidate(addr.clone(), "stun", AddressPriority::Unverified);
        assert!(!c.advertised_addrs().contains(&addr));

        c.on_direct_address_verified(addr.clone(), "dial-back", AddressPriority::VerifiedDirect);
        assert!(c.advertised_addrs().contains(&addr));
        assert!(!c.candidate_direct_addresses().contains(&addr));
    }

    #[test]
    fn scenario_listen_port_prune() {
        let c = coordinator();
        let keep: Address = "/ip4/5.6.7.8/udp/9001/quic-v1".parse().unwrap();
        let drop_addr: Address = "/ip4/5.6.7.8/udp/9000/quic-v1".parse().unwrap();

        c.on_direct_address_verified(drop_addr.clone(), "stun", AddressPriority::VerifiedDirect);
        c.on_direct_address_verified(keep.clone(), "stun", AddressPriority::VerifiedDirect);

        let mut ports = HashSet::new();
        ports.insert(9001u16);
        c.set_listen_ports(ports);

        assert_eq!(c.advertised_addrs(), vec![keep]);
    }

    #[test]
    fn scenario_witness_threshold() {
        let mut config = CoordinatorConfig::default();
        config.min_witnesses = 2;
        let c = Coordinator::new(config);
        let addr: Address = "/ip4/11.22.33.44/udp/4001/quic-v1".parse().unwrap();

        c.on_direct_address_candidate(addr.clone(), "stun", AddressPriority::Unverified);

        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let peer_c = PeerId::random();

        c.on_inbound_witness(addr.clone(), peer_a, "192.168.1.10".parse().unwrap());
        c.on_inbound_witness(addr.clone(), peer_b, "192.168.1.11".parse().unwrap());
        assert!(!c.advertised_addrs().contains(&addr));

        c.on_inbound_witness(addr.clone(), peer_c, "10.0.0.5".parse().unwrap());
        assert!(c.advertised_addrs().contains(&addr));
    }

    #[test]
    fn empty_address_ingress_is_rejected() {
        let c = coordinator();
        // An empty Multiaddr parses to a valid, zero-length address, which
        // is distinct from the empty string; the is_empty_address() guard
        // operates on the raw string form used at every ingress boundary.
        assert!(is_empty_address(""));
        let before = c.advertised_addrs();
        c.on_direct_address_expired("/ip4/1.2.3.4/udp/1/quic-v1".parse().unwrap());
        assert_eq!(c.advertised_addrs(), before);
    }

    #[test]
    fn disjointness_holds_after_verification() {
        let c = coordinator();
        let addr: Address = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();
        c.on_direct_address_candidate(addr.clone(), "stun", AddressPriority::Unverified);
        c.on_direct_address_verified(addr.clone(), "dial-back", AddressPriority::VerifiedDirect);

        assert!(c.inner.tables.verified_addrs.read().unwrap().contains_key(&addr));
        assert!(!c.inner.tables.candidate_addrs.read().unwrap().contains_key(&addr));
    }

    #[test]
    fn trigger_address_update_without_wiring_fires_change_notification() {
        async_std::task::block_on(async {
            let c = coordinator();
            let fired = Arc::new(std::sync::Mutex::new(0));
            let fired2 = fired.clone();
            c.set_on_address_changed(move |_addrs| {
                *fired2.lock().unwrap() += 1;
            });

            c.trigger_address_update();
            async_std::task::sleep(std::time::Duration::from_millis(20)).await;
            assert_eq!(*fired.lock().unwrap(), 1);
        });
    }

    #[test]
    fn trigger_address_update_runs_the_bound_state_machine() {
        async_std::task::block_on(async {
            let c = coordinator();
            let addr: Address = "/ip4/9.9.9.9/udp/4001/quic-v1".parse().unwrap();
            let discover_addr = addr.clone();
            c.set_discover_fn(move || {
                let addr = discover_addr.clone();
                Box::pin(async move { Ok(vec![addr]) })
                    as BoxFuture<'static, Result<Vec<Address>, CoordinatorError>>
            });
            c.set_validate_fn(|addrs| {
                Box::pin(async move { Ok(addrs) })
                    as BoxFuture<'static, Result<Vec<Address>, CoordinatorError>>
            });

            c.trigger_address_update();
            async_std::task::sleep(std::time::Duration::from_millis(50)).await;
            assert!(c.advertised_addrs().contains(&addr));
        });
    }

    #[test]
    fn on_outbound_connected_invokes_the_bound_witness_sender() {
        async_std::task::block_on(async {
            let c = coordinator();
            let invoked = Arc::new(std::sync::Mutex::new(None));
            let invoked2 = invoked.clone();
            c.set_witness_sender(move |peer, dialed| {
                let invoked = invoked2.clone();
                Box::pin(async move {
                    *invoked.lock().unwrap() = Some((peer, dialed));
                }) as BoxFuture<'static, ()>
            });

            let peer = PeerId::random();
            let dialed: Address = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();
            c.on_outbound_connected(peer, dialed.clone());
            async_std::task::sleep(std::time::Duration::from_millis(20)).await;

            let recorded = invoked.lock().unwrap().clone();
            assert_eq!(recorded, Some((peer, dialed)));
        });
    }

    #[test]
    fn on_outbound_connected_without_wiring_is_a_silent_no_op() {
        let c = coordinator();
        let peer = PeerId::random();
        c.on_outbound_connected(peer, "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap());
    }

    #[test]
    fn start_is_idempotent_and_stop_flips_running_off() {
        let c = coordinator();
        assert!(!c.is_running());
        c.start();
        assert!(c.is_running());
        c.start();
        assert!(c.is_running());
        c.stop();
        assert!(!c.is_running());
    }
}
