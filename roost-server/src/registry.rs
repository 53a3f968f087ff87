//! The in-memory host registry.
//!
//! Every child node known to this parent has one [`Host`] entry, looked up by
//! machine identity. A host owns a single receiver slot: the handle of the
//! streaming session currently feeding it, if any. Only the registry's attach
//! and detach operations touch that slot, so there is never more than one
//! receiver per host and neither side ever frees the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use roost_config::{HealthSetting, MemoryMode};

use crate::clock::now_monotonic_secs;
use crate::receiver::{StreamHandshake, SystemInfo};

bitflags! {
    /// Host state bits, updated concurrently by the acceptance flow and the
    /// data plane.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u32 {
        /// The host exists on disk but is not being collected.
        const ARCHIVED = 1 << 0;
        /// Metadata is still loading; streams cannot be accepted yet.
        const PENDING_CONTEXT_LOAD = 1 << 1;
        /// The host disappears when its child disconnects for good.
        const EPHEMERAL = 1 << 2;
    }
}

/// Failures creating registry entries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("host limit reached, not creating a host for {0}")]
    HostLimit(Uuid),
}

/// The shared handle of a running streaming session.
///
/// The session itself is owned by its worker thread. This handle is what the
/// host's receiver slot points to, and what a competing connection uses to
/// judge liveness and to preempt a stale session.
#[derive(Debug)]
pub struct ReceiverHandle {
    last_msg: AtomicI64,
    stop_reason: AtomicI32,
    exited: AtomicBool,
    exit_notify: Notify,
}

impl ReceiverHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_msg: AtomicI64::new(now_monotonic_secs()),
            stop_reason: AtomicI32::new(StreamHandshake::Never as i32),
            exited: AtomicBool::new(false),
            exit_notify: Notify::new(),
        })
    }

    /// Records traffic from the child.
    pub fn touch(&self) {
        self.last_msg.store(now_monotonic_secs(), Ordering::Relaxed);
    }

    /// Monotonic second of the last message from the child.
    pub fn last_msg_secs(&self) -> i64 {
        self.last_msg.load(Ordering::Relaxed)
    }

    /// Overrides the last-message time, used by the data plane and by tests.
    pub fn set_last_msg_secs(&self, secs: i64) {
        self.last_msg.store(secs, Ordering::Relaxed);
    }

    /// Moves the last-message time into the past.
    pub fn rewind_last_msg(&self, secs: i64) {
        self.last_msg.fetch_sub(secs, Ordering::Relaxed);
    }

    /// Asks the session to stop. The worker honors this on its next tick.
    pub fn request_stop(&self, reason: StreamHandshake) {
        self.stop_reason.store(reason as i32, Ordering::Release);
    }

    /// The pending stop request, if any.
    pub fn stop_requested(&self) -> Option<StreamHandshake> {
        match StreamHandshake::from_code(self.stop_reason.load(Ordering::Acquire)) {
            StreamHandshake::Never => None,
            reason => Some(reason),
        }
    }

    /// Marks the session as exited and wakes everyone waiting for it.
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
        self.exit_notify.notify_waiters();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Waits until the session exits, up to the given timeout.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.exit_notify.notified();
            if self.has_exited() {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.has_exited();
            }
        }
    }
}

/// Identity and collection settings of a host, set when it is created or
/// reconnects.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub hostname: String,
    pub registry_hostname: String,
    pub os: String,
    pub timezone: String,
    pub abbrev_timezone: String,
    pub utc_offset: i32,
    pub program_name: String,
    pub program_version: String,
    pub update_every: i64,
    pub history: usize,
    pub memory_mode: MemoryMode,
    pub health: HealthSetting,
}

/// One child node known to this parent.
#[derive(Debug)]
pub struct Host {
    machine_guid: Uuid,
    info: RwLock<HostInfo>,
    flags: AtomicU32,
    receiver: Mutex<Option<Arc<ReceiverHandle>>>,
    system_info: Mutex<Option<SystemInfo>>,
    /// Reconnection state of the forwarding link to the next parent.
    forward_state: AtomicI32,
}

impl Host {
    fn new(machine_guid: Uuid, info: HostInfo) -> Arc<Self> {
        Arc::new(Self {
            machine_guid,
            info: RwLock::new(info),
            flags: AtomicU32::new(HostFlags::empty().bits()),
            receiver: Mutex::new(None),
            system_info: Mutex::new(None),
            forward_state: AtomicI32::new(StreamHandshake::Never as i32),
        })
    }

    pub fn machine_guid(&self) -> Uuid {
        self.machine_guid
    }

    pub fn hostname(&self) -> String {
        self.info.read().hostname.clone()
    }

    pub fn info(&self) -> HostInfo {
        self.info.read().clone()
    }

    pub fn flag_check(&self, flag: HostFlags) -> bool {
        HostFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    pub fn flag_set(&self, flag: HostFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn flag_clear(&self, flag: HostFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// The handle of the currently attached receiver, if any.
    pub fn receiver_handle(&self) -> Option<Arc<ReceiverHandle>> {
        self.receiver.lock().clone()
    }

    /// Resets the forwarding link so it reconnects as soon as possible.
    pub fn stream_parents_reset(&self, state: StreamHandshake) {
        self.forward_state.store(state as i32, Ordering::Release);
    }

    pub fn forward_state(&self) -> StreamHandshake {
        StreamHandshake::from_code(self.forward_state.load(Ordering::Acquire))
    }

    /// The system information last reported by the child.
    pub fn system_info(&self) -> Option<SystemInfo> {
        self.system_info.lock().clone()
    }
}

/// Everything needed to create or refresh a host entry.
#[derive(Debug, Default)]
pub struct CreateHost {
    pub machine_guid: Uuid,
    pub info: HostInfo,
}

/// The process-wide directory of hosts.
#[derive(Debug)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<Uuid, Arc<Host>>>,
    localhost_guid: Uuid,
    hostname: String,
    is_parent: AtomicBool,
    accepting_children: AtomicBool,
    max_hosts: usize,
}

impl HostRegistry {
    /// Creates the registry for a node with the given identity.
    ///
    /// `max_hosts` bounds the number of entries; zero means unlimited.
    pub fn new(localhost_guid: Uuid, hostname: String, max_hosts: usize) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            localhost_guid,
            hostname,
            is_parent: AtomicBool::new(false),
            accepting_children: AtomicBool::new(true),
            max_hosts,
        }
    }

    /// The machine identity of this node itself.
    pub fn localhost_guid(&self) -> Uuid {
        self.localhost_guid
    }

    /// The hostname of this node itself.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().len()
    }

    /// Looks up a host by machine identity.
    pub fn find_by_guid(&self, machine_guid: &Uuid) -> Option<Arc<Host>> {
        self.hosts.read().get(machine_guid).cloned()
    }

    /// Finds or creates the host for a connecting child.
    ///
    /// On success the child's system information moves into the host entry
    /// and `system_info` is left empty. On failure it stays untouched, so the
    /// caller still owns it.
    pub fn find_or_create(
        &self,
        create: CreateHost,
        system_info: &mut Option<SystemInfo>,
    ) -> Result<Arc<Host>, RegistryError> {
        let mut hosts = self.hosts.write();

        let host = match hosts.get(&create.machine_guid) {
            Some(host) => {
                // A reconnecting child refreshes the identity it reports.
                *host.info.write() = create.info;
                host.flag_clear(HostFlags::ARCHIVED);
                host.clone()
            }
            None => {
                if self.max_hosts > 0 && hosts.len() >= self.max_hosts {
                    return Err(RegistryError::HostLimit(create.machine_guid));
                }

                let host = Host::new(create.machine_guid, create.info);
                hosts.insert(create.machine_guid, host.clone());
                host
            }
        };

        *host.system_info.lock() = system_info.take();
        Ok(host)
    }

    /// Attaches a receiver to the host's receiver slot.
    ///
    /// Fails when another receiver is already attached; the slot is the
    /// arbiter between racing connections for the same host.
    pub fn set_receiver(&self, host: &Host, handle: Arc<ReceiverHandle>) -> bool {
        let mut slot = host.receiver.lock();
        if slot.is_some() {
            return false;
        }

        *slot = Some(handle);
        true
    }

    /// Detaches the given receiver from the host, if it is still the one
    /// attached.
    pub fn clear_receiver(&self, host: &Host, handle: &Arc<ReceiverHandle>) -> bool {
        let mut slot = host.receiver.lock();
        match &*slot {
            Some(current) if Arc::ptr_eq(current, handle) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Signals the host's attached receiver to stop and waits for it to exit.
    ///
    /// Returns `true` when the receiver is gone, including when none was
    /// attached in the first place.
    pub async fn signal_to_stop_and_wait(
        &self,
        host: &Host,
        reason: StreamHandshake,
        timeout: Duration,
    ) -> bool {
        let Some(handle) = host.receiver_handle() else {
            return true;
        };

        handle.request_stop(reason);
        handle.wait_exit(timeout).await
    }

    /// Whether new children may currently be accepted.
    ///
    /// The data plane clears this while it backfills higher storage tiers.
    pub fn children_should_be_accepted(&self) -> bool {
        self.accepting_children.load(Ordering::Acquire)
    }

    pub fn set_accepting_children(&self, accepting: bool) {
        self.accepting_children.store(accepting, Ordering::Release);
    }

    /// Marks this node as a parent once the first child is accepted.
    pub fn set_is_parent_label(&self) {
        self.is_parent.store(true, Ordering::Release);
    }

    pub fn is_parent(&self) -> bool {
        self.is_parent.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HostRegistry {
        HostRegistry::new(Uuid::new_v4(), "parent".to_owned(), 0)
    }

    fn create(guid: Uuid) -> CreateHost {
        CreateHost {
            machine_guid: guid,
            info: HostInfo {
                hostname: "child".to_owned(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn find_or_create_consumes_system_info() {
        let registry = registry();
        let guid = Uuid::new_v4();

        let mut system_info = Some(SystemInfo::default());
        let host = registry
            .find_or_create(create(guid), &mut system_info)
            .unwrap();

        assert!(system_info.is_none());
        assert!(host.system_info().is_some());
        assert_eq!(registry.host_count(), 1);
    }

    #[test]
    fn host_limit_leaves_system_info_with_the_caller() {
        let registry = HostRegistry::new(Uuid::new_v4(), "parent".to_owned(), 1);

        let mut none = None;
        registry
            .find_or_create(create(Uuid::new_v4()), &mut none)
            .unwrap();

        let mut system_info = Some(SystemInfo::default());
        let err = registry
            .find_or_create(create(Uuid::new_v4()), &mut system_info)
            .unwrap_err();

        assert!(matches!(err, RegistryError::HostLimit(_)));
        assert!(system_info.is_some());
    }

    #[test]
    fn reconnect_refreshes_info_and_unarchives() {
        let registry = registry();
        let guid = Uuid::new_v4();

        let mut none = None;
        let host = registry.find_or_create(create(guid), &mut none).unwrap();
        host.flag_set(HostFlags::ARCHIVED);

        let mut refresh = create(guid);
        refresh.info.hostname = "renamed".to_owned();
        let again = registry.find_or_create(refresh, &mut none).unwrap();

        assert!(Arc::ptr_eq(&host, &again));
        assert_eq!(again.hostname(), "renamed");
        assert!(!again.flag_check(HostFlags::ARCHIVED));
        assert_eq!(registry.host_count(), 1);
    }

    #[test]
    fn at_most_one_receiver_per_host() {
        let registry = registry();
        let mut none = None;
        let host = registry
            .find_or_create(create(Uuid::new_v4()), &mut none)
            .unwrap();

        let first = ReceiverHandle::new();
        let second = ReceiverHandle::new();

        assert!(registry.set_receiver(&host, first.clone()));
        assert!(!registry.set_receiver(&host, second.clone()));

        // Only the attached handle may detach.
        assert!(!registry.clear_receiver(&host, &second));
        assert!(registry.clear_receiver(&host, &first));
        assert!(registry.set_receiver(&host, second));
    }

    #[tokio::test]
    async fn stop_and_wait_succeeds_when_the_receiver_exits() {
        let registry = registry();
        let mut none = None;
        let host = registry
            .find_or_create(create(Uuid::new_v4()), &mut none)
            .unwrap();

        let handle = ReceiverHandle::new();
        assert!(registry.set_receiver(&host, handle.clone()));

        let worker = handle.clone();
        let registry = Arc::new(registry);
        let host_for_worker = host.clone();
        let registry_for_worker = registry.clone();
        tokio::spawn(async move {
            loop {
                if worker.stop_requested().is_some() {
                    registry_for_worker.clear_receiver(&host_for_worker, &worker);
                    worker.mark_exited();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let stopped = registry
            .signal_to_stop_and_wait(
                &host,
                StreamHandshake::DisconnectStaleReceiver,
                Duration::from_secs(2),
            )
            .await;

        assert!(stopped);
        assert!(host.receiver_handle().is_none());
        assert_eq!(
            handle.stop_requested(),
            Some(StreamHandshake::DisconnectStaleReceiver)
        );
    }

    #[tokio::test]
    async fn stop_and_wait_times_out_on_a_wedged_receiver() {
        let registry = registry();
        let mut none = None;
        let host = registry
            .find_or_create(create(Uuid::new_v4()), &mut none)
            .unwrap();

        let handle = ReceiverHandle::new();
        assert!(registry.set_receiver(&host, handle));

        let stopped = registry
            .signal_to_stop_and_wait(
                &host,
                StreamHandshake::DisconnectStaleReceiver,
                Duration::from_millis(50),
            )
            .await;

        assert!(!stopped);
        assert!(host.receiver_handle().is_some());
    }
}
