//! In-memory stand-ins for the control and streaming sessions, for tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use slotstream_core::Lsn;

use crate::control::{ControlSession, SlotRow};
use crate::error::{PgError, PgResult};
use crate::replication::{
    PrimaryKeepalive, ReplicationMessage, ReplicationTransport, StandbyStatus, StartReplication,
    XLogData,
};
use crate::version::WalPositionFunction;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a held slot reacts to its holder being terminated.
#[derive(Debug, Clone, Copy)]
enum Release {
    Immediate,
    AfterPolls(u32),
    Never,
}

#[derive(Debug, Clone)]
struct MockSlot {
    plugin: String,
    active: bool,
    terminated: bool,
    release: Release,
    confirmed: Lsn,
}

/// A fake control session holding slot state in memory.
#[derive(Clone)]
pub struct MockControl {
    state: Arc<Mutex<ControlState>>,
}

struct ControlState {
    slots: HashMap<String, MockSlot>,
    activations: HashMap<String, usize>,
    next_lsn: u64,
    wal_position: Option<String>,
    position_functions: Vec<WalPositionFunction>,
    fail_create: Option<String>,
    active_polls: usize,
    terminate_count: usize,
    drop_count: usize,
    create_count: usize,
}

impl Default for MockControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                slots: HashMap::new(),
                activations: HashMap::new(),
                next_lsn: 0x0100_0000,
                wal_position: Some("0/3000060".to_string()),
                position_functions: Vec::new(),
                fail_create: None,
                active_polls: 0,
                terminate_count: 0,
                drop_count: 0,
                create_count: 0,
            })),
        }
    }

    /// Pre-create a slot.
    pub fn add_slot(&self, name: &str, plugin: &str, active: bool) {
        let mut state = lock(&self.state);
        let confirmed = Lsn::new(state.next_lsn);
        state.next_lsn += 0x100;
        state.slots.insert(
            name.to_string(),
            MockSlot {
                plugin: plugin.to_string(),
                active,
                terminated: false,
                release: Release::Immediate,
                confirmed,
            },
        );
    }

    /// After termination, keep reporting the slot active for `polls` checks.
    pub fn release_after_polls(&self, name: &str, polls: u32) {
        self.set_release(name, Release::AfterPolls(polls));
    }

    /// Keep the slot active forever, even after termination.
    pub fn never_release(&self, name: &str) {
        self.set_release(name, Release::Never);
    }

    fn set_release(&self, name: &str, release: Release) {
        if let Some(slot) = lock(&self.state).slots.get_mut(name) {
            slot.release = release;
        }
    }

    /// Simulate a streaming session taking hold of the slot.
    pub fn attach(&self, name: &str) {
        let state = &mut *lock(&self.state);
        if let Some(slot) = state.slots.get_mut(name) {
            if !slot.active {
                slot.active = true;
                slot.terminated = false;
                *state.activations.entry(name.to_string()).or_default() += 1;
            }
        }
    }

    /// Make slot creation fail with the given server message.
    pub fn fail_create(&self, message: impl Into<String>) {
        lock(&self.state).fail_create = Some(message.into());
    }

    /// Set what the WAL position function returns.
    pub fn set_wal_position(&self, position: Option<&str>) {
        lock(&self.state).wal_position = position.map(str::to_string);
    }

    pub fn slot_exists(&self, name: &str) -> bool {
        lock(&self.state).slots.contains_key(name)
    }

    pub fn slot_plugin(&self, name: &str) -> Option<String> {
        lock(&self.state).slots.get(name).map(|s| s.plugin.clone())
    }

    pub fn confirmed_position(&self, name: &str) -> Option<Lsn> {
        lock(&self.state).slots.get(name).map(|s| s.confirmed)
    }

    /// How many times the slot went from inactive to active.
    pub fn activations(&self, name: &str) -> usize {
        lock(&self.state).activations.get(name).copied().unwrap_or(0)
    }

    /// Position functions queried, in order.
    pub fn position_functions(&self) -> Vec<WalPositionFunction> {
        lock(&self.state).position_functions.clone()
    }

    pub fn active_polls(&self) -> usize {
        lock(&self.state).active_polls
    }

    pub fn terminate_count(&self) -> usize {
        lock(&self.state).terminate_count
    }

    pub fn drop_count(&self) -> usize {
        lock(&self.state).drop_count
    }

    pub fn create_count(&self) -> usize {
        lock(&self.state).create_count
    }
}

impl ControlSession for MockControl {
    fn slot_active(&self, slot: &str) -> impl Future<Output = PgResult<bool>> + Send {
        let state = self.state.clone();
        let slot = slot.to_string();
        async move {
            let mut state = lock(&state);
            state.active_polls += 1;

            let Some(entry) = state.slots.get_mut(&slot) else {
                return Ok(false);
            };

            if entry.active && entry.terminated {
                match entry.release {
                    Release::Immediate => entry.active = false,
                    Release::AfterPolls(0) => entry.active = false,
                    Release::AfterPolls(n) => entry.release = Release::AfterPolls(n - 1),
                    Release::Never => {}
                }
            }

            Ok(entry.active)
        }
    }

    fn slot_row(
        &self,
        slot: &str,
        with_confirmed_flush: bool,
    ) -> impl Future<Output = PgResult<Option<SlotRow>>> + Send {
        let state = self.state.clone();
        let slot = slot.to_string();
        async move {
            let state = lock(&state);
            Ok(state.slots.get(&slot).map(|s| SlotRow {
                name: slot.clone(),
                plugin: Some(s.plugin.clone()),
                active: s.active,
                confirmed_flush_lsn: with_confirmed_flush.then(|| s.confirmed.to_string()),
            }))
        }
    }

    fn terminate_slot_holder(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send {
        let state = self.state.clone();
        let slot = slot.to_string();
        async move {
            let mut state = lock(&state);
            let signalled = match state.slots.get_mut(&slot) {
                Some(entry) if entry.active && !entry.terminated => {
                    entry.terminated = true;
                    1
                }
                _ => 0,
            };
            state.terminate_count += signalled;
            Ok(signalled as u64)
        }
    }

    fn drop_slot_if_exists(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send {
        let state = self.state.clone();
        let slot = slot.to_string();
        async move {
            let mut state = lock(&state);
            let active = match state.slots.get(&slot) {
                Some(entry) => entry.active,
                None => return Ok(0),
            };

            if active {
                return Err(PgError::Postgres(format!(
                    "ERROR: replication slot \"{}\" is active (code: 55006)",
                    slot
                )));
            }

            state.slots.remove(&slot);
            state.activations.remove(&slot);
            state.drop_count += 1;
            Ok(1)
        }
    }

    fn create_logical_slot(
        &self,
        slot: &str,
        plugin: &str,
    ) -> impl Future<Output = PgResult<(String, String)>> + Send {
        let state = self.state.clone();
        let slot = slot.to_string();
        let plugin = plugin.to_string();
        async move {
            let mut state = lock(&state);

            if let Some(ref message) = state.fail_create {
                return Err(PgError::SlotCreationFailed(message.clone()));
            }
            if state.slots.contains_key(&slot) {
                return Err(PgError::SlotCreationFailed(format!(
                    "replication slot \"{}\" already exists",
                    slot
                )));
            }

            let consistent_point = Lsn::new(state.next_lsn);
            state.next_lsn += 0x100;
            state.create_count += 1;
            state.slots.insert(
                slot.clone(),
                MockSlot {
                    plugin,
                    active: false,
                    terminated: false,
                    release: Release::Immediate,
                    confirmed: consistent_point,
                },
            );

            Ok((slot, consistent_point.to_string()))
        }
    }

    fn current_wal_position(
        &self,
        function: WalPositionFunction,
    ) -> impl Future<Output = PgResult<Option<String>>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = lock(&state);
            state.position_functions.push(function);
            Ok(state.wal_position.clone())
        }
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Message(ReplicationMessage),
    Malformed(Bytes),
    /// Nothing available on this poll.
    Gap,
}

/// A scripted streaming session.
///
/// Plays back queued messages in order and records what the consumer sends.
/// Once the script runs out the stream ends, unless [`MockTransport::hold_open`]
/// was called, in which case it waits forever.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

#[derive(Default)]
struct TransportState {
    script: VecDeque<Scripted>,
    hold_open: bool,
    started: Option<StartReplication>,
    statuses: Vec<StandbyStatus>,
    fail_start: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the stream open once the script is exhausted.
    pub fn hold_open(self) -> Self {
        lock(&self.state).hold_open = true;
        self
    }

    /// Reject `START_REPLICATION` with the given server message.
    pub fn failing_start(self, message: impl Into<String>) -> Self {
        lock(&self.state).fail_start = Some(message.into());
        self
    }

    /// Queue a WAL data message.
    pub fn push_data(&self, wal_start: Lsn, data: &[u8]) -> &Self {
        let message = XLogData::new(wal_start, wal_start, 0, data);
        self.push(Scripted::Message(ReplicationMessage::XLogData(message)))
    }

    /// Queue a keepalive.
    pub fn push_keepalive(&self, wal_end: Lsn, reply_requested: bool) -> &Self {
        let keepalive = PrimaryKeepalive {
            wal_end,
            server_time: 0,
            reply_requested,
        };
        self.push(Scripted::Message(ReplicationMessage::PrimaryKeepalive(keepalive)))
    }

    /// Queue a frame that does not decode.
    pub fn push_malformed(&self, frame: &'static [u8]) -> &Self {
        self.push(Scripted::Malformed(Bytes::from_static(frame)))
    }

    /// Queue an empty poll.
    pub fn push_gap(&self) -> &Self {
        self.push(Scripted::Gap)
    }

    fn push(&self, item: Scripted) -> &Self {
        lock(&self.state).script.push_back(item);
        self
    }

    /// The start request the consumer sent, if any.
    pub fn started(&self) -> Option<StartReplication> {
        lock(&self.state).started.clone()
    }

    /// Every status update sent, in order.
    pub fn statuses(&self) -> Vec<StandbyStatus> {
        lock(&self.state).statuses.clone()
    }

    pub fn last_status(&self) -> Option<StandbyStatus> {
        lock(&self.state).statuses.last().copied()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.state).script.len()
    }
}

fn play(item: Scripted) -> PgResult<ReplicationMessage> {
    match item {
        Scripted::Message(message) => Ok(message),
        Scripted::Malformed(frame) => ReplicationMessage::decode(frame),
        Scripted::Gap => Err(PgError::Protocol("gap played as message".into())),
    }
}

impl ReplicationTransport for MockTransport {
    fn start_logical(
        &mut self,
        request: &StartReplication,
    ) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        let request = request.clone();
        async move {
            let mut state = lock(&state);
            if let Some(ref message) = state.fail_start {
                return Err(PgError::Server {
                    severity: "ERROR".into(),
                    code: "42704".into(),
                    message: message.clone(),
                });
            }
            state.started = Some(request);
            Ok(())
        }
    }

    fn recv(&mut self) -> impl Future<Output = PgResult<ReplicationMessage>> + Send {
        let state = self.state.clone();
        async move {
            let next = {
                let mut state = lock(&state);
                loop {
                    match state.script.pop_front() {
                        Some(Scripted::Gap) => continue,
                        Some(item) => break Some(item),
                        None if state.hold_open => break None,
                        None => return Err(PgError::StreamClosed),
                    }
                }
            };

            match next {
                Some(item) => play(item),
                None => std::future::pending().await,
            }
        }
    }

    fn try_recv(&mut self) -> PgResult<Option<ReplicationMessage>> {
        let mut state = lock(&self.state);
        match state.script.pop_front() {
            Some(Scripted::Gap) => Ok(None),
            Some(item) => play(item).map(Some),
            None if state.hold_open => Ok(None),
            None => Err(PgError::StreamClosed),
        }
    }

    fn send_status(&mut self, status: StandbyStatus) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        async move {
            lock(&state).statuses.push(status);
            Ok(())
        }
    }
}
