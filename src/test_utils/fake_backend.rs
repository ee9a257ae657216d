use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::Mutex;
use tonic::async_trait;

use crate::BackendCapabilities;
use crate::BackendExecutor;
use crate::FailureReason;
use crate::Outcome;
use crate::ProbeReport;
use crate::Result;

/// Scripted misbehavior for one backend call
#[derive(Debug, Clone)]
pub enum Fault {
    /// Definite failure, no side effect
    Fail(FailureReason),
    /// Reply lost before anything happened
    Unknown,
    /// The side effect lands but the reply is lost; models a crash
    /// between backend action and record commit
    UnknownAfterExecute,
}

#[derive(Debug, Default, Clone)]
struct FakeVolume {
    size: u64,
    mapped_nodes: BTreeSet<String>,
}

#[derive(Default)]
struct FakeState {
    volumes: HashMap<String, FakeVolume>,
    /// Highest fencing token observed per backend volume; smaller
    /// tokens are rejected as fenced
    highest_token: HashMap<String, u64>,
    /// Idempotency journal: token to the recorded success payload
    completed: HashMap<String, Option<String>>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    executed: Vec<&'static str>,
    next_id: u64,
}

/// In-memory stand-in for the SAN backend.
///
/// Deduplicates mutations by idempotency token, enforces fencing token
/// monotonicity on map commands, records which side effects actually
/// executed, and lets tests inject failures and lost replies per
/// operation.
pub struct FakeBackend {
    state: Mutex<FakeState>,
    capabilities: Mutex<BackendCapabilities>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            capabilities: Mutex::new(BackendCapabilities::default()),
        }
    }

    pub fn set_online_snapshot(
        &self,
        online_snapshot: bool,
    ) {
        self.capabilities.lock().online_snapshot = online_snapshot;
    }

    /// Queues a fault for the next call of `op`
    pub fn inject(
        &self,
        op: &'static str,
        fault: Fault,
    ) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// Plants a volume as backend ground truth
    pub fn seed_volume(
        &self,
        backend_id: &str,
        size: u64,
    ) {
        self.state.lock().volumes.insert(
            backend_id.to_string(),
            FakeVolume {
                size,
                mapped_nodes: BTreeSet::new(),
            },
        );
    }

    /// Records a token as already completed, as if a crashed process had
    /// issued it
    pub fn seed_completed(
        &self,
        token: &str,
        backend_id: Option<&str>,
    ) {
        self.state
            .lock()
            .completed
            .insert(token.to_string(), backend_id.map(|s| s.to_string()));
    }

    pub fn volume_exists(
        &self,
        backend_id: &str,
    ) -> bool {
        self.state.lock().volumes.contains_key(backend_id)
    }

    pub fn volume_size(
        &self,
        backend_id: &str,
    ) -> Option<u64> {
        self.state.lock().volumes.get(backend_id).map(|v| v.size)
    }

    pub fn mapped_nodes(
        &self,
        backend_id: &str,
    ) -> Vec<String> {
        self.state
            .lock()
            .volumes
            .get(backend_id)
            .map(|v| v.mapped_nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How many times `op` actually mutated backend state
    pub fn executed_count(
        &self,
        op: &'static str,
    ) -> usize {
        self.state
            .lock()
            .executed
            .iter()
            .filter(|o| **o == op)
            .count()
    }

    fn take_fault(
        state: &mut FakeState,
        op: &'static str,
    ) -> Option<Fault> {
        state.faults.get_mut(op).and_then(|queue| queue.pop_front())
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendExecutor for FakeBackend {
    async fn create_volume(
        &self,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<String>> {
        let mut state = self.state.lock();

        let execute = |state: &mut FakeState| {
            let backend_id = format!("lv-{}", state.next_id);
            state.next_id += 1;
            state.volumes.insert(
                backend_id.clone(),
                FakeVolume {
                    size,
                    mapped_nodes: BTreeSet::new(),
                },
            );
            state
                .completed
                .insert(idempotency_token.to_string(), Some(backend_id.clone()));
            state.executed.push("create");
            backend_id
        };

        match Self::take_fault(&mut state, "create") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                execute(&mut state);
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if let Some(Some(backend_id)) = state.completed.get(idempotency_token).cloned() {
            return Ok(Outcome::Success(backend_id));
        }

        let backend_id = execute(&mut state);
        Ok(Outcome::Success(backend_id))
    }

    async fn delete_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let mut state = self.state.lock();

        match Self::take_fault(&mut state, "delete") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                state.volumes.remove(backend_id);
                state.completed.insert(idempotency_token.to_string(), None);
                state.executed.push("delete");
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if state.completed.contains_key(idempotency_token) {
            return Ok(Outcome::Success(()));
        }
        if state.volumes.remove(backend_id).is_none() {
            return Ok(Outcome::Failure(FailureReason::NotFound));
        }
        state.completed.insert(idempotency_token.to_string(), None);
        state.executed.push("delete");
        Ok(Outcome::Success(()))
    }

    async fn map_volume(
        &self,
        backend_id: &str,
        node: &str,
        fencing_token: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let mut state = self.state.lock();

        match Self::take_fault(&mut state, "map") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                if let Some(volume) = state.volumes.get_mut(backend_id) {
                    volume.mapped_nodes.insert(node.to_string());
                }
                state.completed.insert(idempotency_token.to_string(), None);
                state.executed.push("map");
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if state.completed.contains_key(idempotency_token) {
            return Ok(Outcome::Success(()));
        }

        let highest = state
            .highest_token
            .get(backend_id)
            .copied()
            .unwrap_or_default();
        if fencing_token < highest {
            return Ok(Outcome::Failure(FailureReason::Fenced));
        }

        match state.volumes.get_mut(backend_id) {
            Some(volume) => {
                volume.mapped_nodes.insert(node.to_string());
            }
            None => return Ok(Outcome::Failure(FailureReason::NotFound)),
        }
        state
            .highest_token
            .insert(backend_id.to_string(), fencing_token);
        state.completed.insert(idempotency_token.to_string(), None);
        state.executed.push("map");
        Ok(Outcome::Success(()))
    }

    async fn unmap_volume(
        &self,
        backend_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let mut state = self.state.lock();

        match Self::take_fault(&mut state, "unmap") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                if let Some(volume) = state.volumes.get_mut(backend_id) {
                    volume.mapped_nodes.remove(node);
                }
                state.completed.insert(idempotency_token.to_string(), None);
                state.executed.push("unmap");
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if state.completed.contains_key(idempotency_token) {
            return Ok(Outcome::Success(()));
        }
        match state.volumes.get_mut(backend_id) {
            Some(volume) => {
                volume.mapped_nodes.remove(node);
            }
            None => return Ok(Outcome::Failure(FailureReason::NotFound)),
        }
        state.completed.insert(idempotency_token.to_string(), None);
        state.executed.push("unmap");
        Ok(Outcome::Success(()))
    }

    async fn resize_volume(
        &self,
        backend_id: &str,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let mut state = self.state.lock();

        match Self::take_fault(&mut state, "resize") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                if let Some(volume) = state.volumes.get_mut(backend_id) {
                    volume.size = size;
                }
                state.completed.insert(idempotency_token.to_string(), None);
                state.executed.push("resize");
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if state.completed.contains_key(idempotency_token) {
            return Ok(Outcome::Success(()));
        }
        match state.volumes.get_mut(backend_id) {
            Some(volume) => {
                volume.size = size;
            }
            None => return Ok(Outcome::Failure(FailureReason::NotFound)),
        }
        state.completed.insert(idempotency_token.to_string(), None);
        state.executed.push("resize");
        Ok(Outcome::Success(()))
    }

    async fn snapshot_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<String>> {
        let mut state = self.state.lock();

        match Self::take_fault(&mut state, "snapshot") {
            Some(Fault::Fail(reason)) => return Ok(Outcome::Failure(reason)),
            Some(Fault::Unknown) => return Ok(Outcome::Unknown),
            Some(Fault::UnknownAfterExecute) => {
                if let Some(source) = state.volumes.get(backend_id).cloned() {
                    let snapshot_id = format!("lv-{}", state.next_id);
                    state.next_id += 1;
                    state.volumes.insert(
                        snapshot_id.clone(),
                        FakeVolume {
                            size: source.size,
                            mapped_nodes: BTreeSet::new(),
                        },
                    );
                    state
                        .completed
                        .insert(idempotency_token.to_string(), Some(snapshot_id));
                    state.executed.push("snapshot");
                }
                return Ok(Outcome::Unknown);
            }
            None => {}
        }

        if let Some(Some(snapshot_id)) = state.completed.get(idempotency_token).cloned() {
            return Ok(Outcome::Success(snapshot_id));
        }

        let source = match state.volumes.get(backend_id).cloned() {
            Some(source) => source,
            None => return Ok(Outcome::Failure(FailureReason::NotFound)),
        };
        let snapshot_id = format!("lv-{}", state.next_id);
        state.next_id += 1;
        state.volumes.insert(
            snapshot_id.clone(),
            FakeVolume {
                size: source.size,
                mapped_nodes: BTreeSet::new(),
            },
        );
        state
            .completed
            .insert(idempotency_token.to_string(), Some(snapshot_id.clone()));
        state.executed.push("snapshot");
        Ok(Outcome::Success(snapshot_id))
    }

    async fn probe_volume(
        &self,
        backend_id: &str,
    ) -> Result<ProbeReport> {
        let state = self.state.lock();
        Ok(match state.volumes.get(backend_id) {
            Some(volume) => ProbeReport {
                exists: true,
                size: volume.size,
                mapped_nodes: volume.mapped_nodes.iter().cloned().collect(),
            },
            None => ProbeReport::absent(),
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        *self.capabilities.lock()
    }
}
