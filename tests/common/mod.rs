#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tsync::config::AgentConfig;
use tsync::digest::ChecksumDigest;
use tsync::error::{Result, SyncError};
use tsync::sync::AgentContext;
use tsync::transport::{Connected, Connector, Status, SyncService};

pub const CALLER: &str = "10.0.0.7";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CheckIdentity(String),
    StartStorageGroup(String),
    InitTransfer(String),
    SendChunk(Vec<u8>),
    CheckDigest(String),
    NotifyDeletedName(String),
    EndSession,
}

#[derive(Debug, Default)]
pub struct ReceiverState {
    pub calls: Vec<Call>,
    /// Content of every unit whose digest was confirmed, by name
    pub received: BTreeMap<String, Vec<u8>>,
    pub deleted: Vec<String>,
    pub connects: usize,

    current: Option<(String, Vec<u8>)>,

    pub reject_identity: bool,
    pub reject_groups: HashSet<String>,
    pub reject_init: HashSet<String>,
    pub refuse_deletions: HashSet<String>,
    /// Refuse the first chunk of a unit this many times
    pub reject_chunks: HashMap<String, u32>,
    /// Answer with a wrong digest this many times per unit
    pub corrupt_digests: HashMap<String, u32>,
    /// Break the connection when the call with this index is made
    pub fail_at_call: Option<usize>,
}

/// In-memory receiver. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MockReceiver {
    state: Arc<Mutex<ReceiverState>>,
}

impl MockReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ReceiverState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn inits_of(&self, name: &str) -> usize {
        self.count(|c| matches!(c, Call::InitTransfer(n) if n == name))
    }

    pub fn received(&self, name: &str) -> Option<Vec<u8>> {
        self.state().received.get(name).cloned()
    }

    fn record(&self, call: Call) -> Result<MutexGuard<'_, ReceiverState>> {
        let mut state = self.state();
        let index = state.calls.len();
        state.calls.push(call);
        if state.fail_at_call == Some(index) {
            return Err(SyncError::Connection("connection reset by peer".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl SyncService for MockReceiver {
    async fn check_identity(&mut self, caller_address: &str) -> Result<Status> {
        let state = self.record(Call::CheckIdentity(caller_address.to_string()))?;
        Ok(Status::from(!state.reject_identity))
    }

    async fn start_storage_group(&mut self, name: &str) -> Result<Status> {
        let state = self.record(Call::StartStorageGroup(name.to_string()))?;
        Ok(Status::from(!state.reject_groups.contains(name)))
    }

    async fn init_transfer(&mut self, name: &str) -> Result<Status> {
        let mut state = self.record(Call::InitTransfer(name.to_string()))?;
        if state.reject_init.contains(name) {
            state.current = None;
            return Ok(Status::Failure);
        }
        state.current = Some((name.to_string(), Vec::new()));
        Ok(Status::Success)
    }

    async fn send_chunk(&mut self, data: Bytes) -> Result<Status> {
        let mut state = self.record(Call::SendChunk(data.to_vec()))?;
        let state = &mut *state;
        match state.current.as_mut() {
            Some((name, buf)) => {
                if let Some(left) = state.reject_chunks.get_mut(name.as_str()) {
                    if *left > 0 && buf.is_empty() {
                        *left -= 1;
                        state.current = None;
                        return Ok(Status::Failure);
                    }
                }
                buf.extend_from_slice(&data);
                Ok(Status::Success)
            }
            None => Ok(Status::Failure),
        }
    }

    async fn check_digest(&mut self, local_digest: &str) -> Result<String> {
        let mut state = self.record(Call::CheckDigest(local_digest.to_string()))?;
        let Some((name, buf)) = state.current.clone() else {
            return Ok(String::new());
        };

        if let Some(left) = state.corrupt_digests.get_mut(&name) {
            if *left > 0 {
                *left -= 1;
                return Ok("0".repeat(64));
            }
        }

        let digest = ChecksumDigest::of(&buf);
        if digest == local_digest {
            state.received.insert(name, buf);
        }
        Ok(digest)
    }

    async fn notify_deleted_name(&mut self, name: &str) -> Result<Status> {
        let mut state = self.record(Call::NotifyDeletedName(name.to_string()))?;
        if state.refuse_deletions.contains(name) {
            return Ok(Status::Failure);
        }
        state.deleted.push(name.to_string());
        Ok(Status::Success)
    }

    async fn end_session(&mut self) -> Result<()> {
        self.record(Call::EndSession)?;
        Ok(())
    }
}

/// Hands out sessions on the shared mock receiver.
pub struct MockConnector {
    receiver: MockReceiver,
}

impl MockConnector {
    pub fn new(receiver: MockReceiver) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Connected> {
        self.receiver.state().connects += 1;
        Ok(Connected {
            service: Box::new(self.receiver.clone()),
            caller_address: CALLER.to_string(),
        })
    }
}

/// Connector whose receiver is never reachable.
pub struct UnreachableConnector;

#[async_trait]
impl Connector for UnreachableConnector {
    async fn connect(&self) -> Result<Connected> {
        Err(SyncError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        })
    }
}

/// Sender layout inside a temp dir: one data dir, a schema log and the
/// sender dir.
pub struct Fixture {
    pub root: tempfile::TempDir,
    pub config: AgentConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path();
        let config = AgentConfig {
            data_dirs: vec![base.join("data")],
            schema_log: base.join("schema").join("mlog.txt"),
            sender_dir: base.join("sender"),
            chunk_size: 4,
            schema_batch_lines: 1000,
            max_attempts: 3,
            ..AgentConfig::default()
        };
        std::fs::create_dir_all(&config.data_dirs[0]).unwrap();
        std::fs::create_dir_all(config.schema_log.parent().unwrap()).unwrap();
        Self { root, config }
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dirs[0]
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        let dir = self.data_dir().join(group);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a closed data file and return its path.
    pub fn write_file(&self, group: &str, name: &str, content: &[u8]) -> PathBuf {
        let path = self.group_dir(group).join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn state_dir(&self, group: &str) -> PathBuf {
        self.config.state_dir(self.data_dir()).join(group)
    }

    pub fn manifest(&self, group: &str) -> Vec<PathBuf> {
        let path = self.state_dir(group).join("last_local_files.txt");
        match std::fs::read_to_string(path) {
            Ok(content) => content
                .lines()
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(PathBuf::from)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn context(&self, receiver: &MockReceiver) -> Arc<AgentContext> {
        Arc::new(AgentContext::with_connector(
            self.config.clone(),
            Arc::new(MockConnector::new(receiver.clone())),
        ))
    }
}
