//! Durable store for the consensus core.
//!
//! The bridge and node binary depend only on the [`DurableStore`] operations.
//! [`MemoryStore`] keeps everything in process; [`FileStore`] appends each
//! mutation to a JSON-lines write-ahead log and replays it on open.

use crate::directory::NodeRecord;
use crate::election::{ElectionCore, JournalRecord, PersistentState};
use crate::error::{Error, Result};
use crate::event::{VoteRequest, VoteResponse};
use crate::log::{LogEntry, ReplicatedLog};
use crate::types::{NodeId, Role};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WAL_FILE: &str = "wal.jsonl";

/// Vote request and the responses collected for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub term: u64,
    pub request: VoteRequest,
    pub responses: Vec<VoteResponse>,
}

impl VoteRecord {
    pub fn granted(&self) -> usize {
        self.responses.iter().filter(|r| r.granted).count()
    }
}

/// Aggregate over everything the store holds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub leaders: usize,
    pub current_term: u64,
    pub log_entries: usize,
    pub commit_index: u64,
    pub vote_requests: usize,
    pub votes_granted: usize,
}

/// Operations the consensus core needs from persistent storage
pub trait DurableStore: Send + Sync {
    /// Insert or replace a node
    fn upsert_node(&self, record: &NodeRecord) -> Result<()>;
    fn node(&self, id: &str) -> Result<Option<NodeRecord>>;
    fn nodes(&self) -> Result<Vec<NodeRecord>>;

    fn store_vote_request(&self, term: u64, request: &VoteRequest) -> Result<()>;
    /// Fails with InvalidVote when no request matches the response
    fn store_vote_response(&self, response: &VoteResponse) -> Result<()>;
    fn votes(&self, term: u64) -> Result<Vec<VoteRecord>>;

    /// Append, replacing any entries at or after `entry.index`
    fn append_log(&self, entry: &LogEntry) -> Result<()>;
    fn log_entries(&self, from: u64) -> Result<Vec<LogEntry>>;
    /// Advance the commit index; never moves backwards
    fn commit(&self, index: u64) -> Result<u64>;

    fn start_term(&self, state: &PersistentState) -> Result<()>;
    fn term(&self) -> Result<PersistentState>;

    fn cluster_stats(&self) -> Result<ClusterStats>;
}

/// One WAL line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WalRecord {
    #[serde(rename = "NODE")]
    Node(NodeRecord),
    #[serde(rename = "VOTE_REQUEST")]
    VoteRequest { term: u64, request: VoteRequest },
    #[serde(rename = "VOTE_RESPONSE")]
    VoteResponse(VoteResponse),
    #[serde(rename = "LOG")]
    Log(LogEntry),
    #[serde(rename = "COMMIT")]
    Commit { index: u64 },
    #[serde(rename = "TERM")]
    Term(PersistentState),
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    /// Keyed by (term, candidate)
    votes: BTreeMap<(u64, NodeId), VoteRecord>,
    log: Vec<LogEntry>,
    commit_index: u64,
    election: PersistentState,
}

impl StoreState {
    /// Check a record against current state without applying it
    fn validate(&self, record: &WalRecord) -> Result<()> {
        if let WalRecord::VoteResponse(response) = record {
            let key = (response.term, response.candidate_id.clone());
            if !self.votes.contains_key(&key) {
                return Err(Error::InvalidVote(format!(
                    "no vote request from {} in term {}",
                    response.candidate_id, response.term
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::Node(node) => {
                self.nodes.insert(node.id.clone(), node);
            }
            WalRecord::VoteRequest { term, request } => {
                self.votes
                    .entry((term, request.candidate_id.clone()))
                    .or_insert_with(|| VoteRecord {
                        term,
                        request,
                        responses: Vec::new(),
                    });
            }
            WalRecord::VoteResponse(response) => {
                let key = (response.term, response.candidate_id.clone());
                if let Some(vote) = self.votes.get_mut(&key) {
                    vote.responses.retain(|r| r.voter_id != response.voter_id);
                    vote.responses.push(response);
                }
            }
            WalRecord::Log(entry) => {
                self.log.retain(|e| e.index < entry.index);
                self.log.push(entry);
            }
            WalRecord::Commit { index } => {
                let last = self.log.last().map(|e| e.index).unwrap_or(0);
                self.commit_index = self.commit_index.max(index.min(last));
            }
            WalRecord::Term(state) => {
                if state.current_term >= self.election.current_term {
                    self.election = state;
                }
            }
        }
    }

    fn stats(&self) -> ClusterStats {
        ClusterStats {
            total_nodes: self.nodes.len(),
            leaders: self.nodes.values().filter(|n| n.role == Role::Leader).count(),
            current_term: self.election.current_term,
            log_entries: self.log.len(),
            commit_index: self.commit_index,
            vote_requests: self.votes.len(),
            votes_granted: self.votes.values().map(VoteRecord::granted).sum(),
        }
    }
}

/// DurableStore over `read` and `write`, shared by both stores
macro_rules! store_ops {
    () => {
        fn node(&self, id: &str) -> Result<Option<NodeRecord>> {
            Ok(self.read(|s| s.nodes.get(id).cloned()))
        }

        fn nodes(&self) -> Result<Vec<NodeRecord>> {
            Ok(self.read(|s| s.nodes.values().cloned().collect()))
        }

        fn votes(&self, term: u64) -> Result<Vec<VoteRecord>> {
            Ok(self.read(|s| {
                s.votes
                    .values()
                    .filter(|v| v.term == term)
                    .cloned()
                    .collect()
            }))
        }

        fn log_entries(&self, from: u64) -> Result<Vec<LogEntry>> {
            Ok(self.read(|s| s.log.iter().filter(|e| e.index >= from).cloned().collect()))
        }

        fn term(&self) -> Result<PersistentState> {
            Ok(self.read(|s| s.election.clone()))
        }

        fn cluster_stats(&self) -> Result<ClusterStats> {
            Ok(self.read(StoreState::stats))
        }

        fn upsert_node(&self, record: &NodeRecord) -> Result<()> {
            self.write(WalRecord::Node(record.clone()))
        }

        fn store_vote_request(&self, term: u64, request: &VoteRequest) -> Result<()> {
            self.write(WalRecord::VoteRequest {
                term,
                request: request.clone(),
            })
        }

        fn store_vote_response(&self, response: &VoteResponse) -> Result<()> {
            self.write(WalRecord::VoteResponse(response.clone()))
        }

        fn append_log(&self, entry: &LogEntry) -> Result<()> {
            self.write(WalRecord::Log(entry.clone()))
        }

        fn commit(&self, index: u64) -> Result<u64> {
            self.write(WalRecord::Commit { index })?;
            Ok(self.read(|s| s.commit_index))
        }

        fn start_term(&self, state: &PersistentState) -> Result<()> {
            self.write(WalRecord::Term(state.clone()))
        }
    };
}

/// In-memory store for tests and simulations
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.lock())
    }

    fn write(&self, record: WalRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.validate(&record)?;
        state.apply(record);
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    store_ops!();
}

/// File store configuration
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub dir: PathBuf,
    /// Flush after every record
    pub fsync_on_write: bool,
}

impl FileStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fsync_on_write: true,
        }
    }
}

struct FileInner {
    state: StoreState,
    wal: BufWriter<File>,
    records: u64,
}

/// Write-ahead-log backed store
pub struct FileStore {
    path: PathBuf,
    fsync_on_write: bool,
    inner: Mutex<FileInner>,
}

impl FileStore {
    /// Open (creating if needed) and replay the WAL
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(WAL_FILE);
        let (state, records) = replay(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Store: Opened WAL at {:?}", path);

        Ok(Self {
            path,
            fsync_on_write: config.fsync_on_write,
            inner: Mutex::new(FileInner {
                state,
                wal: BufWriter::new(file),
                records,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in the WAL, replayed plus written
    pub fn record_count(&self) -> u64 {
        self.inner.lock().records
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().wal.flush()?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.inner.lock().state)
    }

    fn write(&self, record: WalRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.validate(&record)?;

        let line = serde_json::to_string(&record)?;
        writeln!(inner.wal, "{}", line).map_err(|e| Error::Storage(e.to_string()))?;
        if self.fsync_on_write {
            inner.wal.flush()?;
        }
        inner.records += 1;
        inner.state.apply(record);
        Ok(())
    }
}

impl DurableStore for FileStore {
    store_ops!();
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().wal.flush() {
            warn!("Store: Failed to flush WAL on close: {}", e);
        }
    }
}

fn replay(path: &Path) -> Result<(StoreState, u64)> {
    let mut state = StoreState::default();
    if !path.exists() {
        return Ok((state, 0));
    }

    let reader = BufReader::new(File::open(path)?);
    let mut applied = 0;
    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("Store: WAL read error at line {}: {}", line_num + 1, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalRecord>(&line) {
            Ok(record) => {
                state.apply(record);
                applied += 1;
            }
            Err(e) => warn!("Store: WAL parse error at line {}: {}", line_num + 1, e),
        }
    }

    info!(
        "Store: Replayed {} records ({} log entries, term {})",
        applied,
        state.log.len(),
        state.election.current_term
    );
    Ok((state, applied))
}

/// Store handle shared by the bridge and node runtime
pub type SharedStore = std::sync::Arc<dyn DurableStore>;

/// Load term, vote and log from `store` into a core that has not started
pub fn recover(core: &mut ElectionCore, store: &dyn DurableStore) -> Result<()> {
    core.load_persistent_state(store.term()?);
    let commit_index = store.cluster_stats()?.commit_index;
    core.restore_log(ReplicatedLog::restore(store.log_entries(1)?, commit_index));
    info!(
        "Store: Recovered term {} with {} log entries (commit {})",
        core.term(),
        core.log().last_index(),
        core.log().commit_index()
    );
    Ok(())
}

fn write_record(store: &dyn DurableStore, record: &JournalRecord) -> Result<()> {
    match record {
        JournalRecord::Term(state) => store.start_term(state),
        JournalRecord::Entries(entries) => entries.iter().try_for_each(|e| store.append_log(e)),
        JournalRecord::Commit(index) => store.commit(*index).map(|_| ()),
    }
}

/// Write a node's journal to `store` until the node stops
pub fn spawn_journal_writer(
    store: SharedStore,
    mut records: mpsc::UnboundedReceiver<JournalRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut written = 0usize;
        while let Some(record) = records.recv().await {
            match write_record(store.as_ref(), &record) {
                Ok(()) => written += 1,
                Err(e) => warn!("Store: Failed to write {:?}: {}", record, e),
            }
        }
        debug!("Store: Journal closed after {} records", written);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::event::EventType;
    use crate::node::ElectionNode;
    use crate::transport::MemoryNetwork;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn request(candidate: &str) -> VoteRequest {
        VoteRequest {
            candidate_id: candidate.to_string(),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn response(voter: &str, candidate: &str, term: u64, granted: bool) -> VoteResponse {
        VoteResponse {
            vote_id: format!("{}-{}-{}", voter, term, candidate),
            term,
            candidate_id: candidate.to_string(),
            voter_id: voter.to_string(),
            granted,
        }
    }

    fn exercise(store: &dyn DurableStore) -> Result<()> {
        store.upsert_node(&NodeRecord::new("a"))?;
        store.upsert_node(&NodeRecord::new("b").with_weight(2.0))?;
        store.start_term(&PersistentState {
            current_term: 2,
            voted_for: Some("a".to_string()),
        })?;
        store.store_vote_request(2, &request("a"))?;
        store.store_vote_response(&response("b", "a", 2, true))?;
        store.store_vote_response(&response("c", "a", 2, false))?;
        store.append_log(&LogEntry::new_noop(1, 2))?;
        store.append_log(&LogEntry::new_data(2, 2, "k".into(), json!(1)))?;
        store.commit(2)?;
        Ok(())
    }

    #[test]
    fn test_memory_store_operations() {
        let store = MemoryStore::new();
        exercise(&store).unwrap();

        assert_eq!(store.node("b").unwrap().unwrap().weight, 2.0);
        assert_eq!(store.term().unwrap().current_term, 2);
        let votes = store.votes(2).unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].granted(), 1);
        assert_eq!(store.log_entries(2).unwrap().len(), 1);

        let stats = store.cluster_stats().unwrap();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.commit_index, 2);
        assert_eq!(stats.votes_granted, 1);
    }

    #[test]
    fn test_response_without_request_is_rejected() {
        let store = MemoryStore::new();
        let err = store.store_vote_response(&response("b", "a", 1, true)).unwrap_err();
        assert!(matches!(err, Error::InvalidVote(_)));
    }

    #[test]
    fn test_commit_and_term_never_regress() {
        let store = MemoryStore::new();
        store.append_log(&LogEntry::new_noop(1, 1)).unwrap();
        assert_eq!(store.commit(5).unwrap(), 1);
        assert_eq!(store.commit(0).unwrap(), 1);

        store
            .start_term(&PersistentState {
                current_term: 3,
                voted_for: None,
            })
            .unwrap();
        store
            .start_term(&PersistentState {
                current_term: 2,
                voted_for: Some("x".into()),
            })
            .unwrap();
        assert_eq!(store.term().unwrap().current_term, 3);
    }

    #[test]
    fn test_conflicting_append_truncates() {
        let store = MemoryStore::new();
        for i in 1..=3 {
            store.append_log(&LogEntry::new_noop(i, 1)).unwrap();
        }
        store.append_log(&LogEntry::new_noop(2, 2)).unwrap();
        let log = store.log_entries(0).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
    }

    #[test]
    fn test_file_store_replays_wal() -> Result<()> {
        let dir = tempdir()?;
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
        };

        {
            let store = FileStore::open(config.clone())?;
            exercise(&store)?;
            assert_eq!(store.record_count(), 9);
        }

        let store = FileStore::open(config)?;
        assert_eq!(store.record_count(), 9);
        assert_eq!(store.term()?.voted_for.as_deref(), Some("a"));
        assert_eq!(store.log_entries(0)?.len(), 2);
        assert_eq!(store.cluster_stats()?.commit_index, 2);
        assert!(store.votes(1)?.is_empty());
        assert_eq!(store.votes(2)?[0].responses.len(), 2);
        Ok(())
    }

    #[test]
    fn test_file_store_skips_corrupt_lines() -> Result<()> {
        let dir = tempdir()?;
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: true,
        };
        {
            let store = FileStore::open(config.clone())?;
            store.upsert_node(&NodeRecord::new("a"))?;
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join(WAL_FILE))?;
        writeln!(file, "{{not json")?;
        drop(file);

        let store = FileStore::open(config)?;
        assert_eq!(store.nodes()?.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_restarts_from_file_journal() -> Result<()> {
        let dir = tempdir()?;
        let store: SharedStore = Arc::new(FileStore::open(FileStoreConfig::new(dir.path()))?);

        let network = MemoryNetwork::new();
        let (journal, records) = mpsc::unbounded_channel();
        let writer = spawn_journal_writer(store.clone(), records);
        let core = ElectionCore::new("solo", vec![], ElectionConfig::default());
        let (handle, task) = ElectionNode::new(core, network.endpoint("solo"))
            .with_journal(journal)
            .spawn();
        network.attach("solo", handle.mailbox());

        let mut feed = handle.subscribe();
        while feed.recv().await.unwrap().event_type() != EventType::LeaderElection {}
        handle.submit("mode", json!("eco")).await?;
        handle.submit("limit", json!(32)).await?;

        handle.shutdown();
        task.await.unwrap();
        writer.await.unwrap();
        drop(store);

        let store = FileStore::open(FileStoreConfig::new(dir.path()))?;
        assert_eq!(store.log_entries(1)?.len(), 3);

        let mut core = ElectionCore::new("solo", vec![], ElectionConfig::default());
        recover(&mut core, &store)?;
        assert_eq!(core.term(), 1);
        assert_eq!(core.voted_for(), Some(&"solo".to_string()));
        assert_eq!(core.log().last_index(), 3);
        assert_eq!(core.log().commit_index(), 3);
        assert_eq!(core.log().state().get("mode"), Some(&json!("eco")));
        assert_eq!(core.log().state().get("limit"), Some(&json!(32)));
        Ok(())
    }
}
