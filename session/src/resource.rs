//! Resource ledger for the binary inputs of the simulation
//!
//! The host publishes local files under strictly increasing ids and serves
//! them in fixed-size chunks. Clients learn resource identities from the
//! join data, fetch the chunks and write the assembled file into the work
//! directory once its content hash checks out.
//!
//! Entries move through `Described -> Publishing | Fetching -> Present`.
//! In a ranked session nothing is served before its hash is known.

use crate::error::ResourceError;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use shared::{ContentHash, ResourceCore, ResourceId, ResourceKind};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Chunks the host streams in answer to a single request
pub const REQUEST_WINDOW: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Identity known, no local bytes
    Described,
    /// Local file exposed to joiners by the host
    Publishing,
    Fetching,
    Present,
}

#[derive(Debug)]
struct ResourceEntry {
    core: ResourceCore,
    state: ResourceState,
    path: Option<PathBuf>,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    generated: bool,
}

impl ResourceEntry {
    fn percent(&self) -> u8 {
        match self.state {
            ResourceState::Described => 0,
            ResourceState::Publishing | ResourceState::Present => 100,
            ResourceState::Fetching => {
                if self.core.chunk_count == 0 {
                    100
                } else {
                    (u64::from(self.received) * 100 / u64::from(self.core.chunk_count)) as u8
                }
            }
        }
    }
}

/// Outcome of one poll of a retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievePoll {
    Progress(u8),
    /// No new chunk for a while; the hard timeout has not fired yet
    Stalled { percent: u8, idle: Duration },
    Done(PathBuf),
    TimedOut { percent: u8 },
    Unknown,
}

/// Poll-based retrieval of one resource with a stall timeout
///
/// The timeout counts from the last observed progress, so large files may
/// take as long as they need while chunks keep arriving.
#[derive(Debug, Clone)]
pub struct RetrieveTask {
    pub res_id: ResourceId,
    timeout: Duration,
    stall_after: Duration,
    last_percent: u8,
    last_progress: Instant,
}

impl RetrieveTask {
    pub fn new(res_id: ResourceId, timeout: Duration, now: Instant) -> Self {
        Self {
            res_id,
            timeout,
            stall_after: timeout / 10,
            last_percent: 0,
            last_progress: now,
        }
    }
}

#[derive(Debug)]
pub struct ResourceLedger {
    entries: BTreeMap<ResourceId, ResourceEntry>,
    next_id: ResourceId,
    work_dir: PathBuf,
    chunk_size: usize,
    ranked: bool,
    dynamic: Option<ResourceId>,
}

impl ResourceLedger {
    /// Opens a ledger writing into `work_dir`, creating it if needed
    pub fn open(work_dir: &Path, chunk_size: usize, ranked: bool) -> Result<Self, ResourceError> {
        fs::create_dir_all(work_dir).map_err(|e| ResourceError::io(work_dir, e))?;
        Ok(Self {
            entries: BTreeMap::new(),
            next_id: 1,
            work_dir: work_dir.to_path_buf(),
            chunk_size: chunk_size.clamp(1, u32::MAX as usize),
            ranked,
            dynamic: None,
        })
    }

    pub fn set_ranked(&mut self, ranked: bool) {
        self.ranked = ranked;
    }

    pub fn is_ranked(&self) -> bool {
        self.ranked
    }

    fn chunk_count(&self, size: u64) -> u32 {
        size.div_ceil(self.chunk_size as u64) as u32
    }

    /// Registers a local file and assigns it the next resource id
    ///
    /// Publishing a dynamic snapshot replaces the previous one.
    pub fn publish(&mut self, path: &Path, kind: ResourceKind) -> Result<ResourceCore, ResourceError> {
        let meta = fs::metadata(path).map_err(|e| ResourceError::io(path, e))?;
        if !meta.is_file() {
            return Err(ResourceError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file"),
            ));
        }

        let id = self.next_id;
        self.next_id += 1;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("resource-{}", id));
        let core = ResourceCore {
            id,
            kind,
            file_name,
            size: meta.len(),
            chunk_size: self.chunk_size as u32,
            chunk_count: self.chunk_count(meta.len()),
            hash: None,
        };

        if kind == ResourceKind::Dynamic {
            self.invalidate_dynamic();
            self.dynamic = Some(id);
        }

        info!(
            "Published resource {} ({:?}, {} bytes, {} chunks)",
            id, kind, core.size, core.chunk_count
        );
        self.entries.insert(
            id,
            ResourceEntry {
                core: core.clone(),
                state: ResourceState::Publishing,
                path: Some(path.to_path_buf()),
                chunks: Vec::new(),
                received: 0,
                generated: false,
            },
        );
        Ok(core)
    }

    /// Writes generated bytes to the work directory and publishes them
    pub fn publish_bytes(
        &mut self,
        name: &str,
        kind: ResourceKind,
        bytes: &[u8],
    ) -> Result<ResourceCore, ResourceError> {
        let path = self.work_dir.join(format!("{}-{}", self.next_id, name));
        fs::write(&path, bytes).map_err(|e| ResourceError::io(&path, e))?;

        let core = self.publish(&path, kind)?;
        if let Some(entry) = self.entries.get_mut(&core.id) {
            entry.generated = true;
        }
        Ok(core)
    }

    /// Records an identity received from the host
    pub fn add_described(&mut self, core: ResourceCore) {
        let id = core.id;
        self.next_id = self.next_id.max(id.saturating_add(1));
        if core.kind == ResourceKind::Dynamic {
            self.dynamic = Some(id);
        }
        self.entries.entry(id).or_insert_with(|| ResourceEntry {
            core,
            state: ResourceState::Described,
            path: None,
            chunks: Vec::new(),
            received: 0,
            generated: false,
        });
    }

    /// Computes every missing content hash; returns how many were computed
    pub fn ensure_hashes(&mut self) -> Result<usize, ResourceError> {
        let mut computed = 0;
        for entry in self.entries.values_mut() {
            if entry.core.hash.is_some() {
                continue;
            }
            if let Some(path) = &entry.path {
                entry.core.hash = Some(hash_file(path)?);
                debug!("Hashed resource {}", entry.core.id);
                computed += 1;
            }
        }
        Ok(computed)
    }

    pub fn all_hashed(&self) -> bool {
        self.entries.values().all(|entry| entry.core.hash.is_some())
    }

    /// Reads one chunk of a local resource for a requesting peer
    pub fn serve_chunk(&self, id: ResourceId, index: u32) -> Result<Vec<u8>, ResourceError> {
        let entry = self.entries.get(&id).ok_or(ResourceError::Unknown(id))?;
        if self.ranked && entry.core.hash.is_none() {
            return Err(ResourceError::NotHashed(id));
        }
        let path = match (&entry.path, entry.state) {
            (Some(path), ResourceState::Publishing | ResourceState::Present) => path,
            _ => return Err(ResourceError::NotPresent(id)),
        };
        if index >= entry.core.chunk_count {
            return Err(ResourceError::ChunkOutOfRange { id, index });
        }

        let mut file = fs::File::open(path).map_err(|e| ResourceError::io(path, e))?;
        let offset = u64::from(index) * self.chunk_size as u64;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| ResourceError::io(path, e))?;

        let mut data = Vec::with_capacity(self.chunk_size);
        file.take(self.chunk_size as u64)
            .read_to_end(&mut data)
            .map_err(|e| ResourceError::io(path, e))?;
        Ok(data)
    }

    /// Starts fetching a described resource
    pub fn begin_fetch(&mut self, id: ResourceId) -> Result<(), ResourceError> {
        let entry = self.entries.get_mut(&id).ok_or(ResourceError::Unknown(id))?;
        if entry.state != ResourceState::Described {
            return Ok(());
        }
        if !entry.core.has_valid_layout() {
            warn!("Resource {} has an inconsistent chunk layout", id);
            return Err(ResourceError::BadLayout(id));
        }
        entry.state = ResourceState::Fetching;
        entry.chunks = vec![None; entry.core.chunk_count as usize];
        entry.received = 0;
        debug!("Fetching resource {} ({} chunks)", id, entry.core.chunk_count);

        if entry.core.chunk_count == 0 {
            self.complete(id)?;
        }
        Ok(())
    }

    /// Stores a received chunk; returns true once the resource is present
    pub fn receive_chunk(
        &mut self,
        id: ResourceId,
        index: u32,
        data: Vec<u8>,
    ) -> Result<bool, ResourceError> {
        let entry = self.entries.get_mut(&id).ok_or(ResourceError::Unknown(id))?;
        match entry.state {
            ResourceState::Fetching => {}
            ResourceState::Present | ResourceState::Publishing => return Ok(true),
            ResourceState::Described => return Ok(false),
        }
        let expected = entry
            .core
            .chunk_len(index)
            .ok_or(ResourceError::ChunkOutOfRange { id, index })?;
        if data.len() as u64 != expected {
            return Err(ResourceError::ChunkLength {
                id,
                index,
                len: data.len(),
                expected,
            });
        }
        let slot = entry
            .chunks
            .get_mut(index as usize)
            .ok_or(ResourceError::ChunkOutOfRange { id, index })?;
        if slot.is_none() {
            *slot = Some(data);
            entry.received += 1;
        }

        if entry.received == entry.core.chunk_count {
            self.complete(id)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn complete(&mut self, id: ResourceId) -> Result<(), ResourceError> {
        let entry = self.entries.get_mut(&id).ok_or(ResourceError::Unknown(id))?;
        let bytes: Vec<u8> = entry.chunks.iter().flatten().flatten().copied().collect();

        if let Some(expected) = entry.core.hash {
            if hash_bytes(&bytes) != expected {
                warn!("Resource {} failed hash check, refetching", id);
                entry.chunks = vec![None; entry.core.chunk_count as usize];
                entry.received = 0;
                return Err(ResourceError::HashMismatch(id));
            }
        }

        let safe_name = Path::new(&entry.core.file_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resource".to_string());
        let path = self.work_dir.join(format!("{}-{}", id, safe_name));
        fs::write(&path, &bytes).map_err(|e| ResourceError::io(&path, e))?;

        info!("Resource {} retrieved ({} bytes)", id, bytes.len());
        entry.state = ResourceState::Present;
        entry.path = Some(path);
        entry.chunks = Vec::new();
        entry.generated = true;
        Ok(())
    }

    /// First chunk not yet received by an ongoing fetch
    pub fn missing_chunk(&self, id: ResourceId) -> Option<u32> {
        let entry = self.entries.get(&id)?;
        if entry.state != ResourceState::Fetching {
            return None;
        }
        entry
            .chunks
            .iter()
            .position(Option::is_none)
            .map(|index| index as u32)
    }

    /// Ids of all resources currently being fetched
    pub fn fetching(&self) -> Vec<ResourceId> {
        self.entries
            .values()
            .filter(|entry| entry.state == ResourceState::Fetching)
            .map(|entry| entry.core.id)
            .collect()
    }

    /// Drops the dynamic snapshot; its id is never handed out again
    pub fn invalidate_dynamic(&mut self) -> Option<ResourceCore> {
        let id = self.dynamic.take()?;
        let entry = self.entries.remove(&id)?;
        if entry.generated {
            if let Some(path) = &entry.path {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Could not remove dynamic snapshot {}: {}", path.display(), e);
                }
            }
        }
        info!("Dynamic snapshot {} invalidated", id);
        Some(entry.core)
    }

    /// Starts retrieving a resource and returns the task to poll
    pub fn retrieve(
        &mut self,
        core: &ResourceCore,
        timeout: Duration,
        now: Instant,
    ) -> Result<RetrieveTask, ResourceError> {
        self.add_described(core.clone());
        self.begin_fetch(core.id)?;

        let mut task = RetrieveTask::new(core.id, timeout, now);
        task.last_percent = self.percent(core.id).unwrap_or(0);
        Ok(task)
    }

    pub fn poll_retrieve(&self, task: &mut RetrieveTask, now: Instant) -> RetrievePoll {
        let Some(entry) = self.entries.get(&task.res_id) else {
            return RetrievePoll::Unknown;
        };
        if matches!(entry.state, ResourceState::Present | ResourceState::Publishing) {
            if let Some(path) = &entry.path {
                return RetrievePoll::Done(path.clone());
            }
        }

        let percent = entry.percent();
        if percent != task.last_percent {
            task.last_percent = percent;
            task.last_progress = now;
            return RetrievePoll::Progress(percent);
        }

        let idle = now.saturating_duration_since(task.last_progress);
        if idle >= task.timeout {
            RetrievePoll::TimedOut { percent }
        } else if idle >= task.stall_after {
            RetrievePoll::Stalled { percent, idle }
        } else {
            RetrievePoll::Progress(percent)
        }
    }

    pub fn core(&self, id: ResourceId) -> Option<&ResourceCore> {
        self.entries.get(&id).map(|entry| &entry.core)
    }

    pub fn state(&self, id: ResourceId) -> Option<ResourceState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    pub fn path(&self, id: ResourceId) -> Option<&Path> {
        self.entries.get(&id).and_then(|entry| entry.path.as_deref())
    }

    pub fn percent(&self, id: ResourceId) -> Option<u8> {
        self.entries.get(&id).map(ResourceEntry::percent)
    }

    pub fn dynamic(&self) -> Option<&ResourceCore> {
        self.dynamic.and_then(|id| self.core(id))
    }

    /// Identities of every resource except the dynamic snapshot
    pub fn static_cores(&self) -> Vec<ResourceCore> {
        self.entries
            .values()
            .filter(|entry| entry.core.kind != ResourceKind::Dynamic)
            .map(|entry| entry.core.clone())
            .collect()
    }
}

fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(bytes));
    hash
}

fn hash_file(path: &Path) -> Result<ContentHash, ResourceError> {
    let mut file = fs::File::open(path).map_err(|e| ResourceError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).map_err(|e| ResourceError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_publish_assigns_increasing_ids() {
        let dir = tempdir().unwrap();
        let mut ledger = ResourceLedger::open(&dir.path().join("work"), 100, false).unwrap();
        let scenario = write_file(dir.path(), "scenario.bin", 250);
        let defs = write_file(dir.path(), "defs.bin", 10);

        let a = ledger.publish(&scenario, ResourceKind::Scenario).unwrap();
        let b = ledger.publish(&defs, ResourceKind::Definitions).unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.chunk_count, 3);
        assert_eq!(a.size, 250);
        assert_eq!(a.file_name, "scenario.bin");
        assert_eq!(ledger.state(a.id), Some(ResourceState::Publishing));
    }

    #[test]
    fn test_publish_missing_file_fails() {
        let dir = tempdir().unwrap();
        let mut ledger = ResourceLedger::open(dir.path(), 100, false).unwrap();

        let result = ledger.publish(&dir.path().join("absent.bin"), ResourceKind::Scenario);
        assert!(matches!(result, Err(ResourceError::Io { .. })));
    }

    #[test]
    fn test_dynamic_ids_never_reused() {
        let dir = tempdir().unwrap();
        let mut ledger = ResourceLedger::open(dir.path(), 64, false).unwrap();

        let first = ledger
            .publish_bytes("dynamic.bin", ResourceKind::Dynamic, b"state one")
            .unwrap();
        let removed = ledger.invalidate_dynamic().unwrap();
        assert_eq!(removed.id, first.id);
        assert!(ledger.dynamic().is_none());
        assert!(ledger.invalidate_dynamic().is_none());

        let second = ledger
            .publish_bytes("dynamic.bin", ResourceKind::Dynamic, b"state two")
            .unwrap();
        assert!(second.id > first.id);
        assert_eq!(ledger.dynamic().unwrap().id, second.id);
    }

    #[test]
    fn test_ranked_ledger_refuses_unhashed_chunks() {
        let dir = tempdir().unwrap();
        let mut ledger = ResourceLedger::open(dir.path(), 64, true).unwrap();
        let path = write_file(dir.path(), "scenario.bin", 100);
        let core = ledger.publish(&path, ResourceKind::Scenario).unwrap();

        assert!(matches!(
            ledger.serve_chunk(core.id, 0),
            Err(ResourceError::NotHashed(_))
        ));
        assert!(!ledger.all_hashed());

        assert_eq!(ledger.ensure_hashes().unwrap(), 1);
        assert!(ledger.all_hashed());
        assert_eq!(ledger.serve_chunk(core.id, 1).unwrap().len(), 36);
        assert_eq!(ledger.ensure_hashes().unwrap(), 0);
    }

    #[test]
    fn test_transfer_between_ledgers() {
        let dir = tempdir().unwrap();
        let mut host = ResourceLedger::open(&dir.path().join("host"), 64, false).unwrap();
        let mut client = ResourceLedger::open(&dir.path().join("client"), 64, false).unwrap();
        let path = write_file(dir.path(), "scenario.bin", 200);
        host.publish(&path, ResourceKind::Scenario).unwrap();
        host.ensure_hashes().unwrap();
        let core = host.static_cores().remove(0);

        let now = Instant::now();
        let mut task = client.retrieve(&core, Duration::from_secs(100), now).unwrap();
        assert_eq!(client.missing_chunk(core.id), Some(0));

        // Out of order and duplicated delivery
        for index in [3, 1, 1, 0] {
            let chunk = host.serve_chunk(core.id, index).unwrap();
            assert!(!client.receive_chunk(core.id, index, chunk).unwrap());
        }
        assert_eq!(client.missing_chunk(core.id), Some(2));
        assert_eq!(
            client.poll_retrieve(&mut task, now),
            RetrievePoll::Progress(75)
        );

        let chunk = host.serve_chunk(core.id, 2).unwrap();
        assert!(client.receive_chunk(core.id, 2, chunk).unwrap());

        match client.poll_retrieve(&mut task, now) {
            RetrievePoll::Done(local) => {
                assert_eq!(fs::read(local).unwrap(), fs::read(&path).unwrap());
            }
            other => panic!("Unexpected poll result {:?}", other),
        }
    }

    #[test]
    fn test_hash_mismatch_restarts_fetch() {
        let dir = tempdir().unwrap();
        let mut client = ResourceLedger::open(dir.path(), 4, false).unwrap();
        let core = ResourceCore {
            id: 9,
            kind: ResourceKind::Material,
            file_name: "material.bin".to_string(),
            size: 4,
            chunk_size: 4,
            chunk_count: 1,
            hash: Some(hash_bytes(b"good")),
        };
        client.retrieve(&core, Duration::from_secs(10), Instant::now()).unwrap();

        let result = client.receive_chunk(9, 0, b"evil".to_vec());
        assert!(matches!(result, Err(ResourceError::HashMismatch(9))));
        assert_eq!(client.missing_chunk(9), Some(0));

        assert!(client.receive_chunk(9, 0, b"good".to_vec()).unwrap());
        assert_eq!(client.state(9), Some(ResourceState::Present));
    }

    #[test]
    fn test_chunk_length_is_checked() {
        let dir = tempdir().unwrap();
        let mut client = ResourceLedger::open(dir.path(), 10, false).unwrap();
        let core = ResourceCore {
            id: 4,
            kind: ResourceKind::Scenario,
            file_name: "s.bin".to_string(),
            size: 25,
            chunk_size: 10,
            chunk_count: 3,
            hash: None,
        };
        client.retrieve(&core, Duration::from_secs(10), Instant::now()).unwrap();

        assert!(matches!(
            client.receive_chunk(4, 0, vec![1; 9]),
            Err(ResourceError::ChunkLength { index: 0, len: 9, expected: 10, .. })
        ));
        assert!(matches!(
            client.receive_chunk(4, 2, vec![1; 10]),
            Err(ResourceError::ChunkLength { index: 2, expected: 5, .. })
        ));
        assert!(matches!(
            client.receive_chunk(4, 7, vec![1; 10]),
            Err(ResourceError::ChunkOutOfRange { index: 7, .. })
        ));
        assert_eq!(client.missing_chunk(4), Some(0));

        assert!(!client.receive_chunk(4, 0, vec![1; 10]).unwrap());
        assert!(!client.receive_chunk(4, 1, vec![2; 10]).unwrap());
        assert!(client.receive_chunk(4, 2, vec![3; 5]).unwrap());
        let local = client.path(4).unwrap();
        assert_eq!(fs::metadata(local).unwrap().len(), 25);
    }

    #[test]
    fn test_inconsistent_layout_is_refused() {
        let dir = tempdir().unwrap();
        let mut client = ResourceLedger::open(dir.path(), 10, false).unwrap();
        let core = ResourceCore {
            id: 5,
            kind: ResourceKind::Material,
            file_name: "m.bin".to_string(),
            size: 25,
            chunk_size: 10,
            chunk_count: 40,
            hash: None,
        };

        assert!(matches!(
            client.retrieve(&core, Duration::from_secs(10), Instant::now()),
            Err(ResourceError::BadLayout(5))
        ));
    }

    #[test]
    fn test_described_id_near_limit() {
        let dir = tempdir().unwrap();
        let mut ledger = ResourceLedger::open(dir.path(), 10, false).unwrap();
        ledger.add_described(ResourceCore {
            id: ResourceId::MAX,
            kind: ResourceKind::Material,
            file_name: "last.bin".to_string(),
            size: 0,
            chunk_size: 10,
            chunk_count: 0,
            hash: None,
        });
        assert!(ledger.core(ResourceId::MAX).is_some());
    }

    #[test]
    fn test_stall_timeout_resets_on_progress() {
        let dir = tempdir().unwrap();
        let mut client = ResourceLedger::open(dir.path(), 10, false).unwrap();
        let core = ResourceCore {
            id: 1,
            kind: ResourceKind::Scenario,
            file_name: "s.bin".to_string(),
            size: 40,
            chunk_size: 10,
            chunk_count: 4,
            hash: None,
        };
        let start = Instant::now();
        let mut task = client.retrieve(&core, Duration::from_secs(100), start).unwrap();

        assert_eq!(
            client.poll_retrieve(&mut task, start + Duration::from_secs(5)),
            RetrievePoll::Progress(0)
        );
        assert!(matches!(
            client.poll_retrieve(&mut task, start + Duration::from_secs(15)),
            RetrievePoll::Stalled { percent: 0, .. }
        ));

        // A chunk arriving late restarts the clock
        client.receive_chunk(1, 0, vec![0; 10]).unwrap();
        let late = start + Duration::from_secs(90);
        assert_eq!(client.poll_retrieve(&mut task, late), RetrievePoll::Progress(25));
        assert_eq!(
            client.poll_retrieve(&mut task, late + Duration::from_secs(99)),
            RetrievePoll::Stalled {
                percent: 25,
                idle: Duration::from_secs(99)
            }
        );
        assert_eq!(
            client.poll_retrieve(&mut task, late + Duration::from_secs(100)),
            RetrievePoll::TimedOut { percent: 25 }
        );
    }

    #[test]
    fn test_empty_resource_completes_immediately() {
        let dir = tempdir().unwrap();
        let mut client = ResourceLedger::open(dir.path(), 10, false).unwrap();
        let core = ResourceCore {
            id: 2,
            kind: ResourceKind::Definitions,
            file_name: "empty.bin".to_string(),
            size: 0,
            chunk_size: 10,
            chunk_count: 0,
            hash: None,
        };
        let now = Instant::now();
        let mut task = client.retrieve(&core, Duration::from_secs(1), now).unwrap();

        assert!(matches!(
            client.poll_retrieve(&mut task, now),
            RetrievePoll::Done(_)
        ));
    }
}
