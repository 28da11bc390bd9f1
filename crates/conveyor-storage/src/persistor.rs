// Per-client state files tagged with the last applied sequence of every
// upstream replica.
//
// Layout: <root>/<component>-persistor/<client_id>/<file_name>
// Content: one decimal seq per replica, each followed by '\n', then the blob.
use crate::{
    Result, StorageError, TMP_SUFFIX, atomic_write, remove_dir_all_if_exists, validate_name,
};
use bytes::Bytes;
use conveyor_common::{ClientId, DelId, Seq};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Seq of the last delivery from each replica whose effect is in the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedHeader {
    pub seqs: Vec<Seq>,
}

impl PersistedHeader {
    /// Header for a file nothing has been applied to yet.
    pub fn empty(replicas: usize) -> Self {
        Self {
            seqs: vec![-1; replicas],
        }
    }

    /// True when the effect of `id` is already reflected in the stored blob.
    pub fn is_dup(&self, id: DelId) -> bool {
        self.seqs
            .get(id.replica_id)
            .is_some_and(|last| id.seq <= *last)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.seqs.len() * 4);
        for seq in &self.seqs {
            out.extend_from_slice(seq.to_string().as_bytes());
            out.push(b'\n');
        }
        out
    }
}

/// One persisted file as returned by `load` and recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedFile {
    pub client_id: ClientId,
    pub file_name: String,
    pub header: PersistedHeader,
    pub state: Bytes,
}

/// Atomic store of per-client state files.
///
/// ```
/// use conveyor_common::DelId;
/// use conveyor_storage::Persistor;
///
/// let root = tempfile::tempdir().expect("tempdir");
/// let persistor = Persistor::new(root.path(), "join", 2);
/// persistor
///     .store(DelId::new(1, 4, 3), "left-1", b"movie=7", None)
///     .expect("store");
/// let file = persistor.load(3, "left-1").expect("load");
/// assert_eq!(file.header.seqs, vec![-1, 4]);
/// assert_eq!(&file.state[..], b"movie=7");
/// assert!(file.header.is_dup(DelId::new(1, 4, 3)));
/// ```
#[derive(Debug, Clone)]
pub struct Persistor {
    dir: PathBuf,
    replicas: usize,
}

impl Persistor {
    pub fn new(root: impl AsRef<Path>, component: &str, replicas: usize) -> Self {
        Self {
            dir: root.as_ref().join(format!("{component}-persistor")),
            replicas,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    fn client_dir(&self, client_id: ClientId) -> PathBuf {
        self.dir.join(client_id.to_string())
    }

    /// Stores `data` under `(id.client_id, file_name)` and records `id.seq` for
    /// `id.replica_id`. `header` skips the read when the caller already holds the
    /// current header; one of the wrong length is ignored. Returns the written header.
    pub fn store(
        &self,
        id: DelId,
        file_name: &str,
        data: &[u8],
        header: Option<PersistedHeader>,
    ) -> Result<PersistedHeader> {
        if id.replica_id >= self.replicas {
            return Err(StorageError::ReplicaOutOfRange {
                replica: id.replica_id,
                replicas: self.replicas,
            });
        }
        let mut header = match header {
            Some(header) if header.seqs.len() == self.replicas => header,
            _ => self.load_header(id.client_id, file_name)?,
        };
        header.seqs[id.replica_id] = id.seq;

        let mut content = header.encode();
        content.extend_from_slice(data);
        atomic_write(&self.client_dir(id.client_id), file_name, &content)?;
        tracing::trace!(client = id.client_id, file = file_name, seq = id.seq, "state stored");
        Ok(header)
    }

    /// Header of `(client_id, file_name)`, or an all -1 header when the file does not exist.
    pub fn load_header(&self, client_id: ClientId, file_name: &str) -> Result<PersistedHeader> {
        match self.load(client_id, file_name) {
            Ok(file) => Ok(file.header),
            Err(StorageError::NotFound(_)) => Ok(PersistedHeader::empty(self.replicas)),
            Err(err) => Err(err),
        }
    }

    pub fn load(&self, client_id: ClientId, file_name: &str) -> Result<PersistedFile> {
        validate_name(file_name)?;
        let path = self.client_dir(client_id).join(file_name);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path));
            }
            Err(err) => return Err(err.into()),
        };
        let (header, state) = self.parse(&path, content)?;
        Ok(PersistedFile {
            client_id,
            file_name: file_name.to_string(),
            header,
            state,
        })
    }

    fn parse(&self, path: &Path, content: Vec<u8>) -> Result<(PersistedHeader, Bytes)> {
        let corrupt = |reason: String| StorageError::Corruption {
            path: path.to_path_buf(),
            reason,
        };
        let mut seqs = Vec::with_capacity(self.replicas);
        let mut offset = 0;
        for replica in 0..self.replicas {
            let end = content[offset..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|pos| offset + pos)
                .ok_or_else(|| corrupt(format!("header ends before replica {replica}")))?;
            let line = std::str::from_utf8(&content[offset..end])
                .map_err(|_| corrupt(format!("header line {replica} is not utf-8")))?;
            let seq = line
                .trim()
                .parse::<Seq>()
                .map_err(|_| corrupt(format!("header line {replica} is not a number: {line:?}")))?;
            seqs.push(seq);
            offset = end + 1;
        }
        let state = Bytes::from(content).slice(offset..);
        Ok((PersistedHeader { seqs }, state))
    }

    /// Every complete file of a client, sorted by name. Scratch files and
    /// subdirectories are skipped; unreadable files are logged and skipped.
    pub fn recover_for(&self, client_id: ClientId) -> Result<Vec<PersistedFile>> {
        let entries = match fs::read_dir(self.client_dir(client_id)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            match self.load(client_id, &name) {
                Ok(file) => files.push(file),
                Err(err) => {
                    tracing::warn!(client = client_id, file = %name, error = %err, "skipping unreadable state file");
                }
            }
        }
        Ok(files)
    }

    /// Every complete file of every client, ordered by client id then name.
    pub fn recover(&self) -> Result<Vec<PersistedFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut clients = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|name| name.parse::<ClientId>().ok()) {
                Some(client_id) => clients.push(client_id),
                None => {
                    tracing::warn!(dir = ?name, "skipping directory that is not a client id");
                }
            }
        }
        clients.sort_unstable();

        let mut files = Vec::new();
        for client_id in clients {
            files.extend(self.recover_for(client_id)?);
        }
        Ok(files)
    }

    /// Removes everything stored for a client.
    pub fn flush(&self, client_id: ClientId) -> Result<()> {
        remove_dir_all_if_exists(&self.client_dir(client_id))
    }

    /// Removes everything stored by this persistor.
    pub fn purge(&self) -> Result<()> {
        remove_dir_all_if_exists(&self.dir)
    }
}
