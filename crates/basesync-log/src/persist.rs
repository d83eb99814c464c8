//! File storage for streams.
//!
//! Layout under the storage root, one directory per stream:
//!
//! ```text
//! <root>/<stream>/stream.json      stream configuration
//! <root>/<stream>/messages.jsonl   one StoredMessage per line, append-only
//! <root>/<stream>/state.json       sequence bounds and consumer snapshots
//! ```
//!
//! `messages.jsonl` may contain records that were already trimmed or retired;
//! they are filtered against `state.json` on load and dropped by compaction.

use crate::consumer::ConsumerState;
use crate::error::LogError;
use crate::stream::{StoredMessage, StreamConfig, StreamState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONFIG_FILE: &str = "stream.json";
const MESSAGES_FILE: &str = "messages.jsonl";
const STATE_FILE: &str = "state.json";

/// Number of dead message records that triggers a rewrite of `messages.jsonl`.
pub(crate) const COMPACT_THRESHOLD: usize = 1024;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamSnapshot {
    first_seq: u64,
    last_seq: u64,
    removed: BTreeSet<u64>,
    consumers: BTreeMap<String, ConsumerState>,
}

#[derive(Debug, Clone)]
pub(crate) struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub(crate) fn open(root: &Path) -> Result<Self, LogError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.root.join(stream)
    }

    pub(crate) fn create_stream(&self, config: &StreamConfig) -> Result<(), LogError> {
        let dir = self.stream_dir(&config.name);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(CONFIG_FILE), &serde_json::to_vec_pretty(config)?)?;
        Ok(())
    }

    pub(crate) fn remove_stream(&self, stream: &str) -> Result<(), LogError> {
        let dir = self.stream_dir(stream);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub(crate) fn append_message(&self, stream: &str, msg: &StoredMessage) -> Result<(), LogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stream_dir(stream).join(MESSAGES_FILE))?;
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    pub(crate) fn save_state(&self, state: &StreamState) -> Result<(), LogError> {
        let first_seq = match state.messages.keys().next() {
            Some(first) => *first,
            None => state.last_seq + 1,
        };
        let removed = (first_seq..=state.last_seq)
            .filter(|seq| !state.messages.contains_key(seq))
            .collect();
        let snapshot = StreamSnapshot {
            first_seq,
            last_seq: state.last_seq,
            removed,
            consumers: state
                .consumers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        write_atomic(
            &self.stream_dir(&state.config.name).join(STATE_FILE),
            &serde_json::to_vec(&snapshot)?,
        )
    }

    /// Rewrite `messages.jsonl` with only the retained messages.
    pub(crate) fn compact(&self, state: &StreamState) -> Result<(), LogError> {
        let mut buf = Vec::new();
        for msg in state.messages.values() {
            serde_json::to_writer(&mut buf, msg)?;
            buf.push(b'\n');
        }
        write_atomic(&self.stream_dir(&state.config.name).join(MESSAGES_FILE), &buf)?;
        debug!(stream = %state.config.name, retained = state.messages.len(), "compacted stream file");
        Ok(())
    }

    /// Load every stream found under the root.
    pub(crate) fn load_all(&self) -> Result<Vec<StreamState>, LogError> {
        let mut streams = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let config_path = dir.join(CONFIG_FILE);
            if !config_path.exists() {
                continue;
            }
            streams.push(load_stream(&dir, &config_path)?);
        }
        Ok(streams)
    }
}

fn load_stream(dir: &Path, config_path: &Path) -> Result<StreamState, LogError> {
    let config: StreamConfig = serde_json::from_slice(&fs::read(config_path)?)?;
    let snapshot: StreamSnapshot = match fs::read(dir.join(STATE_FILE)) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StreamSnapshot::default(),
        Err(e) => return Err(e.into()),
    };

    let mut state = StreamState::new(config);
    let messages_path = dir.join(MESSAGES_FILE);
    if messages_path.exists() {
        let reader = BufReader::new(File::open(&messages_path)?);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let msg: StoredMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    // A torn final write; everything before it is intact.
                    warn!(stream = %state.config.name, line = lineno + 1, error = %e, "truncated message record");
                    break;
                }
            };
            state.last_seq = state.last_seq.max(msg.seq);
            if msg.seq < snapshot.first_seq || snapshot.removed.contains(&msg.seq) {
                state.stale_records += 1;
                continue;
            }
            state.messages.insert(msg.seq, msg);
        }
    }
    state.last_seq = state.last_seq.max(snapshot.last_seq);

    for (name, mut consumer) in snapshot.consumers {
        consumer.reset_deadlines();
        state.consumers.insert(name, consumer);
    }
    Ok(state)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LogError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
