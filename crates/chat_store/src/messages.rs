use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::persist::{lock_unpoisoned, write_atomic};
use crate::schema::{ChatMessage, MessageRecord};

/// Log records beyond this many per live row trigger a compaction on open.
const COMPACTION_RATIO: usize = 4;
const COMPACTION_FLOOR: usize = 256;

#[derive(Debug, Clone)]
struct CachedRow {
    seq: u64,
    message: ChatMessage,
}

#[derive(Debug, Default)]
struct CacheState {
    rows: HashMap<String, CachedRow>,
    next_seq: u64,
    log: Option<File>,
    log_records: usize,
    /// Byte length of the log up to its last complete record.
    log_len: u64,
    /// A failed append may have left bytes past `log_len`.
    tail_dirty: bool,
}

impl CacheState {
    fn apply(&mut self, record: MessageRecord) {
        match record {
            MessageRecord::Upsert { message } => {
                let seq = match self.rows.get(&message.id) {
                    Some(existing) => existing.seq,
                    None => {
                        let seq = self.next_seq;
                        self.next_seq += 1;
                        seq
                    }
                };
                self.rows.insert(message.id.clone(), CachedRow { seq, message });
            }
            MessageRecord::DeleteSession { session_id } => {
                self.rows.retain(|_, row| row.message.session_id != session_id);
            }
        }
    }

    fn session_rows(&self, session_id: &str) -> Vec<ChatMessage> {
        let mut rows = self
            .rows
            .values()
            .filter(|row| row.message.session_id == session_id)
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.message.created_at_ms, row.seq));
        rows.into_iter().map(|row| row.message.clone()).collect()
    }
}

/// Durable, observable store of chat messages keyed by client message id.
///
/// Rows live in memory and every mutation is appended to a JSON Lines log
/// before it becomes visible, so a failed write leaves the cache untouched.
#[derive(Debug)]
pub struct MessageCache {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
    revision: watch::Sender<u64>,
}

impl MessageCache {
    pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        let mut state = CacheState::default();

        let clean_tail = match File::open(path) {
            Ok(file) => replay_log(path, file, &mut state)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
            Err(source) => return Err(StoreError::io("opening message log", path, source)),
        };

        let oversized = state.log_records > COMPACTION_FLOOR
            && state.log_records > state.rows.len() * COMPACTION_RATIO;
        if oversized || !clean_tail {
            compact_log(path, &mut state)?;
        }

        let log = open_append(path)?;
        state.log_len = log
            .metadata()
            .map_err(|source| StoreError::io("reading message log metadata", path, source))?
            .len();
        state.log = Some(log);
        debug!(
            path = %path.display(),
            rows = state.rows.len(),
            records = state.log_records,
            "opened message cache"
        );

        Ok(Arc::new(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
            revision: watch::channel(0).0,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            state: Mutex::new(CacheState::default()),
            revision: watch::channel(0).0,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn upsert(&self, message: ChatMessage) -> Result<(), StoreError> {
        if message.id.trim().is_empty() {
            return Err(StoreError::InvalidMessageId);
        }

        let mut state = lock_unpoisoned(&self.state);
        if state.rows.get(&message.id).map(|row| &row.message) == Some(&message) {
            return Ok(());
        }

        let record = MessageRecord::Upsert { message };
        self.append_record(&mut state, &record)?;
        state.apply(record);
        drop(state);

        self.bump_revision();
        Ok(())
    }

    /// Removes every row of `session_id`, returning how many were removed.
    pub fn delete_all(&self, session_id: &str) -> Result<usize, StoreError> {
        let mut state = lock_unpoisoned(&self.state);
        let removed = state
            .rows
            .values()
            .filter(|row| row.message.session_id == session_id)
            .count();
        if removed == 0 {
            return Ok(0);
        }

        let record = MessageRecord::DeleteSession {
            session_id: session_id.to_owned(),
        };
        self.append_record(&mut state, &record)?;
        state.apply(record);
        drop(state);

        debug!(session_id, removed, "deleted cached session messages");
        self.bump_revision();
        Ok(removed)
    }

    /// Rows of every session still marked as streaming.
    #[must_use]
    pub fn streaming_rows(&self) -> Vec<ChatMessage> {
        let state = lock_unpoisoned(&self.state);
        let mut rows = state
            .rows
            .values()
            .filter(|row| row.message.is_streaming)
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.message.clone()).collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ChatMessage> {
        lock_unpoisoned(&self.state)
            .rows
            .get(id)
            .map(|row| row.message.clone())
    }

    /// Rows of `session_id` ordered by creation time.
    #[must_use]
    pub fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        lock_unpoisoned(&self.state).session_rows(session_id)
    }

    /// Live query over one session; the first emission is the current state.
    #[must_use]
    pub fn observe(self: &Arc<Self>, session_id: impl Into<String>) -> MessageSubscription {
        MessageSubscription {
            cache: Arc::clone(self),
            session_id: session_id.into(),
            receiver: self.revision.subscribe(),
            last: None,
        }
    }

    fn append_record(
        &self,
        state: &mut CacheState,
        record: &MessageRecord,
    ) -> Result<(), StoreError> {
        let (Some(path), Some(log)) = (self.path.as_deref(), state.log.as_mut()) else {
            return Ok(());
        };

        let mut line =
            serde_json::to_vec(record).map_err(|source| StoreError::json_serialize(path, source))?;
        line.push(b'\n');

        // A record is only ever appended after the last complete one.
        if state.tail_dirty {
            log.set_len(state.log_len)
                .map_err(|source| StoreError::io("truncating torn message log tail", path, source))?;
            state.tail_dirty = false;
        }
        if let Err(source) = log.write_all(&line).and_then(|()| log.flush()) {
            if let Err(error) = log.set_len(state.log_len) {
                warn!(path = %path.display(), %error, "could not truncate partial log append");
                state.tail_dirty = true;
            }
            return Err(StoreError::io("appending to message log", path, source));
        }
        state.log_len += line.len() as u64;
        state.log_records += 1;
        Ok(())
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}

/// Subscription handle returned by [`MessageCache::observe`].
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct MessageSubscription {
    cache: Arc<MessageCache>,
    session_id: String,
    receiver: watch::Receiver<u64>,
    last: Option<Vec<ChatMessage>>,
}

impl MessageSubscription {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the next distinct state of the observed session.
    ///
    /// Returns `None` only if the cache has been torn down.
    pub async fn next(&mut self) -> Option<Vec<ChatMessage>> {
        loop {
            if self.last.is_some() && self.receiver.changed().await.is_err() {
                return None;
            }
            let _ = self.receiver.borrow_and_update();

            let current = self.cache.messages(&self.session_id);
            if self.last.as_ref() != Some(&current) {
                self.last = Some(current.clone());
                return Some(current);
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<ChatMessage>> + Send {
        futures_util::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|rows| (rows, subscription))
        })
    }
}

/// Replays the log into `state`. Returns false when the tail has to be
/// rewritten before appending: a torn final record was dropped or the last
/// record lacks its newline.
fn replay_log(path: &Path, file: File, state: &mut CacheState) -> Result<bool, StoreError> {
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    loop {
        let mut line = Vec::new();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|source| StoreError::io_line(path, lines.len() + 1, source))?;
        if read == 0 {
            break;
        }
        lines.push(line);
    }
    let last_line = lines.len();
    let mut clean = lines.last().map_or(true, |line| line.ends_with(b"\n"));

    for (index, line) in lines.iter().enumerate() {
        let line_number = index + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let record = match serde_json::from_slice::<MessageRecord>(line) {
            Ok(record) => record,
            Err(source) if line_number == last_line => {
                warn!(path = %path.display(), line = line_number, error = %source, "dropping torn message log tail");
                clean = false;
                continue;
            }
            Err(source) => return Err(StoreError::json_line(path, line_number, source)),
        };

        if let MessageRecord::Upsert { message } = &record {
            if message.id.trim().is_empty() {
                return Err(StoreError::EmptyMessageId {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            }
        }

        state.apply(record);
        state.log_records += 1;
    }

    Ok(clean)
}

fn compact_log(path: &Path, state: &mut CacheState) -> Result<(), StoreError> {
    let mut rows = state.rows.values().collect::<Vec<_>>();
    rows.sort_by_key(|row| row.seq);

    let mut bytes = Vec::new();
    for row in &rows {
        let record = MessageRecord::Upsert {
            message: row.message.clone(),
        };
        serde_json::to_writer(&mut bytes, &record)
            .map_err(|source| StoreError::json_serialize(path, source))?;
        bytes.push(b'\n');
    }

    write_atomic(path, &bytes)?;
    state.log_len = bytes.len() as u64;
    debug!(
        path = %path.display(),
        before = state.log_records,
        after = rows.len(),
        "compacted message log"
    );
    state.log_records = rows.len();
    Ok(())
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|source| StoreError::io("creating store directory", parent, source))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StoreError::io("opening message log for append", path, source))
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use super::MessageCache;
    use crate::persist::lock_unpoisoned;
    use crate::schema::ChatMessage;

    #[test]
    fn a_failed_append_never_leaves_bytes_before_the_next_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("messages.jsonl");
        let cache = MessageCache::open(&path).expect("open");
        cache
            .upsert(ChatMessage::user("u-1", "s", "first", 1))
            .expect("upsert u-1");

        // Leave the state a half-written append would: stray bytes past the
        // last complete record.
        OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen log")
            .write_all(b"{\"type\":\"ups")
            .expect("write partial record");
        lock_unpoisoned(&cache.state).tail_dirty = true;

        cache
            .upsert(ChatMessage::user("u-2", "s", "second", 2))
            .expect("upsert u-2");
        drop(cache);

        let reopened = MessageCache::open(&path).expect("log replays cleanly");
        let ids = reopened
            .messages("s")
            .into_iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["u-1".to_string(), "u-2".to_string()]);
    }

    #[test]
    fn torn_tail_is_rewritten_before_new_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("messages.jsonl");
        {
            let cache = MessageCache::open(&path).expect("open");
            cache
                .upsert(ChatMessage::user("u-1", "s", "first", 1))
                .expect("upsert u-1");
        }
        OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen log")
            .write_all(b"{\"type\":\"upsert\",\"message\":{\"id\":\"u-")
            .expect("write torn record");

        {
            let cache = MessageCache::open(&path).expect("torn tail is tolerated");
            cache
                .upsert(ChatMessage::user("u-2", "s", "second", 2))
                .expect("upsert after torn tail");
        }

        let reopened = MessageCache::open(&path).expect("second reopen");
        let ids = reopened
            .messages("s")
            .into_iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["u-1".to_string(), "u-2".to_string()]);
    }

    #[test]
    fn rows_with_equal_timestamps_keep_insertion_order() {
        let cache = MessageCache::in_memory();
        cache
            .upsert(ChatMessage::user("b", "s", "first", 10))
            .expect("upsert b");
        cache
            .upsert(ChatMessage::placeholder("a", "s", 10))
            .expect("upsert a");

        let ids = cache
            .messages("s")
            .into_iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn replacing_a_row_keeps_its_original_position() {
        let cache = MessageCache::in_memory();
        cache
            .upsert(ChatMessage::user("u", "s", "hi", 5))
            .expect("upsert u");
        cache
            .upsert(ChatMessage::placeholder("p", "s", 5))
            .expect("upsert p");

        let mut user = cache.get("u").expect("user row");
        user.server_id = Some("srv-u".to_string());
        cache.upsert(user).expect("replace u");

        let ids = cache
            .messages("s")
            .into_iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["u".to_string(), "p".to_string()]);
    }

    #[test]
    fn empty_ids_are_rejected() {
        let cache = MessageCache::in_memory();
        assert!(cache.upsert(ChatMessage::user(" ", "s", "x", 1)).is_err());
    }

    #[test]
    fn failed_session_delete_keeps_rows_and_the_log_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("messages.jsonl");
        let cache = MessageCache::open(&path).expect("open");
        cache
            .upsert(ChatMessage::user("u-1", "s", "first", 1))
            .expect("upsert u-1");

        let read_only = std::fs::File::open(&path).expect("read-only handle");
        lock_unpoisoned(&cache.state).log = Some(read_only);
        assert!(cache.delete_all("s").is_err());
        assert_eq!(cache.messages("s").len(), 1);

        lock_unpoisoned(&cache.state).log = Some(super::open_append(&path).expect("append handle"));
        cache
            .upsert(ChatMessage::user("u-2", "s", "second", 2))
            .expect("upsert u-2");
        assert_eq!(cache.delete_all("s").expect("delete"), 2);
        drop(cache);

        let reopened = MessageCache::open(&path).expect("reopen");
        assert!(reopened.messages("s").is_empty());
    }
}
