// SPDX-License-Identifier: Apache-2.0

//! Owns the persisted offsets.
//!
//! The prospector reports discovered, renamed and deleted files and the
//! publisher reports acknowledged events, both through an [`EventSpool`]. The
//! registrar applies each batch to its state and writes the state file. It
//! exits once every spool has been dropped, writing the state one last time.

pub mod state;

pub use state::{FileState, PersistedIdentity, PersistedState, StateFile, StateMap};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::errors::{Error, Result};
use crate::event::{EventContext, StreamKey};
use crate::harvester::FileId;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::select;
use tracing::{debug, error, info, warn};

const PERSIST_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarEvent {
    /// A file is now tracked, starting at `offset`.
    Discover {
        key: StreamKey,
        path: String,
        offset: i64,
        id: FileId,
    },
    Rename {
        key: StreamKey,
        path: String,
    },
    Delete {
        key: StreamKey,
    },
    /// Events the remote end has acknowledged, in the order they were sent.
    Ack(Vec<EventContext>),
}

/// Client handle for sending events to the registrar. Events are collected
/// locally and delivered as one batch by [`EventSpool::send`].
pub struct EventSpool {
    tx: BoundedSender<Vec<RegistrarEvent>>,
    events: Vec<RegistrarEvent>,
}

impl EventSpool {
    pub fn add(&mut self, event: RegistrarEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub async fn send(&mut self) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.events);
        self.tx.send(events).await.map_err(|_| Error::ChannelSend)
    }
}

impl Clone for EventSpool {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            events: Vec::new(),
        }
    }
}

pub struct Registrar {
    rx: BoundedReceiver<Vec<RegistrarEvent>>,
    tx: Option<BoundedSender<Vec<RegistrarEvent>>>,
    state_file: Option<StateFile>,
    states: HashMap<StreamKey, PersistedState>,
    dirty: bool,
}

impl Registrar {
    pub fn new(persist_dir: impl AsRef<Path>) -> Self {
        Self::build(Some(StateFile::new(persist_dir)))
    }

    /// Registrar that tracks nothing on disk, used when reading stdin.
    pub fn without_persistence() -> Self {
        Self::build(None)
    }

    fn build(state_file: Option<StateFile>) -> Self {
        let (tx, rx) = bounded(CHANNEL_SIZE);
        Self {
            rx,
            tx: Some(tx),
            state_file,
            states: HashMap::new(),
            dirty: false,
        }
    }

    /// Registers a client. Must be called before [`Registrar::run`].
    pub fn connect(&self) -> Option<EventSpool> {
        self.tx.as_ref().map(|tx| EventSpool {
            tx: tx.clone(),
            events: Vec::new(),
        })
    }

    /// Loads the state file and lets the caller assign a stream key to each
    /// entry. Returns whether any previous state existed.
    pub fn load_previous<F>(&mut self, mut callback: F) -> Result<bool>
    where
        F: FnMut(&str, &PersistedState) -> StreamKey,
    {
        let Some(state_file) = &self.state_file else {
            return Ok(false);
        };

        let Some(states) = state_file.load()? else {
            info!(path = %state_file.path().display(), "No previous state file found");
            return Ok(false);
        };

        info!(
            path = %state_file.path().display(),
            files = states.len(),
            "Loaded previous state"
        );
        for (path, state) in states {
            let key = callback(&path, &state);
            self.states.insert(key, state);
        }
        Ok(true)
    }

    pub async fn run(mut self) -> Result<()> {
        // From here on only clients hold senders.
        self.tx.take();

        let mut retry = tokio::time::interval(PERSIST_RETRY_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Registrar started");
        loop {
            select! {
                batch = self.rx.next() => {
                    match batch {
                        Some(events) => {
                            for event in events {
                                self.process(event);
                            }
                            self.persist();
                        }
                        None => break,
                    }
                }
                _ = retry.tick() => {
                    self.persist();
                }
            }
        }

        self.persist();
        info!("Registrar exiting");
        Ok(())
    }

    fn process(&mut self, event: RegistrarEvent) {
        match event {
            RegistrarEvent::Discover {
                key,
                path,
                offset,
                id,
            } => {
                debug!(stream = %key, path = %path, offset, "Registrar received discover");
                self.states
                    .insert(key, PersistedState::new(path, offset, id));
            }
            RegistrarEvent::Rename { key, path } => match self.states.get_mut(&key) {
                Some(state) => {
                    debug!(stream = %key, from = %state.source, to = %path, "Registrar received rename");
                    state.source = path;
                }
                None => warn!(stream = %key, path = %path, "Rename for unknown stream"),
            },
            RegistrarEvent::Delete { key } => {
                if let Some(state) = self.states.remove(&key) {
                    debug!(stream = %key, path = %state.source, "Registrar received delete");
                }
            }
            RegistrarEvent::Ack(contexts) => {
                for context in contexts {
                    let Some(state) = self.states.get_mut(&context.stream) else {
                        continue;
                    };
                    if context.end_offset < state.state.offset {
                        warn!(
                            path = %state.source,
                            current = state.state.offset,
                            acked = context.end_offset,
                            "Acknowledged offset is behind the persisted offset"
                        );
                    }
                    state.state.offset = context.end_offset;
                }
            }
        }
        self.dirty = true;
    }

    fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(state_file) = &self.state_file else {
            self.dirty = false;
            return;
        };

        let states: StateMap = self
            .states
            .values()
            .map(|state| (state.source.clone(), state.clone()))
            .collect();

        match state_file.save(&states) {
            Ok(()) => self.dirty = false,
            Err(e) => error!(error = %e, "Failed to write state file, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context(key: u64, end_offset: i64) -> EventContext {
        EventContext {
            stream: StreamKey::new(key),
            end_offset,
        }
    }

    async fn run_with(dir: &Path, batches: Vec<Vec<RegistrarEvent>>) -> StateMap {
        let registrar = Registrar::new(dir);
        let mut spool = registrar.connect().unwrap();
        let task = tokio::spawn(registrar.run());

        for batch in batches {
            for event in batch {
                spool.add(event);
            }
            spool.send().await.unwrap();
        }
        drop(spool);

        task.await.unwrap().unwrap();
        StateFile::new(dir).load().unwrap().unwrap_or_default()
    }

    fn discover(key: u64, path: &str, offset: i64) -> RegistrarEvent {
        RegistrarEvent::Discover {
            key: StreamKey::new(key),
            path: path.to_string(),
            offset,
            id: FileId::new(1, key),
        }
    }

    #[tokio::test]
    async fn discover_then_ack_persists_offset() {
        let dir = tempfile::tempdir().unwrap();
        let states = run_with(
            dir.path(),
            vec![
                vec![discover(1, "/x.log", 0)],
                vec![RegistrarEvent::Ack(vec![context(1, 2), context(1, 4)])],
            ],
        )
        .await;

        assert_eq!(4, states["/x.log"].offset());
        assert_eq!(FileId::new(1, 1), states["/x.log"].file_id());
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let states = run_with(
            dir.path(),
            vec![
                vec![discover(1, "/x.log", 10), discover(2, "/y.log", 0)],
                vec![
                    RegistrarEvent::Rename {
                        key: StreamKey::new(1),
                        path: "/x.log.1".to_string(),
                    },
                    RegistrarEvent::Delete {
                        key: StreamKey::new(2),
                    },
                ],
            ],
        )
        .await;

        assert_eq!(1, states.len());
        assert_eq!("/x.log.1", states["/x.log.1"].source);
        assert_eq!(10, states["/x.log.1"].offset());
    }

    #[tokio::test]
    async fn backwards_and_unknown_acks() {
        let dir = tempfile::tempdir().unwrap();
        let states = run_with(
            dir.path(),
            vec![
                vec![discover(1, "/x.log", 100)],
                vec![RegistrarEvent::Ack(vec![context(1, 50), context(9, 500)])],
            ],
        )
        .await;

        assert_eq!(1, states.len());
        assert_eq!(50, states["/x.log"].offset());
    }

    #[tokio::test]
    async fn previous_state_is_loaded_with_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        run_with(dir.path(), vec![vec![discover(1, "/x.log", 42)]]).await;

        let mut registrar = Registrar::new(dir.path());
        let mut seen: Vec<(PathBuf, i64)> = Vec::new();
        let loaded = registrar
            .load_previous(|path, state| {
                seen.push((PathBuf::from(path), state.offset()));
                StreamKey::new(77)
            })
            .unwrap();
        assert!(loaded);
        assert_eq!(vec![(PathBuf::from("/x.log"), 42)], seen);

        let mut spool = registrar.connect().unwrap();
        let task = tokio::spawn(registrar.run());
        spool.add(RegistrarEvent::Ack(vec![context(77, 84)]));
        spool.send().await.unwrap();
        drop(spool);
        task.await.unwrap().unwrap();

        let states = StateFile::new(dir.path()).load().unwrap().unwrap();
        assert_eq!(84, states["/x.log"].offset());
    }

    #[tokio::test]
    async fn without_persistence_writes_nothing() {
        let registrar = Registrar::without_persistence();
        let mut spool = registrar.connect().unwrap();
        let task = tokio::spawn(registrar.run());

        spool.add(RegistrarEvent::Ack(vec![context(1, 10)]));
        spool.send().await.unwrap();
        drop(spool);

        task.await.unwrap().unwrap();
    }
}
