// SPDX-License-Identifier: Apache-2.0

//! File discovery.
//!
//! Every prospect interval the configured globs are expanded and each match
//! is compared with what is already tracked. New files get a harvester,
//! renamed files keep theirs, rotated paths start a fresh one, and entries
//! whose path has gone are reported deleted and freed once their harvester
//! has wound down.

mod info;

pub use info::{Orphaned, ProspectError, ProspectorInfo, Status};

use crate::admin::{DataEntry, KeyValue, Node, Value as ApiValue};
use crate::bounded_channel::BoundedSender;
use crate::config::{Config, FileConfig, GeneralConfig, StreamConfig};
use crate::errors::{Error, Result};
use crate::event::{Event, StreamKey};
use crate::harvester::{FileStat, Harvester, HarvesterHandle, Source};
use crate::registrar::{EventSpool, Registrar, RegistrarEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct State {
    infos: HashMap<StreamKey, ProspectorInfo>,
    /// Current path of every non-orphaned entry.
    index: HashMap<PathBuf, StreamKey>,
}

enum Lookup {
    None,
    /// Another path with the same identity was already seen this scan.
    Duplicate(PathBuf),
    Renamed(PathBuf, ProspectorInfo),
}

pub struct Prospector {
    state: Arc<RwLock<State>>,
    config_rx: watch::Receiver<Arc<Config>>,
    general: Arc<GeneralConfig>,
    files: Vec<FileConfig>,
    streams: Vec<Arc<StreamConfig>>,
    registrar: EventSpool,
    spool: BoundedSender<Option<Event>>,
    from_beginning: bool,
    iteration: u32,
    last_scan: SystemTime,
    next_key: u64,
    harvester_intervals: Option<(Duration, Duration)>,
}

impl Prospector {
    /// Loads previous state through `registrar`, which must not be running yet.
    pub fn new(
        registrar: &mut Registrar,
        config_rx: watch::Receiver<Arc<Config>>,
        spool: BoundedSender<Option<Event>>,
        from_beginning: bool,
    ) -> Result<Self> {
        let mut state = State::default();
        let mut next_key = 0u64;

        let have_previous = registrar.load_previous(|path, persisted| {
            next_key += 1;
            let key = StreamKey::new(next_key);
            state
                .infos
                .insert(key, ProspectorInfo::from_state(key, path, persisted));
            state.index.insert(PathBuf::from(path), key);
            key
        })?;

        let spool_handle = registrar.connect().ok_or(Error::Shutdown)?;
        let config = config_rx.borrow().clone();

        let mut prospector = Self {
            state: Arc::new(RwLock::new(state)),
            config_rx,
            general: Arc::new(config.general.clone()),
            files: Vec::new(),
            streams: Vec::new(),
            registrar: spool_handle,
            spool,
            // Files discovered after a previous run must be read whole.
            from_beginning: from_beginning || have_previous,
            iteration: 0,
            last_scan: SystemTime::UNIX_EPOCH,
            next_key,
            harvester_intervals: None,
        };
        prospector.apply_config(&config);
        Ok(prospector)
    }

    /// Overrides the harvesters' stat interval and EOF backoff.
    pub fn with_harvester_intervals(mut self, stat_interval: Duration, eof_backoff: Duration) -> Self {
        self.harvester_intervals = Some((stat_interval, eof_backoff));
        self
    }

    fn apply_config(&mut self, config: &Config) {
        self.general = Arc::new(config.general.clone());
        self.files = config.files.clone();
        self.streams = config
            .files
            .iter()
            .map(|file| Arc::new(file.stream.clone()))
            .collect();
    }

    /// Admin branch with the `status` and `files` entries.
    pub fn admin_node(&self) -> Node {
        let node = Node::new();

        let state = self.state.clone();
        node.set_entry(
            "status",
            Arc::new(DataEntry::new(move || {
                let state = state.read().unwrap();
                KeyValue::new()
                    .with("watched_files", ApiValue::Number(state.index.len() as i64))
                    .with("active_states", ApiValue::Number(state.infos.len() as i64))
                    .into()
            })),
        );

        let state = self.state.clone();
        node.set_entry(
            "files",
            Arc::new(DataEntry::new(move || {
                files_snapshot(&state.read().unwrap()).into()
            })),
        );
        node
    }

    /// Metrics of every running harvester, keyed by path.
    pub fn harvesters_entry(&self) -> DataEntry {
        let state = self.state.clone();
        DataEntry::new(move || {
            let state = state.read().unwrap();
            let mut running: Vec<&ProspectorInfo> = state
                .infos
                .values()
                .filter(|info| info.harvester().is_some())
                .collect();
            running.sort_by(|a, b| a.path.cmp(&b.path));

            let mut harvesters = KeyValue::new();
            for info in running {
                if let Some(harvester) = info.harvester() {
                    harvesters.set(&info.path.display().to_string(), harvester.snapshot());
                }
            }
            harvesters.into()
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut config_open = true;

        info!(interval = ?self.general.prospect_interval, "Prospector started");
        'scan: loop {
            self.scan_once().await?;

            let deadline = Instant::now() + self.general.prospect_interval;
            loop {
                select! {
                    biased;

                    _ = cancel.cancelled() => break 'scan,

                    changed = self.config_rx.changed(), if config_open => {
                        if changed.is_err() {
                            config_open = false;
                            continue;
                        }
                        let config = self.config_rx.borrow_and_update().clone();
                        self.apply_config(&config);
                        info!("Prospector configuration reloaded");
                    }

                    _ = sleep_until(deadline) => break,
                }
            }
        }

        self.shutdown().await;
        info!("Prospector exiting");
        Ok(())
    }

    async fn shutdown(&mut self) {
        let mut handles: Vec<(StreamKey, HarvesterHandle)> = {
            let mut state = self.state.write().unwrap();
            state
                .infos
                .iter_mut()
                .filter_map(|(key, info)| {
                    info.stop();
                    info.take_harvester().map(|h| (*key, h))
                })
                .collect()
        };

        debug!(harvesters = handles.len(), "Waiting for harvesters to stop");
        let mut finished = Vec::with_capacity(handles.len());
        for (key, handle) in handles.iter_mut() {
            finished.push((*key, handle.wait().await));
        }

        {
            let mut state = self.state.write().unwrap();
            for (key, finish) in finished {
                if let Some(info) = state.infos.get_mut(&key) {
                    info.set_stopped(finish);
                }
            }
        }

        if let Err(e) = self.registrar.send().await {
            warn!(error = %e, "Failed to send final registrar events");
        }
    }

    /// One scan followed by delivery of the resulting registrar events.
    pub async fn scan_once(&mut self) -> Result<()> {
        self.scan();
        self.registrar.send().await
    }

    fn scan(&mut self) {
        let scan_start = SystemTime::now();
        self.iteration = self.iteration.wrapping_add(1);

        let shared = self.state.clone();
        let mut state = shared.write().unwrap();

        for config_index in 0..self.files.len() {
            for pattern in self.files[config_index].paths.clone() {
                debug!(pattern = %pattern, "Scanning");
                let matches = match glob::glob(&pattern) {
                    Ok(matches) => matches,
                    Err(e) => {
                        error!(pattern = %pattern, error = %e, "Invalid glob");
                        continue;
                    }
                };
                for entry in matches {
                    match entry {
                        Ok(path) => self.process(&mut state, &path, config_index),
                        Err(e) => warn!(error = %e, "Glob match could not be read"),
                    }
                }
            }
        }

        self.from_beginning = true;
        self.sweep(&mut state);
        self.last_scan = scan_start;
    }

    fn process(&mut self, state: &mut State, path: &Path, config_index: usize) {
        let known = state.index.get(path).copied();
        if let Some(key) = known {
            if state.infos.get(&key).is_some_and(|i| i.seen_in(self.iteration)) {
                return;
            }
        }

        let stat = match FileStat::from_path(path) {
            Ok(stat) if stat.is_dir => Err(ProspectError::DIRECTORY),
            Ok(stat) => Ok(stat),
            Err(e) => Err(ProspectError::Stat(e.to_string())),
        };

        let stat = match stat {
            Ok(stat) => stat,
            Err(err) => {
                self.record_invalid(state, path, known, err);
                return;
            }
        };

        let dead_time = self.streams[config_index].dead_time;
        let key = match known {
            Some(key) if state.infos.get(&key).is_some_and(|i| i.status != Status::Invalid) => {
                if state.infos[&key].id == stat.id {
                    key
                } else {
                    if let Some(info) = state.infos.get_mut(&key) {
                        info.orphaned = Orphaned::Maybe;
                    }
                    match self.lookup_ids(state, path, &stat) {
                        Lookup::Duplicate(previous) => {
                            self.flag_duplicate(state, path, &previous, None);
                            return;
                        }
                        Lookup::Renamed(previous, info) => self.adopt(state, path, &previous, info),
                        Lookup::None => {
                            info!(path = %path.display(), "Launching harvester on rotated file");
                            self.discover(state, path, stat.clone(), config_index, dead_time, false)
                        }
                    }
                }
            }
            // Unknown path, or a placeholder that can be replaced now the stat succeeds.
            stub => match self.lookup_ids(state, path, &stat) {
                Lookup::Duplicate(previous) => {
                    self.flag_duplicate(state, path, &previous, stub);
                    return;
                }
                Lookup::Renamed(previous, info) => {
                    remove_stub(state, stub);
                    self.adopt(state, path, &previous, info)
                }
                Lookup::None => {
                    remove_stub(state, stub);
                    self.discover(state, path, stat.clone(), config_index, dead_time, true)
                }
            },
        };

        let Some(info) = state.infos.get_mut(&key) else {
            return;
        };

        let mut resume = !info.is_running();
        if resume {
            match info.status {
                Status::Resume => {
                    if info.finish_offset == stat.size as i64 && stat.age() > dead_time {
                        info!(path = %path.display(), ?dead_time, "Skipping file older than dead time");
                        info.status = Status::Ok;
                        resume = false;
                    } else {
                        info!(path = %path.display(), "Resuming harvester on a previously harvested file");
                    }
                }
                Status::Failed => {
                    if info.can_restart_failed() {
                        info!(path = %path.display(), "Attempting to restart failed harvester");
                    } else {
                        resume = false;
                    }
                }
                _ => {
                    let modified = info.stat.as_ref().map(|s| s.modified);
                    if modified != Some(stat.modified) {
                        info!(path = %path.display(), "Resuming harvester on an old file that was just modified");
                    } else {
                        resume = false;
                    }
                }
            }
        }

        info.update(Some(stat), self.iteration);
        if resume {
            let offset = info.finish_offset;
            self.start_harvester(info, config_index, offset);
        }
        state.index.insert(path.to_path_buf(), key);
    }

    fn record_invalid(
        &mut self,
        state: &mut State,
        path: &Path,
        known: Option<StreamKey>,
        err: ProspectError,
    ) {
        if let Some(key) = known {
            if let Some(info) = state.infos.get_mut(&key) {
                if info.status != Status::Invalid {
                    info.orphaned = Orphaned::Maybe;
                } else if info.invalid_reason() == Some(&err) {
                    info.update(None, self.iteration);
                    return;
                } else {
                    state.infos.remove(&key);
                }
            }
        }

        match &err {
            ProspectError::Skip(reason) => info!(path = %path.display(), reason, "Skipping"),
            ProspectError::Stat(e) => error!(path = %path.display(), error = %e, "Error prospecting"),
        }

        let key = self.allocate_key();
        let mut info = ProspectorInfo::invalid(key, path.to_path_buf(), err);
        info.update(None, self.iteration);
        state.infos.insert(key, info);
        state.index.insert(path.to_path_buf(), key);
    }

    /// Finds a tracked entry with the identity of `stat` under another path.
    /// A match is removed from the state and handed back for adoption.
    fn lookup_ids(&self, state: &mut State, path: &Path, stat: &FileStat) -> Lookup {
        let found = state.infos.iter().find_map(|(key, info)| {
            if info.status == Status::Invalid {
                return None;
            }
            if info.orphaned == Orphaned::No && info.path == path {
                return None;
            }
            (info.id == stat.id).then_some(*key)
        });
        let Some(key) = found else {
            return Lookup::None;
        };

        if state.infos[&key].seen_in(self.iteration) {
            return Lookup::Duplicate(state.infos[&key].path.clone());
        }

        let Some(mut info) = state.infos.remove(&key) else {
            return Lookup::None;
        };
        if info.orphaned == Orphaned::No {
            if state.index.get(&info.path) == Some(&key) {
                state.index.remove(&info.path);
            }
        } else {
            info.orphaned = Orphaned::No;
        }
        Lookup::Renamed(info.path.clone(), info)
    }

    fn adopt(
        &mut self,
        state: &mut State,
        path: &Path,
        previous: &Path,
        mut info: ProspectorInfo,
    ) -> StreamKey {
        info!(from = %previous.display(), to = %path.display(), "File rename was detected");
        info.path = path.to_path_buf();
        let key = info.key;
        self.registrar.add(RegistrarEvent::Rename {
            key,
            path: path.to_string_lossy().into_owned(),
        });
        state.infos.insert(key, info);
        key
    }

    /// Starts tracking a file never seen before. On a scan after the first, a
    /// new file that was already idle for longer than the dead time is only
    /// recorded at its current size.
    fn discover(
        &mut self,
        state: &mut State,
        path: &Path,
        stat: FileStat,
        config_index: usize,
        dead_time: Duration,
        allow_skip: bool,
    ) -> StreamKey {
        let key = self.allocate_key();
        let mut info = ProspectorInfo::from_stat(key, path.to_path_buf(), stat.clone());

        if allow_skip && stat.modified < self.last_scan && stat.age() > dead_time {
            info!(path = %path.display(), ?dead_time, "Skipping file older than dead time");
            info.finish_offset = stat.size as i64;
            self.registrar.add(RegistrarEvent::Discover {
                key,
                path: path.to_string_lossy().into_owned(),
                offset: info.finish_offset,
                id: stat.id,
            });
        } else {
            if allow_skip {
                info!(path = %path.display(), "Launching harvester on new file");
            }
            let offset = if self.from_beginning {
                0
            } else {
                stat.size as i64
            };
            self.registrar.add(RegistrarEvent::Discover {
                key,
                path: path.to_string_lossy().into_owned(),
                offset,
                id: stat.id,
            });
            self.start_harvester(&mut info, config_index, offset);
        }

        state.infos.insert(key, info);
        key
    }

    fn flag_duplicate(
        &mut self,
        state: &mut State,
        path: &Path,
        previous: &Path,
        stub: Option<StreamKey>,
    ) {
        if let Some(key) = stub {
            if let Some(info) = state.infos.get_mut(&key) {
                if info.invalid_reason() == Some(&ProspectError::DUPLICATE) {
                    info.update(None, self.iteration);
                    return;
                }
            }
            state.infos.remove(&key);
        }

        info!(path = %path.display(), original = %previous.display(), "Skipping duplicate of a file already being harvested");
        let key = self.allocate_key();
        let mut info = ProspectorInfo::invalid(key, path.to_path_buf(), ProspectError::DUPLICATE);
        info.update(None, self.iteration);
        state.infos.insert(key, info);
        state.index.insert(path.to_path_buf(), key);
    }

    fn sweep(&mut self, state: &mut State) {
        let mut freed = Vec::new();
        for (key, info) in state.infos.iter_mut() {
            if info.orphaned >= Orphaned::Maybe {
                if !info.is_running() {
                    freed.push(*key);
                }
            } else {
                if info.seen_in(self.iteration) {
                    continue;
                }
                if state.index.get(&info.path) == Some(key) {
                    state.index.remove(&info.path);
                }
                info.orphaned = Orphaned::Maybe;
            }

            if info.orphaned == Orphaned::Maybe {
                info.orphaned = Orphaned::Yes;
                if info.status != Status::Invalid {
                    info!(path = %info.path.display(), "File no longer matches, reporting deletion");
                    self.registrar.add(RegistrarEvent::Delete { key: *key });
                }
            }
        }

        for key in freed {
            state.infos.remove(&key);
        }
    }

    fn start_harvester(&self, info: &mut ProspectorInfo, config_index: usize, offset: i64) {
        let Some(stat) = info.stat.clone() else {
            return;
        };
        debug!(path = %info.path.display(), offset, "Starting harvester");

        let mut harvester = Harvester::new(
            Source::File {
                path: info.path.clone(),
                key: info.key,
                stat,
            },
            self.streams[config_index].clone(),
            self.general.clone(),
            offset,
            self.spool.clone(),
        );
        if let Some((stat_interval, eof_backoff)) = self.harvester_intervals {
            harvester = harvester.with_intervals(stat_interval, eof_backoff);
        }
        info.set_harvester(harvester.spawn());
    }

    fn allocate_key(&mut self) -> StreamKey {
        self.next_key += 1;
        StreamKey::new(self.next_key)
    }
}

fn remove_stub(state: &mut State, stub: Option<StreamKey>) {
    if let Some(key) = stub {
        state.infos.remove(&key);
    }
}

fn files_snapshot(state: &State) -> KeyValue {
    let mut infos: Vec<&ProspectorInfo> = state.infos.values().collect();
    infos.sort_by_key(|info| info.key);

    let mut files = KeyValue::new();
    for info in infos {
        files.set(&info.key.to_string(), info.snapshot());
    }
    files
}
