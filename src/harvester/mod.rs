// SPDX-License-Identifier: Apache-2.0

//! Per-file tailer.
//!
//! A harvester reads one file (or stdin) from a starting offset, feeds every
//! line through the stream's codec chain and sends the resulting events to
//! the spooler. At EOF it backs off, periodically re-stats the file to detect
//! truncation, and stops once the file has been idle for the stream's dead
//! time. On exit it reports the offset up to which every line has been fully
//! emitted, which is where the next harvester for the file resumes.
//!
//! Harvesters do blocking file I/O, each on a dedicated thread.

pub mod identity;
pub mod line_reader;

pub use identity::{FileId, FileStat, open_shared};
pub use line_reader::{LineReader, RawLine};

use crate::admin::{DataEntry, KeyValue, Value as ApiValue};
use crate::bounded_channel::{BoundedReceiver, BoundedSender, Recv, bounded};
use crate::codecs::{EventSink, Line, Stream, StreamSource};
use crate::config::{GeneralConfig, StreamConfig};
use crate::errors::{Error, Result};
use crate::event::{Event, StreamKey};
use crate::util::calculate_speed;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EOF_BACKOFF: Duration = Duration::from_secs(1);
const STAT_INTERVAL: Duration = Duration::from_secs(10);
const METER_INTERVAL: Duration = Duration::from_secs(1);

/// What a harvester reads.
#[derive(Debug, Clone)]
pub enum Source {
    /// A file the prospector has stat'ed. The open handle must match `stat`.
    File {
        path: PathBuf,
        key: StreamKey,
        stat: FileStat,
    },
    Stdin,
}

/// Returned once a harvester exits.
#[derive(Debug)]
pub struct HarvesterFinish {
    /// Resume offset: every line before it has been emitted downstream.
    pub offset: i64,
    pub result: Result<()>,
    /// The last stat seen, used by the prospector to decide on resuming.
    pub stat: Option<FileStat>,
}

#[derive(Debug, Clone, Default)]
struct HarvesterStatus {
    offset: i64,
    line_count: u64,
    byte_count: u64,
    line_speed: f64,
    byte_speed: f64,
    last_known_size: Option<u64>,
    last_eof_offset: Option<i64>,
    stale_bytes: i64,
    codecs: KeyValue,
}

enum Input {
    File(File),
    Stdin(io::Stdin),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::File(file) => file.read(buf),
            Input::Stdin(stdin) => stdin.read(buf),
        }
    }
}

pub struct Harvester {
    source: Source,
    stream: Arc<StreamConfig>,
    general: Arc<GeneralConfig>,
    offset: i64,
    spool: BoundedSender<Option<Event>>,
    stop: BoundedReceiver<()>,
    stop_tx: Option<BoundedSender<()>>,
    status: Arc<RwLock<HarvesterStatus>>,
    stat_interval: Duration,
    eof_backoff: Duration,
    line_count: u64,
    byte_count: u64,
}

impl Harvester {
    pub fn new(
        source: Source,
        stream: Arc<StreamConfig>,
        general: Arc<GeneralConfig>,
        offset: i64,
        spool: BoundedSender<Option<Event>>,
    ) -> Self {
        let (stop_tx, stop) = bounded(1);
        Self {
            source,
            stream,
            general,
            offset,
            spool,
            stop,
            stop_tx: Some(stop_tx),
            status: Arc::new(RwLock::new(HarvesterStatus {
                offset,
                ..Default::default()
            })),
            stat_interval: STAT_INTERVAL,
            eof_backoff: EOF_BACKOFF,
            line_count: 0,
            byte_count: 0,
        }
    }

    /// Overrides how often the file is re-stat'ed at EOF and how long to sleep
    /// between EOF retries.
    pub fn with_intervals(mut self, stat_interval: Duration, eof_backoff: Duration) -> Self {
        self.stat_interval = stat_interval;
        self.eof_backoff = eof_backoff;
        self
    }

    pub fn spawn(mut self) -> HarvesterHandle {
        let stop = self.stop_tx.take();
        let status = self.status.clone();
        let start_offset = self.offset;
        let (finish_tx, finish) = bounded(1);
        let spawned = thread::Builder::new()
            .name("harvester".to_string())
            .spawn(move || {
                let _ = finish_tx.send_blocking(self.run());
            });
        if let Err(e) = spawned {
            error!(error = %e, "Failed to start harvester thread");
        }
        HarvesterHandle {
            stop,
            finish,
            status,
            start_offset,
        }
    }

    fn run(mut self) -> HarvesterFinish {
        let (input, mut last_stat) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                return HarvesterFinish {
                    offset: self.offset,
                    result: Err(e),
                    stat: None,
                };
            }
        };

        let source = match &self.source {
            Source::File { path, key, .. } => StreamSource {
                key: Some(*key),
                path: Some(path.to_string_lossy().into_owned()),
            },
            Source::Stdin => StreamSource::default(),
        };

        let spool = self.spool.clone();
        let sink: EventSink = Box::new(move |event| {
            spool
                .send_blocking(Some(event))
                .map_err(|_| Error::ChannelSend)
        });
        let mut stream = Stream::new(&self.stream, &self.general, source, self.offset, sink);

        let mut reader = LineReader::new(
            input,
            self.general.line_buffer_bytes,
            self.general.max_line_bytes,
        );

        let result = self.harvest(&mut reader, &mut stream, &mut last_stat);
        self.measure(&mut stream, Duration::ZERO, &mut MeterState::default());

        let offset = stream.close();
        match &result {
            Ok(()) => info!(source = %self.describe(), offset, "Harvester stopped"),
            Err(e) => error!(source = %self.describe(), offset, error = %e, "Harvester failed"),
        }

        HarvesterFinish {
            offset,
            result,
            stat: last_stat,
        }
    }

    fn describe(&self) -> String {
        match &self.source {
            Source::File { path, .. } => path.display().to_string(),
            Source::Stdin => "-".to_string(),
        }
    }

    fn open(&mut self) -> Result<(Input, Option<FileStat>)> {
        let (path, expected) = match &self.source {
            Source::Stdin => {
                info!("Started stdin harvester");
                return Ok((Input::Stdin(io::stdin()), None));
            }
            Source::File { path, stat, .. } => (path.clone(), stat.clone()),
        };

        let mut file = open_shared(&path)?;
        let stat = FileStat::from_file(&file)?;
        if !stat.same_file(&expected) {
            warn!(path = %path.display(), "File changed identity before it could be opened");
            return Err(Error::IdentityMismatch(path));
        }

        if self.offset as u64 > stat.size {
            warn!(
                path = %path.display(),
                offset = self.offset,
                size = stat.size,
                "File is smaller than the resume offset, assuming truncation and restarting from the beginning"
            );
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset as u64))?;
        info!(path = %path.display(), offset = self.offset, "Started harvester");

        Ok((Input::File(file), Some(stat)))
    }

    fn harvest(
        &mut self,
        reader: &mut LineReader<Input>,
        stream: &mut Stream,
        last_stat: &mut Option<FileStat>,
    ) -> Result<()> {
        let mut last_read = Instant::now();
        let mut last_stat_check = Instant::now();
        let mut last_measure = Instant::now();
        let mut meter = MeterState::default();
        // Offset at the previous check while unterminated data was buffered,
        // and the end of the data already warned about.
        let mut stale_offset: Option<i64> = None;
        let mut last_stale_offset = 0;

        loop {
            let since_measure = last_measure.elapsed();
            if since_measure >= METER_INTERVAL {
                self.measure(stream, since_measure, &mut meter);
                last_measure = Instant::now();
            }

            if self.stop.is_disconnected() {
                return Ok(());
            }

            if let Some(line) = reader.read_line()? {
                let start = self.offset;
                self.offset += line.len as i64;
                self.line_count += 1;
                self.byte_count += line.len as u64;
                last_read = Instant::now();

                stream.process_event(
                    start,
                    self.offset,
                    Line {
                        data: line.text,
                        split: line.split,
                    },
                )?;
                continue;
            }

            // EOF
            let buffered = reader.buffered_len() as i64;
            let Input::File(file) = reader.get_mut() else {
                return Ok(());
            };

            if last_stat_check.elapsed() >= self.stat_interval {
                last_stat_check = Instant::now();

                if buffered != 0 {
                    if stale_offset == Some(self.offset)
                        && last_stale_offset != self.offset + buffered
                    {
                        warn!(
                            source = %self.describe(),
                            bytes = buffered,
                            "Incomplete data at the end of the file has not grown since the last check, check the application is writing full lines"
                        );
                        last_stale_offset = self.offset + buffered;
                    }
                    stale_offset = Some(self.offset);
                }
                let stale_bytes = (last_stale_offset - self.offset).max(0);
                self.status.write().unwrap().stale_bytes = stale_bytes;

                let stat = FileStat::from_file(file)?;

                if (stat.size as i64) < self.offset {
                    warn!(
                        source = %self.describe(),
                        offset = self.offset,
                        size = stat.size,
                        "File truncation detected, restarting from the beginning"
                    );
                    file.seek(SeekFrom::Start(0))?;
                    self.offset = 0;
                    stale_offset = None;
                    last_stale_offset = 0;
                    reader.reset();
                    stream.reset();
                    *last_stat = Some(stat);
                    continue;
                }

                let unchanged = last_stat
                    .as_ref()
                    .is_some_and(|last| last.modified == stat.modified);
                self.status.write().unwrap().last_known_size = Some(stat.size);
                *last_stat = Some(stat);

                if unchanged && last_read.elapsed() > self.stream.dead_time {
                    info!(source = %self.describe(), "Stopping harvest as dead time was reached");
                    return Ok(());
                }
            }

            self.status.write().unwrap().last_eof_offset = Some(self.offset);

            match self.stop.recv_timeout(self.eof_backoff) {
                Recv::Timeout => {}
                Recv::Item(()) | Recv::Disconnected => return Ok(()),
            }
        }
    }

    fn measure(&self, stream: &mut Stream, elapsed: Duration, meter: &mut MeterState) {
        stream.meter();
        let codecs = stream.snapshot();

        let lines = (self.line_count - meter.line_count) as f64;
        let bytes = (self.byte_count - meter.byte_count) as f64;
        meter.line_count = self.line_count;
        meter.byte_count = self.byte_count;

        let mut status = self.status.write().unwrap();
        if !elapsed.is_zero() {
            status.line_speed =
                calculate_speed(elapsed, status.line_speed, lines, &mut meter.idle_lines);
            status.byte_speed =
                calculate_speed(elapsed, status.byte_speed, bytes, &mut meter.idle_bytes);
        }
        status.offset = self.offset;
        status.line_count = self.line_count;
        status.byte_count = self.byte_count;
        status.codecs = codecs;
        debug!(offset = self.offset, lines = self.line_count, "Harvester measured");
    }
}

#[derive(Default)]
struct MeterState {
    line_count: u64,
    byte_count: u64,
    idle_lines: u32,
    idle_bytes: u32,
}

/// Owned by the prospector for every running harvester.
pub struct HarvesterHandle {
    stop: Option<BoundedSender<()>>,
    finish: BoundedReceiver<HarvesterFinish>,
    status: Arc<RwLock<HarvesterStatus>>,
    start_offset: i64,
}

impl HarvesterHandle {
    /// Ask the harvester to stop. It finishes the line in progress first.
    pub fn stop(&mut self) {
        self.stop.take();
    }

    /// Collects the result if the harvester has exited, without waiting.
    pub fn try_finish(&mut self) -> Option<HarvesterFinish> {
        if let Some(finish) = self.finish.try_recv() {
            return Some(finish);
        }
        if self.finish.is_disconnected() {
            // The result may have landed between the two checks.
            return Some(self.finish.try_recv().unwrap_or_else(|| self.lost()));
        }
        None
    }

    /// Waits for the harvester to exit.
    pub async fn wait(&mut self) -> HarvesterFinish {
        match self.finish.next().await {
            Some(finish) => finish,
            None => self.lost(),
        }
    }

    // The harvester thread went away without reporting, i.e. it panicked or
    // never started. Codec buffers are unknown so resume where it began.
    fn lost(&self) -> HarvesterFinish {
        HarvesterFinish {
            offset: self.start_offset,
            result: Err(Error::Io(io::Error::other("harvester exited unexpectedly"))),
            stat: None,
        }
    }

    pub fn snapshot(&self) -> KeyValue {
        status_snapshot(&self.status.read().unwrap())
    }

    /// Admin entry that keeps reporting after the handle has been moved away.
    pub fn snapshot_entry(&self) -> DataEntry {
        let status = self.status.clone();
        DataEntry::new(move || status_snapshot(&status.read().unwrap()).into())
    }
}

fn status_snapshot(status: &HarvesterStatus) -> KeyValue {
    let mut snapshot = KeyValue::new()
        .with("speed_lps", ApiValue::Float(status.line_speed))
        .with("speed_bps", ApiValue::Float(status.byte_speed))
        .with("processed_lines", ApiValue::Number(status.line_count as i64))
        .with("current_offset", ApiValue::Number(status.offset))
        .with("stale_bytes", ApiValue::Number(status.stale_bytes))
        .with("codecs", status.codecs.clone());

    match status.last_known_size {
        Some(size) => {
            snapshot.set("last_known_size", ApiValue::Bytes(size));
            let completion = if size == 0 {
                100.0
            } else {
                status.offset as f64 * 100.0 / size as f64
            };
            snapshot.set("completion", ApiValue::Float(completion));
        }
        None => {
            snapshot.set("last_known_size", ApiValue::Null);
            snapshot.set("completion", ApiValue::Null);
        }
    }

    let eof = status
        .last_eof_offset
        .is_some_and(|eof| eof == status.offset);
    snapshot.set("status", if eof { "idle" } else { "alive" });
    snapshot
}
