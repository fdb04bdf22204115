// SPDX-License-Identifier: Apache-2.0

//! Batches events from the harvesters into payloads for the publisher.
//!
//! A batch is flushed when it reaches `spool size` events, when the next event
//! would take it past `spool max bytes`, when `spool timeout` expires, or when
//! a `None` flush request arrives on the input.

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::config::{Config, GeneralConfig};
use crate::errors::{Error, Result};
use crate::event::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Encoded size of an event plus its length header.
pub fn event_size(event: &Event) -> usize {
    event.encoded_len() + 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    size: usize,
    max_bytes: usize,
    timeout: Duration,
}

impl From<&GeneralConfig> for Limits {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            size: general.spool_size,
            max_bytes: general.spool_max_bytes as usize,
            timeout: general.spool_timeout,
        }
    }
}

pub struct Spooler {
    input: BoundedReceiver<Option<Event>>,
    output: BoundedSender<Vec<Event>>,
    config: watch::Receiver<Arc<Config>>,
    limits: Limits,
    spool: Vec<Event>,
    spool_bytes: usize,
}

impl Spooler {
    pub fn new(
        input: BoundedReceiver<Option<Event>>,
        output: BoundedSender<Vec<Event>>,
        config: watch::Receiver<Arc<Config>>,
    ) -> Self {
        let limits = Limits::from(&config.borrow().general);
        Self {
            input,
            output,
            config,
            limits,
            spool: Vec::with_capacity(limits.size),
            spool_bytes: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let timer = tokio::time::sleep(self.limits.timeout);
        tokio::pin!(timer);
        let mut config_open = true;

        debug!("Spooler started");
        let result = loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Spooler cancelled");
                    break Ok(());
                }

                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let limits = Limits::from(&self.config.borrow_and_update().general);
                    self.limits = limits;
                    if self.spool.len() >= limits.size || self.spool_bytes > limits.max_bytes {
                        if let Err(e) = self.flush().await {
                            break Err(e);
                        }
                    }
                    timer.as_mut().reset(Instant::now() + limits.timeout);
                }

                item = self.input.next() => {
                    match item {
                        Some(Some(event)) => {
                            let flushed = match self.add(event).await {
                                Ok(flushed) => flushed,
                                Err(e) => break Err(e),
                            };
                            if flushed {
                                timer.as_mut().reset(Instant::now() + self.limits.timeout);
                            }
                        }
                        Some(None) => {
                            if let Err(e) = self.flush().await {
                                break Err(e);
                            }
                            timer.as_mut().reset(Instant::now() + self.limits.timeout);
                        }
                        None => {
                            debug!("Spooler input closed");
                            break self.flush().await;
                        }
                    }
                }

                _ = &mut timer => {
                    if !self.spool.is_empty() {
                        debug!(events = self.spool.len(), "Spooler timeout reached, flushing");
                    }
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                    timer.as_mut().reset(Instant::now() + self.limits.timeout);
                }
            }
        };

        if !self.spool.is_empty() {
            let events = std::mem::take(&mut self.spool);
            let count = events.len();
            match self.output.try_send(events) {
                Ok(()) => debug!(events = count, "Flushed final partial spool"),
                Err(e) => warn!(events = count, error = %e, "Discarding partial spool on shutdown"),
            }
        }

        info!("Spooler exiting");
        result
    }

    /// Queues an event, flushing first if it would not fit. Returns whether a
    /// flush happened.
    async fn add(&mut self, event: Event) -> Result<bool> {
        let size = event_size(&event);
        let mut flushed = false;

        if !self.spool.is_empty() && self.spool_bytes + size > self.limits.max_bytes {
            self.flush().await?;
            flushed = true;
        }

        self.spool.push(event);
        self.spool_bytes += size;

        if self.spool.len() >= self.limits.size {
            self.flush().await?;
            flushed = true;
        }
        Ok(flushed)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.spool.is_empty() {
            return Ok(());
        }

        let events = std::mem::replace(&mut self.spool, Vec::with_capacity(self.limits.size));
        debug!(events = events.len(), bytes = self.spool_bytes, "Spooler flushing");
        self.spool_bytes = 0;

        self.output.send(events).await.map_err(|_| Error::ChannelSend)
    }
}
