// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event source adapter.
//!
//! Wraps the platform event queue into typed events. Shutdown and cancel
//! requests are classified here so that controllers only ever see a
//! [`CancellationToken`] or [`ExplorerError::Shutdown`].

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::bluetooth::{ConnCompletion, InquiryStatus, PlatformEvent, UserInput};
use crate::error::{ExplorerError, Result};

/// Kind of domain event a caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Inquiry,
    Connection,
    Command,
}

/// Domain event returned by [`EventSource::poll_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Inquiry(InquiryStatus),
    Connection(ConnCompletion),
    Command(String),
}

impl Event {
    fn kind(&self) -> EventKind {
        match self {
            Event::Inquiry(_) => EventKind::Inquiry,
            Event::Connection(_) => EventKind::Connection,
            Event::Command(_) => EventKind::Command,
        }
    }
}

/// Producer side of the platform queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl EventSink {
    /// Push a raw event. Events sent after the source is gone are dropped.
    pub fn push(&self, event: PlatformEvent) {
        let _ = self.tx.send(event);
    }

    pub fn inquiry_status(&self, code: i32) {
        self.push(PlatformEvent::Inquiry(code));
    }

    pub fn completion(&self, completion: ConnCompletion) {
        self.push(PlatformEvent::Connection(completion));
    }

    pub fn cancel(&self) {
        self.push(PlatformEvent::Input(UserInput::Cancel));
    }

    /// Close the open session. Same input as a cancel.
    pub fn close_session(&self) {
        self.cancel();
    }

    pub fn shutdown(&self) {
        self.push(PlatformEvent::Close);
    }

    pub fn command(&self, command: impl Into<String>) {
        self.push(PlatformEvent::Input(UserInput::Command(command.into())));
    }
}

/// Consumer side of the platform queue.
pub struct EventSource {
    rx: mpsc::UnboundedReceiver<PlatformEvent>,
    pending: VecDeque<PlatformEvent>,
    cancel: CancellationToken,
    shutdown: bool,
}

impl EventSource {
    /// Create a connected sink/source pair.
    pub fn channel() -> (EventSink, EventSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = EventSource {
            rx,
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
            shutdown: false,
        };
        (EventSink { tx }, source)
    }

    /// Hand radio ownership to a new operation and return its cancel token.
    pub fn begin_operation(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    /// Sleep until at least one raw event is queued. Does not consume it.
    pub async fn wait(&mut self) -> Result<()> {
        if self.shutdown {
            return Err(ExplorerError::Shutdown);
        }
        if !self.pending.is_empty() {
            return Ok(());
        }
        match self.rx.recv().await {
            Some(event) => {
                self.pending.push_back(event);
                Ok(())
            }
            None => {
                info!("Platform event queue closed");
                self.shutdown = true;
                Err(ExplorerError::Shutdown)
            }
        }
    }

    /// Return the next queued event of `kind`, without blocking.
    pub fn poll_next(&mut self, kind: EventKind) -> Result<Option<Event>> {
        if self.shutdown {
            return Err(ExplorerError::Shutdown);
        }

        while let Some(raw) = self.next_raw() {
            let event = match raw {
                PlatformEvent::Close | PlatformEvent::Input(UserInput::Exit) => {
                    info!("Shutdown requested");
                    self.shutdown = true;
                    return Err(ExplorerError::Shutdown);
                }
                PlatformEvent::Input(UserInput::Cancel) => {
                    debug!("Cancel requested");
                    self.cancel.cancel();
                    continue;
                }
                PlatformEvent::Input(UserInput::Command(cmd)) => Event::Command(cmd),
                PlatformEvent::Inquiry(code) => Event::Inquiry(InquiryStatus::from_code(code)),
                PlatformEvent::Connection(completion) => Event::Connection(completion),
            };

            if event.kind() == kind {
                return Ok(Some(event));
            }
            trace!("Dropping unrelated event: {:?}", event);
        }

        Ok(None)
    }

    /// Discard everything queued, still honouring a shutdown request.
    pub fn clear(&mut self) -> Result<()> {
        while let Some(raw) = self.next_raw() {
            if matches!(raw, PlatformEvent::Close | PlatformEvent::Input(UserInput::Exit)) {
                self.shutdown = true;
                return Err(ExplorerError::Shutdown);
            }
        }
        Ok(())
    }

    fn next_raw(&mut self) -> Option<PlatformEvent> {
        self.pending
            .pop_front()
            .or_else(|| self.rx.try_recv().ok())
    }
}
