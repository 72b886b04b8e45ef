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

//! RFCOMM stream session.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::radio::{codes, ConnCompletion, ConnHandle, ConnOp, RadioStack};
use super::types::{Device, Service};
use crate::error::{ExplorerError, Result};
use crate::events::{Event, EventKind, EventSource};

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Receives the bytes of an open session.
pub trait SessionSink {
    /// One completed read, verbatim.
    fn record(&mut self, data: &[u8]);
}

impl SessionSink for Vec<u8> {
    fn record(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

/// State of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed(i32),
}

/// How a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user asked to close.
    ClosedByUser,
    /// The peer closed the stream.
    ClosedByPeer,
    /// A read failed.
    Failed { code: i32 },
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub bytes_received: usize,
    pub reads: usize,
}

/// One (device, service) stream.
struct Session {
    handle: ConnHandle,
    state: SessionState,
    bytes_received: usize,
    reads: usize,
}

impl Session {
    /// Issue the close exactly once.
    fn request_close<R: RadioStack>(&mut self, radio: &mut R) {
        if self.state == SessionState::Closing {
            return;
        }
        info!("Closing connection...");
        radio.close(self.handle);
        self.state = SessionState::Closing;
    }

    fn closing(&self) -> bool {
        self.state == SessionState::Closing
    }

    fn report(&self, end: SessionEnd) -> SessionReport {
        SessionReport {
            end,
            bytes_received: self.bytes_received,
            reads: self.reads,
        }
    }

    fn check_completion(&self, completion: &ConnCompletion, op: ConnOp) {
        assert_eq!(
            completion.handle, self.handle,
            "completion for handle {:?} while awaiting {:?}",
            completion.handle, self.handle
        );
        assert_eq!(
            completion.op, op,
            "completion for {:?} while awaiting {:?}",
            completion.op, op
        );
        assert_ne!(completion.result, 0, "zero result for {:?}", op);
        assert!(
            op != ConnOp::Read || completion.result < 0 || completion.buffer.is_some(),
            "read of {} bytes completed without a buffer",
            completion.result
        );
    }
}

/// Opens sessions and runs their read loop.
pub struct SessionManager {
    read_buffer_size: usize,
    state: SessionState,
}

impl SessionManager {
    pub fn new(read_buffer_size: usize) -> Self {
        Self {
            read_buffer_size: read_buffer_size.max(1),
            state: SessionState::Idle,
        }
    }

    /// State of the current or last session.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect to `service` on `device` and stream into `sink` until the
    /// stream is closed or fails.
    ///
    /// A tripped `cancel` token is a close request.
    pub async fn run<R, K>(
        &mut self,
        radio: &mut R,
        events: &mut EventSource,
        device: &Device,
        service: &Service,
        cancel: &CancellationToken,
        sink: &mut K,
    ) -> Result<SessionReport>
    where
        R: RadioStack,
        K: SessionSink + ?Sized,
    {
        let address = device.address;
        let channel = service.channel;
        let connect_error = |code| ExplorerError::Connect {
            address,
            channel,
            code,
        };

        info!("Connecting to {} channel {}...", address, channel);
        let handle = match radio.connect(address, channel) {
            Ok(handle) => handle,
            Err(code) => {
                error!("Connect rejected: {}", code.0);
                self.state = SessionState::Failed(code.0);
                return Err(connect_error(code.0));
            }
        };

        let mut session = Session {
            handle,
            state: SessionState::Connecting,
            bytes_received: 0,
            reads: 0,
        };
        self.state = session.state;

        let result = self
            .await_completion(radio, events, &mut session, ConnOp::Connect, cancel)
            .await;
        let completion = match result {
            Ok(completion) => completion,
            Err(e) => return Err(self.abort(radio, &mut session, e)),
        };

        if session.closing() {
            // Close was requested while connecting.
            self.state = SessionState::Closed;
            return Ok(session.report(SessionEnd::ClosedByUser));
        }

        if completion.result < 0 {
            error!("Connect failed: {}", completion.result);
            radio.close(handle);
            self.state = SessionState::Failed(completion.result);
            return Err(connect_error(completion.result));
        }

        session.state = SessionState::Connected;
        self.state = session.state;
        info!("Connected to {} channel {}", address, channel);

        loop {
            if session.closing() {
                // The close raced the last read; nothing is outstanding.
                self.state = SessionState::Closed;
                return Ok(session.report(SessionEnd::ClosedByUser));
            }

            let buffer = Vec::with_capacity(self.read_buffer_size);
            if let Err(code) = radio.read(handle, buffer) {
                error!("Read rejected: {}", code.0);
                return Ok(self.finish_failed(radio, &mut session, code.0));
            }

            let result = self
                .await_completion(radio, events, &mut session, ConnOp::Read, cancel)
                .await;
            let completion = match result {
                Ok(completion) => completion,
                Err(e) => return Err(self.abort(radio, &mut session, e)),
            };

            if completion.result < 0 {
                if session.closing() {
                    info!("Connection closed");
                    self.state = SessionState::Closed;
                    return Ok(session.report(SessionEnd::ClosedByUser));
                }
                if completion.result == codes::CLOSED {
                    info!("Connection closed by peer");
                    radio.close(handle);
                    self.state = SessionState::Closed;
                    return Ok(session.report(SessionEnd::ClosedByPeer));
                }
                error!("Read failed: {}", completion.result);
                return Ok(self.finish_failed(radio, &mut session, completion.result));
            }

            let len = completion.result as usize;
            let data = completion.buffer.unwrap_or_default();
            let data = &data[..len.min(data.len())];

            session.reads += 1;
            session.bytes_received += data.len();
            sink.record(data);
            debug!(
                target: "rfcomm_explorer::stream",
                "{}",
                String::from_utf8_lossy(data).trim_end()
            );
        }
    }

    /// Wait for the completion of `op`, handling close requests meanwhile.
    async fn await_completion<R: RadioStack>(
        &mut self,
        radio: &mut R,
        events: &mut EventSource,
        session: &mut Session,
        op: ConnOp,
        cancel: &CancellationToken,
    ) -> Result<ConnCompletion> {
        loop {
            events.wait().await?;
            loop {
                let event = events.poll_next(EventKind::Connection)?;
                if cancel.is_cancelled() && !session.closing() {
                    session.request_close(radio);
                    self.state = session.state;
                }
                match event {
                    Some(Event::Connection(completion)) => {
                        session.check_completion(&completion, op);
                        return Ok(completion);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    fn finish_failed<R: RadioStack>(
        &mut self,
        radio: &mut R,
        session: &mut Session,
        code: i32,
    ) -> SessionReport {
        if !session.closing() {
            radio.close(session.handle);
            info!("Connection closed");
        }
        self.state = SessionState::Failed(code);
        session.report(SessionEnd::Failed { code })
    }

    /// Release the handle on shutdown.
    fn abort<R: RadioStack>(
        &mut self,
        radio: &mut R,
        session: &mut Session,
        e: ExplorerError,
    ) -> ExplorerError {
        if !session.closing() {
            radio.close(session.handle);
        }
        self.state = SessionState::Closed;
        e
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BUFFER)
    }
}
