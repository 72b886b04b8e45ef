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

//! Poll/drain loop shared by the device and service controllers.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bluetooth::{InquiryStatus, RadioCode, RadioStack};
use crate::error::{ExplorerError, Result};
use crate::events::{Event, EventKind, EventSource};

/// Consecutive failed fetches after which an exhaustive drain gives up.
pub const MAX_FETCH_ERRORS: usize = 64;

/// How far a drain pass should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Stop at the first empty or failed fetch.
    UntilError,
    /// Skip failed fetches and stop only once the radio reports nothing left.
    Exhaust,
}

/// Run an inquiry that has already been started until the radio reports a
/// terminal status.
///
/// `drain` is called after every batch of status events. Once the status is
/// terminal it gets one final [`Drain::Exhaust`] pass so results queued just
/// before the status flip are not lost, including on failure.
pub async fn drive<R, F>(
    radio: &mut R,
    events: &mut EventSource,
    cancel: &CancellationToken,
    mut drain: F,
) -> Result<InquiryStatus>
where
    R: RadioStack,
    F: FnMut(&mut R, Drain),
{
    let mut status = InquiryStatus::InProgress;
    let mut cancel_issued = false;

    loop {
        if let Err(e) = poll_status(events, &mut status).await {
            if !cancel_issued {
                let res = radio.cancel_inquiry();
                debug!("Inquiry aborted on shutdown ({})", res);
            }
            return Err(e);
        }

        if cancel.is_cancelled() && !cancel_issued && !status.is_terminal() {
            info!("Cancelling inquiry...");
            let res = radio.cancel_inquiry();
            debug!("cancel_inquiry returned {}", res);
            cancel_issued = true;
        }

        match status {
            InquiryStatus::InProgress => drain(radio, Drain::UntilError),
            InquiryStatus::Completed | InquiryStatus::Cancelled => {
                drain(radio, Drain::Exhaust);
                return Ok(status);
            }
            InquiryStatus::Failed(code) => {
                warn!("Inquiry failed with status {}", code);
                drain(radio, Drain::Exhaust);
                return Ok(status);
            }
        }
    }
}

async fn poll_status(events: &mut EventSource, status: &mut InquiryStatus) -> Result<()> {
    events.wait().await?;
    while let Some(event) = events.poll_next(EventKind::Inquiry)? {
        if let Event::Inquiry(s) = event {
            *status = s;
        }
    }
    Ok(())
}

/// Map a start failure onto the error taxonomy.
pub fn start_error(code: RadioCode) -> ExplorerError {
    if code.is_busy() {
        ExplorerError::RadioBusy(code.0)
    } else if code.is_unavailable() {
        ExplorerError::RadioUnavailable(code.0)
    } else {
        ExplorerError::Scan(code.0)
    }
}
