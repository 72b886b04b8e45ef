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

//! Persistent discovery cache.

mod block;
mod codec;

pub use block::{BlockStore, FileStore};
pub use codec::{deserialize, serialize, CorruptionError};

use tracing::{info, warn};

use crate::bluetooth::Topology;
use crate::error::Result;

/// Reads and writes the topology snapshot through a [`BlockStore`].
pub struct DiscoveryStore<S: BlockStore> {
    store: S,
    name: String,
}

impl<S: BlockStore> DiscoveryStore<S> {
    pub fn new(store: S, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Load the stored topology. `Ok(None)` when nothing was stored yet.
    pub fn load(&mut self) -> Result<Option<Topology>> {
        let Some(handle) = self.store.open(&self.name, false)? else {
            info!("No stored topology '{}'", self.name);
            return Ok(None);
        };

        let read = self.store.read_all(&handle);
        self.store.close(handle, false)?;
        let blob = read?;

        let topology = deserialize(&blob)?;
        info!(
            "Loaded {} devices, {} services from store '{}'",
            topology.len(),
            topology.service_count(),
            self.name
        );
        Ok(Some(topology))
    }

    /// Replace the stored topology.
    pub fn save(&mut self, topology: &Topology) -> Result<()> {
        let blob = serialize(topology);
        let handle = self
            .store
            .open(&self.name, true)?
            .ok_or_else(|| std::io::Error::other(format!("store '{}' not created", self.name)))?;

        let written = self.store.write_all(&handle, &blob);
        self.store.close(handle, false)?;
        written?;

        info!(
            "Stored {} devices ({} bytes) in '{}'",
            topology.len(),
            blob.len(),
            self.name
        );
        Ok(())
    }

    /// Delete the stored topology, if any.
    pub fn erase(&mut self) -> Result<()> {
        match self.store.open(&self.name, false)? {
            Some(handle) => {
                self.store.close(handle, true)?;
                warn!("Store '{}' deleted", self.name);
            }
            None => info!("Store '{}' already empty", self.name),
        }
        Ok(())
    }
}
