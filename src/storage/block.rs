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

//! Block store contract and a file-backed implementation.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Named byte stores.
pub trait BlockStore {
    type Handle;

    /// Open a store. Returns `None` when it does not exist and
    /// `create_if_missing` is false.
    fn open(&mut self, name: &str, create_if_missing: bool) -> io::Result<Option<Self::Handle>>;

    fn read_all(&mut self, handle: &Self::Handle) -> io::Result<Vec<u8>>;

    fn write_all(&mut self, handle: &Self::Handle, bytes: &[u8]) -> io::Result<()>;

    /// Release the handle, deleting the store if `erase` is set.
    fn close(&mut self, handle: Self::Handle, erase: bool) -> io::Result<()>;
}

/// One file per store under a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.store", name))
    }
}

impl BlockStore for FileStore {
    type Handle = PathBuf;

    fn open(&mut self, name: &str, create_if_missing: bool) -> io::Result<Option<PathBuf>> {
        let path = self.path_for(name);
        if path.exists() {
            return Ok(Some(path));
        }
        if !create_if_missing {
            debug!("Store {:?} does not exist", path);
            return Ok(None);
        }
        std::fs::write(&path, [])?;
        info!("Created store {:?}", path);
        Ok(Some(path))
    }

    fn read_all(&mut self, handle: &PathBuf) -> io::Result<Vec<u8>> {
        std::fs::read(handle)
    }

    fn write_all(&mut self, handle: &PathBuf, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(handle, bytes)
    }

    fn close(&mut self, handle: PathBuf, erase: bool) -> io::Result<()> {
        if erase {
            std::fs::remove_file(&handle)?;
            info!("Erased store {:?}", handle);
        }
        Ok(())
    }
}
