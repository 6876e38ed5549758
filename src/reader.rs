//! Byte sources for inspection.
//!
//! A [`PickleSource`] owns the whole stream: either a read-only memory map of
//! a file or an in-memory buffer. Inspection never streams; the entire pickle
//! must fit in the address space.

use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::Mmap;

use crate::error::Result;

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// The bytes of one pickle plus the name it is reported under.
#[derive(Debug)]
pub struct PickleSource {
    file_name: String,
    backing: Backing,
}

impl PickleSource {
    /// Opens and maps a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // Empty files cannot be mapped on every platform.
        let backing = if size == 0 {
            Backing::Owned(Vec::new())
        } else {
            // Safety: the map is read-only; a concurrent writer can change what we
            // read, which at worst yields a malformed-stream diagnostic.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };
            Backing::Mapped(mmap)
        };
        debug!("opened {} ({size} bytes)", path.display());

        Ok(Self { file_name, backing })
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            backing: Backing::Owned(bytes),
        }
    }

    /// Base name of the source file.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The whole stream.
    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Owned(bytes) => bytes.as_slice(),
        }
    }

    /// Stream length in bytes.
    pub fn size(&self) -> u64 {
        self.bytes().len() as u64
    }
}
