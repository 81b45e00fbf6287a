//! Transports
//!
//! The engines only ever talk to files through [`Transport`]: positional
//! writes and reads, flush, close and size. Random-access reads are what
//! lets the deserializer fetch just the byte range a selection needs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::{Error, IoContext, Result};
use crate::params::TransportLibrary;

/// How a transport opens its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate
    Write,
    /// Create if missing, keep existing contents
    Append,
    Read,
}

/// Narrow I/O contract consumed by the engines
pub trait Transport: Send {
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<()>;

    /// Write `buf` at `offset`, or at the current end when `None`
    fn write(&mut self, buf: &[u8], offset: Option<u64>) -> Result<()>;

    /// Fill `buf` from `offset`
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Current size of the underlying file
    fn size(&self) -> Result<u64>;

    /// Path this transport was opened on
    fn path(&self) -> &Path;
}

fn not_open(path: &Path) -> Error {
    Error::io(
        format!("using {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is not open"),
    )
}

/// POSIX file transport
#[derive(Debug, Default)]
pub struct FileTransport {
    file: Option<File>,
    path: PathBuf,
}

impl FileTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn file(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| not_open(path))
    }
}

impl Transport for FileTransport {
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<()> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Write => options.create(true).write(true).read(true).truncate(true),
            OpenMode::Append => options.create(true).write(true).read(true),
            OpenMode::Read => options.read(true),
        };
        let file = options
            .open(path)
            .context(|| format!("opening {}", path.display()))?;
        trace!("opened {} ({mode:?})", path.display());
        self.path = path.to_path_buf();
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, buf: &[u8], offset: Option<u64>) -> Result<()> {
        let path = self.path.clone();
        let file = self.file()?;
        let pos = match offset {
            Some(offset) => SeekFrom::Start(offset),
            None => SeekFrom::End(0),
        };
        file.seek(pos)
            .and_then(|_| file.write_all(buf))
            .context(|| format!("writing {} bytes to {}", buf.len(), path.display()))
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .context(|| {
                format!(
                    "reading {} bytes at offset {offset} from {}",
                    buf.len(),
                    path.display()
                )
            })
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.file()?
            .flush()
            .context(|| format!("flushing {}", path.display()))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .context(|| format!("closing {}", self.path.display()))?;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or_else(|| not_open(&self.path))?;
        file.metadata()
            .map(|m| m.len())
            .context(|| format!("querying size of {}", self.path.display()))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-only memory-mapped transport
///
/// The mapping is refreshed when a read goes past its end, so a reader can
/// follow a file that is still growing.
#[cfg(feature = "mmap")]
#[derive(Debug, Default)]
pub struct MmapTransport {
    file: Option<File>,
    map: Option<memmap2::Mmap>,
    path: PathBuf,
}

#[cfg(feature = "mmap")]
impl MmapTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn remap(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(|| not_open(&self.path))?;
        // SAFETY: the dataset files are append-only while mapped; bytes
        // already covered by the mapping are never rewritten
        let map = unsafe { memmap2::MmapOptions::new().map(file) }
            .context(|| format!("mapping {}", self.path.display()))?;
        self.map = Some(map);
        Ok(())
    }
}

#[cfg(feature = "mmap")]
impl Transport for MmapTransport {
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<()> {
        if mode != OpenMode::Read {
            return Err(Error::invalid("memory-mapped transport is read-only"));
        }
        let file = File::open(path).context(|| format!("opening {}", path.display()))?;
        self.path = path.to_path_buf();
        self.file = Some(file);
        self.remap()
    }

    fn write(&mut self, _buf: &[u8], _offset: Option<u64>) -> Result<()> {
        Err(Error::invalid("memory-mapped transport is read-only"))
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::invalid("read range overflows"))?;
        let mapped = self.map.as_ref().map_or(0, |m| m.len() as u64);
        if end > mapped {
            self.remap()?;
        }
        let map = self.map.as_ref().ok_or_else(|| not_open(&self.path))?;
        let src = map.get(offset as usize..end as usize).ok_or_else(|| {
            Error::io(
                format!("reading {}", self.path.display()),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            )
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.map = None;
        self.file = None;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or_else(|| not_open(&self.path))?;
        file.metadata()
            .map(|m| m.len())
            .context(|| format!("querying size of {}", self.path.display()))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Transport that discards writes and reads zeros
#[derive(Debug, Default)]
pub struct NullTransport {
    size: u64,
    path: PathBuf,
}

impl Transport for NullTransport {
    fn open(&mut self, path: &Path, _mode: OpenMode) -> Result<()> {
        self.path = path.to_path_buf();
        self.size = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8], offset: Option<u64>) -> Result<()> {
        let end = offset.unwrap_or(self.size) + buf.len() as u64;
        self.size = self.size.max(end);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _offset: u64) -> Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Open a transport of the configured library
pub fn open_transport(
    library: TransportLibrary,
    path: &Path,
    mode: OpenMode,
) -> Result<Box<dyn Transport>> {
    let mut transport: Box<dyn Transport> = match (library, mode) {
        (TransportLibrary::Null, _) => Box::new(NullTransport::default()),
        #[cfg(feature = "mmap")]
        (TransportLibrary::Mmap, OpenMode::Read) => Box::new(MmapTransport::new()),
        (TransportLibrary::Mmap, _) => {
            debug!("{}: mmap is read-only, writing through posix", path.display());
            Box::new(FileTransport::new())
        }
        (TransportLibrary::Posix, _) => Box::new(FileTransport::new()),
    };
    transport.open(path, mode)?;
    Ok(transport)
}
