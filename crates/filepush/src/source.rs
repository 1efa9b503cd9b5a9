use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Positioned byte source read by a [`PumpThread`](crate::PumpThread).
///
/// Implementations return the number of bytes placed at the start of `buf`;
/// `Ok(0)` means no data at `position` right now.
pub trait TsSource: Send + Sync {
    fn read_at(&self, position: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sequential byte source (typically a demultiplexer device) read by a
/// [`RecorderPumpThread`](crate::RecorderPumpThread).
pub trait DemuxSource: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A file or device node, usable both as a positioned and as a sequential source.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: Option<PathBuf>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_file(file: File) -> Self {
        Self { file, path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl TsSource for FileSource {
    #[cfg(unix)]
    fn read_at(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, position)
    }

    #[cfg(windows)]
    fn read_at(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, position)
    }
}

impl DemuxSource for FileSource {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}
