//! The sized output file. The file is created at its final size up front and
//! mmapped for positioned writes, with an in-memory fallback for filesystems
//! that won't map. Headers are written last, into space reserved at the
//! front.

use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapOptions;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct SizedOutput {
    file: std::fs::File,
    pub(crate) out: OutputBuffer,
    path: PathBuf,
}

pub(crate) enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl OutputBuffer {
    fn new(file: &std::fs::File, file_size: u64) -> OutputBuffer {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| OutputBuffer::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &std::fs::File, file_size: u64) -> Option<OutputBuffer> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(OutputBuffer::Mmap(mmap))
    }
}

impl std::ops::Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap,
            OutputBuffer::InMemory(bytes) => bytes,
        }
    }
}

impl std::ops::DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap,
            OutputBuffer::InMemory(bytes) => bytes,
        }
    }
}

impl SizedOutput {
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<SizedOutput> {
        // Remove any old output first; overwriting a file that's currently
        // being executed would fail with ETXTBSY.
        let _ = std::fs::remove_file(path);

        let mut open_options = std::fs::OpenOptions::new();
        std::os::unix::fs::OpenOptionsExt::custom_flags(&mut open_options, libc::O_CLOEXEC);
        let file = open_options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}` for writing", path.display()))?;

        let out = OutputBuffer::new(&file, file_size);
        Ok(SizedOutput {
            file,
            out,
            path: path.to_owned(),
        })
    }

    /// Flushes (for the in-memory fallback) and marks the output executable.
    pub(crate) fn finish(mut self, make_executable: bool) -> Result {
        match &self.out {
            OutputBuffer::Mmap(_) => {}
            OutputBuffer::InMemory(bytes) => self
                .file
                .write_all(bytes)
                .with_context(|| format!("Failed to write `{}`", self.path.display()))?,
        }
        if make_executable {
            // Best-effort: pipes and some filesystems won't take a chmod.
            let _ = set_executable(&self.file);
        }
        Ok(())
    }
}

fn set_executable(file: &std::fs::File) -> Result {
    use std::os::unix::fs::PermissionsExt as _;
    let mut permissions = file.metadata()?.permissions();
    let mode = permissions.mode();
    permissions.set_mode(mode | ((mode & 0o444) >> 2));
    file.set_permissions(permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_finish() {
        let dir = std::env::temp_dir().join("zld-file-writer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.bin");

        let mut output = SizedOutput::create(&path, 16).unwrap();
        output.out[0..4].copy_from_slice(b"\x7fELF");
        output.finish(true).unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 16);
        assert_eq!(&written[..4], b"\x7fELF");
        std::fs::remove_file(&path).unwrap();
    }
}
