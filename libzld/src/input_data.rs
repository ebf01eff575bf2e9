//! Code for figuring out which input files we need to read, then mapping them
//! into memory. Everything downstream borrows from the buffers owned here, so
//! `InputData` outlives the whole link.

use crate::args::Backend;
use crate::args::LinkAttrs;
use crate::args::Options;
use crate::args::SearchStrategy;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::error::warning;
use crate::file_kind::FileKind;
use memmap2::Mmap;
use std::fmt::Display;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputOrigin {
    Positional,
    Library,
    Framework,
}

#[derive(Debug)]
pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) must_link: bool,
    pub(crate) attrs: LinkAttrs,
    pub(crate) origin: InputOrigin,
    data: FileData,
}

#[derive(Debug)]
enum FileData {
    Mapped(Mmap),
    InMemory(Vec<u8>),
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        match &self.data {
            FileData::Mapped(mmap) => mmap.deref(),
            FileData::InMemory(bytes) => bytes,
        }
    }
}

impl Display for InputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.filename.display(), f)
    }
}

impl InputData {
    pub(crate) fn load(opts: &Options) -> Result<InputData> {
        let mut files = Vec::new();
        let mut missing_libs = Vec::new();
        let mut missing_frameworks = Vec::new();

        for positional in &opts.positionals {
            let file = open_file(
                &positional.path,
                positional.must_link,
                LinkAttrs::default(),
                InputOrigin::Positional,
            )?;
            files.push(file);
        }

        for (name, attrs) in &opts.libs {
            match search_library(opts, name) {
                Some(path) => {
                    files.push(open_file(&path, false, *attrs, InputOrigin::Library)?);
                }
                None => missing_libs.push(name.clone()),
            }
        }

        for (name, attrs) in &opts.frameworks {
            match search_framework(opts, name) {
                Some(path) => {
                    files.push(open_file(&path, false, *attrs, InputOrigin::Framework)?);
                }
                None => missing_frameworks.push(name.clone()),
            }
        }

        // Missing libraries are reported together, after every search has
        // run, so a build with several broken -l flags fails once.
        if !missing_libs.is_empty() || !missing_frameworks.is_empty() {
            let mut messages: Vec<String> = missing_libs
                .iter()
                .map(|name| LinkError::LibraryNotFound(name.clone()).to_string())
                .collect();
            messages.extend(
                missing_frameworks
                    .iter()
                    .map(|name| LinkError::FrameworkNotFound(name.clone()).to_string()),
            );
            anyhow::bail!("{}", messages.join("\n"));
        }

        Ok(InputData { files })
    }
}

fn open_file(
    path: &Path,
    must_link: bool,
    attrs: LinkAttrs,
    origin: InputOrigin,
) -> Result<InputFile> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open `{}`", path.display()))?;
    // Mapping can fail for special files; fall back to reading.
    let data = match unsafe { Mmap::map(&file) } {
        Ok(mmap) => FileData::Mapped(mmap),
        Err(_) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read `{}`", path.display()))?;
            FileData::InMemory(bytes)
        }
    };
    let bytes = match &data {
        FileData::Mapped(mmap) => mmap.deref(),
        FileData::InMemory(bytes) => bytes.as_slice(),
    };
    let kind = FileKind::identify_bytes(bytes)
        .with_context(|| format!("Failed to identify `{}`", path.display()))?;
    Ok(InputFile {
        filename: path.to_owned(),
        kind,
        must_link,
        attrs,
        origin,
        data,
    })
}

fn apply_syslibroot(opts: &Options, dir: &Path) -> PathBuf {
    match (&opts.syslibroot, dir.strip_prefix("/")) {
        (Some(root), Ok(stripped)) => root.join(stripped),
        _ => dir.to_owned(),
    }
}

/// Candidate file names for `-lname`, in per-directory preference order.
fn library_candidates(backend: Backend, name: &str) -> Vec<Vec<String>> {
    match backend {
        Backend::MachO => vec![
            vec![format!("lib{name}.tbd"), format!("lib{name}.dylib")],
            vec![format!("lib{name}.a")],
        ],
        Backend::Elf => vec![
            vec![format!("lib{name}.so")],
            vec![format!("lib{name}.a")],
        ],
        Backend::Wasm | Backend::Coff => vec![vec![format!("lib{name}.a")]],
    }
}

fn search_library(opts: &Options, name: &str) -> Option<PathBuf> {
    let candidates = library_candidates(opts.backend, name);
    let dirs: Vec<PathBuf> = opts
        .lib_dirs
        .iter()
        .map(|dir| apply_syslibroot(opts, dir))
        .collect();

    for dir in &dirs {
        if !dir.exists() {
            warning(&format!("search directory `{}` not found", dir.display()));
        }
    }

    match opts.search_strategy {
        // Each directory is tried for every candidate kind before moving on.
        SearchStrategy::PathsFirst => dirs.iter().find_map(|dir| {
            candidates
                .iter()
                .flatten()
                .map(|candidate| dir.join(candidate))
                .find(|path| path.exists())
        }),
        // All directories are tried for dynamic libraries before any archive
        // is considered.
        SearchStrategy::DylibsFirst => candidates.iter().find_map(|kind_group| {
            dirs.iter().find_map(|dir| {
                kind_group
                    .iter()
                    .map(|candidate| dir.join(candidate))
                    .find(|path| path.exists())
            })
        }),
    }
}

fn search_framework(opts: &Options, name: &str) -> Option<PathBuf> {
    opts.framework_dirs
        .iter()
        .map(|dir| apply_syslibroot(opts, dir))
        .find_map(|dir| {
            let base = dir.join(format!("{name}.framework"));
            [format!("{name}.tbd"), name.to_owned()]
                .iter()
                .map(|file| base.join(file))
                .find(|path| path.exists())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::args::Backend;

    #[test]
    fn test_library_candidates_order() {
        let macho = library_candidates(Backend::MachO, "System");
        assert_eq!(macho[0], vec!["libSystem.tbd", "libSystem.dylib"]);
        assert_eq!(macho[1], vec!["libSystem.a"]);
        let elf = library_candidates(Backend::Elf, "c");
        assert_eq!(elf[0], vec!["libc.so"]);
    }

    #[test]
    fn test_missing_library_reports_all_names() {
        let mut opts = args::Options::new(Backend::Elf, args::default_target(Backend::Elf));
        opts.libs = vec![
            ("missing_one".to_owned(), LinkAttrs::default()),
            ("missing_two".to_owned(), LinkAttrs::default()),
        ];
        let err = InputData::load(&opts).unwrap_err().to_string();
        assert!(err.contains("missing_one"));
        assert!(err.contains("missing_two"));
    }
}
