//! S1 driver: turns loaded input files into parsed objects, archives with
//! tables of contents, and dylib descriptors. Object parsing is the only part
//! of the pipeline that runs on the thread pool; everything later is
//! single-threaded and deterministic.

use crate::archive::Archive;
use crate::args::CpuArch;
use crate::args::Options;
use crate::dylib;
use crate::dylib::Dylib;
use crate::elf;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::file_kind::fat_slice_for_arch;
use crate::input_data::InputData;
use crate::input_data::InputFile;
use crate::macho;
use crate::object_file::ObjectFile;
use crate::wasm;
use anyhow::bail;
use rayon::prelude::*;

pub(crate) struct LinkArchive<'data> {
    pub(crate) archive: Archive<'data>,
    pub(crate) name: String,

    /// `symbol name → member offset`, for O(1) pull-in checks. First
    /// definition wins, matching the TOC order.
    pub(crate) toc_map: hashbrown::HashMap<&'data [u8], usize>,

    /// Member offsets already pulled in, to keep pull-in idempotent.
    pub(crate) loaded_members: hashbrown::HashSet<usize>,
}

/// Everything S2 onwards works from. `objects` grows during archive pull-in;
/// `FileId`s index it.
pub(crate) struct LinkInputs<'data> {
    pub(crate) objects: Vec<ObjectFile<'data>>,
    pub(crate) archives: Vec<LinkArchive<'data>>,
    pub(crate) dylibs: Vec<Dylib>,
}

enum ParsedFile<'data> {
    Objects(Vec<ObjectFile<'data>>),
    Archive(LinkArchive<'data>),
    Dylib(Dylib),
}

pub(crate) fn parse_input_files<'data>(
    input_data: &'data InputData,
    opts: &Options,
    pool: &rayon::ThreadPool,
) -> Result<LinkInputs<'data>> {
    let parsed: Vec<ParsedFile<'data>> = pool.install(|| {
        input_data
            .files
            .par_iter()
            .map(|file| {
                parse_file(file, opts)
                    .with_context(|| format!("Failed to parse input file `{file}`"))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut inputs = LinkInputs {
        objects: Vec::new(),
        archives: Vec::new(),
        dylibs: Vec::new(),
    };
    for file in parsed {
        match file {
            ParsedFile::Objects(objects) => inputs.objects.extend(objects),
            ParsedFile::Archive(archive) => inputs.archives.push(archive),
            ParsedFile::Dylib(dylib) => inputs.dylibs.push(dylib),
        }
    }
    Ok(inputs)
}

fn parse_file<'data>(file: &'data InputFile, opts: &Options) -> Result<ParsedFile<'data>> {
    let display_name = file.filename.display().to_string();
    parse_bytes(file.data(), file.kind, file, opts, display_name)
}

fn parse_bytes<'data>(
    data: &'data [u8],
    kind: FileKind,
    file: &'data InputFile,
    opts: &Options,
    display_name: String,
) -> Result<ParsedFile<'data>> {
    let arch = opts.target.cpu_arch;
    match kind {
        FileKind::ElfObject => Ok(ParsedFile::Objects(vec![elf::parse(
            data,
            display_name,
            arch,
        )?])),
        FileKind::MachOObject => Ok(ParsedFile::Objects(vec![macho::parse(
            data,
            display_name,
            arch,
        )?])),
        FileKind::WasmObject => Ok(ParsedFile::Objects(vec![wasm::parse(
            data,
            display_name,
            arch,
        )?])),
        FileKind::ElfDynamic => {
            let mut dylib = dylib::parse_elf_dynamic(data, &display_name, arch)?;
            dylib.weak = file.attrs.weak;
            dylib.needed = file.attrs.needed;
            Ok(ParsedFile::Dylib(dylib))
        }
        FileKind::MachODylib => {
            let mut dylib = dylib::parse_binary(data, arch)?;
            dylib.weak = file.attrs.weak;
            dylib.needed = file.attrs.needed;
            Ok(ParsedFile::Dylib(dylib))
        }
        FileKind::TextStub => {
            let mut dylib = dylib::parse_tbd(data, arch)?;
            dylib.weak = file.attrs.weak;
            dylib.needed = file.attrs.needed;
            Ok(ParsedFile::Dylib(dylib))
        }
        FileKind::FatMachO => {
            let slice = fat_slice_for_arch(data, arch)
                .with_context(|| format!("No matching slice in fat file `{display_name}`"))?;
            let inner_kind = FileKind::identify_bytes(slice)?;
            if inner_kind == FileKind::FatMachO {
                bail!("Nested fat containers are not supported");
            }
            parse_bytes(slice, inner_kind, file, opts, display_name)
        }
        FileKind::Archive => {
            let archive = Archive::parse(data)
                .with_context(|| format!("Failed to parse archive `{display_name}`"))?;
            let mut toc_map = hashbrown::HashMap::new();
            for &(name, offset) in archive.toc() {
                toc_map.entry(name).or_insert(offset);
            }
            let mut link_archive = LinkArchive {
                archive,
                name: display_name,
                toc_map,
                loaded_members: hashbrown::HashSet::new(),
            };
            if file.must_link {
                // Force-loaded archives contribute every member up front.
                let mut objects = Vec::new();
                for offset in link_archive.archive.all_member_offsets()? {
                    if link_archive.loaded_members.insert(offset) {
                        objects.push(parse_member(&link_archive, offset, arch)?);
                    }
                }
                return Ok(ParsedFile::Objects(objects));
            }
            Ok(ParsedFile::Archive(link_archive))
        }
    }
}

/// Parses one archive member as a relocatable object.
pub(crate) fn parse_member<'data>(
    link_archive: &LinkArchive<'data>,
    offset: usize,
    arch: CpuArch,
) -> Result<ObjectFile<'data>> {
    let member = link_archive.archive.member_at(offset)?;
    let member_name = format!(
        "{}({})",
        link_archive.name,
        String::from_utf8_lossy(&member.name)
    );
    let kind = FileKind::identify_bytes(member.data)
        .with_context(|| format!("Failed to identify archive member `{member_name}`"))?;
    let data = if kind == FileKind::FatMachO {
        fat_slice_for_arch(member.data, arch)?
    } else {
        member.data
    };
    match FileKind::identify_bytes(data)? {
        FileKind::ElfObject => elf::parse(data, member_name, arch),
        FileKind::MachOObject => macho::parse(data, member_name, arch),
        FileKind::WasmObject => wasm::parse(data, member_name, arch),
        other => bail!("Archive member `{member_name}` is a {other}, not an object"),
    }
}
