//! Dynamic library descriptors for the Mach-O backend. Binary dylibs and
//! `.tbd` text stubs both reduce to the same record: an install name, version
//! numbers, and the set of exported symbols. The resolver binds undefined
//! globals against that set and records the dylib's ordinal.

use crate::args::CpuArch;
use crate::error::LinkError;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::leb128::read_uleb128;
use anyhow::bail;
use object::LittleEndian;
use object::macho;

const E: LittleEndian = LittleEndian;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExportInfo {
    pub(crate) weak: bool,
}

#[derive(Debug)]
pub(crate) struct Dylib {
    pub(crate) install_name: String,
    pub(crate) current_version: u32,
    pub(crate) compatibility_version: u32,
    pub(crate) exports: PassThroughHashMap<Vec<u8>, ExportInfo>,

    /// Install names of libraries this one re-exports. Their exports are
    /// reachable through this dylib's ordinal.
    pub(crate) dependents: Vec<String>,

    /// Loaded via a weak attribute (`-weak_framework` etc).
    pub(crate) weak: bool,

    /// Whether any symbol was actually bound against this dylib. Drives
    /// `dead_strip_dylibs`.
    pub(crate) referenced: bool,

    pub(crate) needed: bool,
}

impl Dylib {
    pub(crate) fn exports_symbol(&self, name: &[u8]) -> Option<ExportInfo> {
        self.exports
            .get(&PreHashed::new(name.to_vec(), hash_bytes(name)))
            .copied()
    }

    fn add_export(&mut self, name: &[u8], info: ExportInfo) {
        self.exports
            .insert(PreHashed::new(name.to_vec(), hash_bytes(name)), info);
    }
}

/// Parses a binary Mach-O dylib. Exported symbols come from the export trie
/// when the dylib has one, otherwise from the external symbols of the symbol
/// table.
pub(crate) fn parse_binary<'data>(data: &'data [u8], expected_arch: CpuArch) -> Result<Dylib> {
    let header: &macho::MachHeader64<LittleEndian> = object::from_bytes(
        data.get(..size_of::<macho::MachHeader64<LittleEndian>>())
            .ok_or(LinkError::NotDylib)?,
    )
    .map_err(|()| LinkError::NotDylib)?
    .0;
    if header.magic.get(object::BigEndian) != macho::MH_MAGIC_64 {
        return Err(LinkError::NotDylib.into());
    }
    if crate::macho::cpu_arch_of(header.cputype.get(E) as i32)? != expected_arch {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }
    if !matches!(
        header.filetype.get(E),
        macho::MH_DYLIB | macho::MH_DYLIB_STUB
    ) {
        return Err(LinkError::NotDylib.into());
    }

    let mut dylib = Dylib {
        install_name: String::new(),
        current_version: 0,
        compatibility_version: 0,
        exports: PassThroughHashMap::default(),
        dependents: Vec::new(),
        weak: false,
        referenced: false,
        needed: false,
    };

    let mut export_trie: Option<&'data [u8]> = None;
    let mut symtab: Option<(&[macho::Nlist64<LittleEndian>], &'data [u8])> = None;

    let mut offset = size_of::<macho::MachHeader64<LittleEndian>>();
    for _ in 0..header.ncmds.get(E) {
        let cmd: &macho::LoadCommand<LittleEndian> = object::from_bytes(
            data.get(offset..offset + size_of::<macho::LoadCommand<LittleEndian>>())
                .ok_or(LinkError::NotDylib)?,
        )
        .map_err(|()| LinkError::NotDylib)?
        .0;
        let cmd_bytes = data
            .get(offset..offset + cmd.cmdsize.get(E) as usize)
            .ok_or(LinkError::NotDylib)?;
        match cmd.cmd.get(E) {
            macho::LC_ID_DYLIB => {
                let dc: &macho::DylibCommand<LittleEndian> = object::from_bytes(
                    &cmd_bytes[..size_of::<macho::DylibCommand<LittleEndian>>()],
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                dylib.install_name = load_command_string(cmd_bytes, dc.dylib.name.offset.get(E))?;
                dylib.current_version = dc.dylib.current_version.get(E);
                dylib.compatibility_version = dc.dylib.compatibility_version.get(E);
            }
            macho::LC_REEXPORT_DYLIB => {
                let dc: &macho::DylibCommand<LittleEndian> = object::from_bytes(
                    &cmd_bytes[..size_of::<macho::DylibCommand<LittleEndian>>()],
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                dylib
                    .dependents
                    .push(load_command_string(cmd_bytes, dc.dylib.name.offset.get(E))?);
            }
            macho::LC_DYLD_INFO | macho::LC_DYLD_INFO_ONLY => {
                let di: &macho::DyldInfoCommand<LittleEndian> = object::from_bytes(
                    &cmd_bytes[..size_of::<macho::DyldInfoCommand<LittleEndian>>()],
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                let start = di.export_off.get(E) as usize;
                let size = di.export_size.get(E) as usize;
                if size > 0 {
                    export_trie = Some(data.get(start..start + size).ok_or(LinkError::NotDylib)?);
                }
            }
            macho::LC_DYLD_EXPORTS_TRIE => {
                let le: &macho::LinkeditDataCommand<LittleEndian> = object::from_bytes(
                    &cmd_bytes[..size_of::<macho::LinkeditDataCommand<LittleEndian>>()],
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                let start = le.dataoff.get(E) as usize;
                let size = le.datasize.get(E) as usize;
                if size > 0 {
                    export_trie = Some(data.get(start..start + size).ok_or(LinkError::NotDylib)?);
                }
            }
            macho::LC_SYMTAB => {
                let st: &macho::SymtabCommand<LittleEndian> = object::from_bytes(
                    &cmd_bytes[..size_of::<macho::SymtabCommand<LittleEndian>>()],
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                let nlists = object::slice_from_bytes(
                    data.get(st.symoff.get(E) as usize..)
                        .ok_or(LinkError::NotDylib)?,
                    st.nsyms.get(E) as usize,
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                let strtab = data
                    .get(st.stroff.get(E) as usize..)
                    .and_then(|b| b.get(..st.strsize.get(E) as usize))
                    .ok_or(LinkError::NotDylib)?;
                symtab = Some((nlists, strtab));
            }
            _ => {}
        }
        offset += cmd.cmdsize.get(E) as usize;
    }

    if let Some(trie) = export_trie {
        let mut name = Vec::new();
        walk_export_trie(trie, 0, &mut name, &mut dylib)?;
    } else if let Some((nlists, strtab)) = symtab {
        for nlist in nlists {
            let n_type = nlist.n_type;
            if n_type & macho::N_STAB != 0 || n_type & macho::N_EXT == 0 {
                continue;
            }
            if n_type & macho::N_TYPE == macho::N_UNDF {
                continue;
            }
            let name = crate::elf::str_at(strtab, nlist.n_strx.get(E));
            let weak = nlist.n_desc.get(E) & macho::N_WEAK_DEF != 0;
            dylib.add_export(name, ExportInfo { weak });
        }
    }

    Ok(dylib)
}

fn load_command_string(cmd_bytes: &[u8], offset: u32) -> Result<String> {
    let rest = cmd_bytes
        .get(offset as usize..)
        .ok_or(LinkError::NotDylib)?;
    let end = memchr::memchr(0, rest).unwrap_or(rest.len());
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}

fn walk_export_trie(trie: &[u8], node: usize, name: &mut Vec<u8>, dylib: &mut Dylib) -> Result {
    let mut offset = node;
    let terminal_size = read_uleb128(trie, &mut offset)? as usize;
    if terminal_size > 0 {
        let mut term = offset;
        let flags = read_uleb128(trie, &mut term)?;
        let weak = flags & u64::from(macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) != 0;
        dylib.add_export(name, ExportInfo { weak });
    }
    offset += terminal_size;
    let Some(&child_count) = trie.get(offset) else {
        bail!("Truncated export trie");
    };
    offset += 1;
    for _ in 0..child_count {
        let rest = trie.get(offset..).ok_or(LinkError::NotDylib)?;
        let edge_len = memchr::memchr(0, rest).ok_or(LinkError::NotDylib)?;
        let edge = &rest[..edge_len];
        offset += edge_len + 1;
        let child = read_uleb128(trie, &mut offset)? as usize;
        let name_len = name.len();
        name.extend_from_slice(edge);
        walk_export_trie(trie, child, name, dylib)?;
        name.truncate(name_len);
    }
    Ok(())
}

/// Parses the line-oriented `.tbd` subset we accept: `install-name`,
/// `current-version`, `targets`, and the `symbols` / `weak-symbols` /
/// `reexported-libraries` lists. Multi-document stubs contribute all their
/// documents' exports.
pub(crate) fn parse_tbd(data: &[u8], expected_arch: CpuArch) -> Result<Dylib> {
    let text = std::str::from_utf8(data).map_err(|_| LinkError::NotDylib)?;
    if !text.trim_start().starts_with("---") {
        return Err(LinkError::NotDylib.into());
    }

    let mut dylib = Dylib {
        install_name: String::new(),
        current_version: 0,
        compatibility_version: 0,
        exports: PassThroughHashMap::default(),
        dependents: Vec::new(),
        weak: false,
        referenced: false,
        needed: false,
    };

    let arch_token = match expected_arch {
        CpuArch::X86_64 => "x86_64",
        CpuArch::Aarch64 => "arm64",
        CpuArch::Wasm32 => return Err(LinkError::NotDylib.into()),
    };
    let mut saw_matching_target = false;
    let mut in_first_document = true;

    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.starts_with("---") && !dylib.install_name.is_empty() {
            in_first_document = false;
            continue;
        }
        let Some((key, value)) = split_key(trimmed) else {
            continue;
        };
        match key {
            "targets" | "archs" => {
                let list = collect_list(value, &mut lines);
                if list.iter().any(|t| t.starts_with(arch_token)) {
                    saw_matching_target = true;
                }
            }
            "install-name" if in_first_document => {
                dylib.install_name = value.trim_matches(['\'', '"']).to_owned();
            }
            "current-version" if in_first_document => {
                dylib.current_version = parse_version(value);
            }
            "compatibility-version" if in_first_document => {
                dylib.compatibility_version = parse_version(value);
            }
            "symbols" | "objc-classes" => {
                for sym in collect_list(value, &mut lines) {
                    dylib.add_export(sym.as_bytes(), ExportInfo { weak: false });
                }
            }
            "weak-symbols" => {
                for sym in collect_list(value, &mut lines) {
                    dylib.add_export(sym.as_bytes(), ExportInfo { weak: true });
                }
            }
            "libraries" | "reexported-libraries" => {
                for lib in collect_list(value, &mut lines) {
                    if lib.starts_with('/') || lib.starts_with('@') {
                        dylib.dependents.push(lib);
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_matching_target {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }
    if dylib.exports.is_empty() && dylib.dependents.is_empty() {
        return Err(LinkError::EmptyStubFile.into());
    }
    Ok(dylib)
}

fn split_key(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_prefix("- ").unwrap_or(line);
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Collects a `[ a, b, c ]` flow list, following continuation lines until the
/// closing bracket.
fn collect_list<'a, I: Iterator<Item = &'a str>>(
    value: &str,
    lines: &mut std::iter::Peekable<I>,
) -> Vec<String> {
    let mut buffer = value.to_owned();
    while !buffer.contains(']') && buffer.contains('[') {
        match lines.next() {
            Some(line) => {
                buffer.push(' ');
                buffer.push_str(line.trim());
            }
            None => break,
        }
    }
    let inner = buffer
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(['\'', '"']).to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_version(value: &str) -> u32 {
    // X.Y.Z packed as xxxx.yy.zz nibbles, the Mach-O version encoding.
    let mut parts = value.trim_matches(['\'', '"']).split('.');
    let x: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let y: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let z: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (x << 16) | (y << 8) | z
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TBD: &str = r#"--- !tapi-tbd
tbd-version:     4
targets:         [ x86_64-macos, arm64-macos ]
install-name:    '/usr/lib/libSystem.B.dylib'
current-version: 1311.100.3
exports:
  - targets:     [ x86_64-macos, arm64-macos ]
    symbols:     [ _printf, _puts,
                   _malloc ]
    weak-symbols: [ _pthread_atfork ]
...
"#;

    #[test]
    fn test_parse_tbd() {
        let dylib = parse_tbd(SAMPLE_TBD.as_bytes(), CpuArch::Aarch64).unwrap();
        assert_eq!(dylib.install_name, "/usr/lib/libSystem.B.dylib");
        assert_eq!(dylib.current_version, (1311 << 16) | (100 << 8) | 3);
        assert!(dylib.exports_symbol(b"_printf").is_some());
        assert!(dylib.exports_symbol(b"_malloc").is_some());
        assert!(dylib.exports_symbol(b"_pthread_atfork").unwrap().weak);
        assert!(dylib.exports_symbol(b"_missing").is_none());
    }

    #[test]
    fn test_tbd_wrong_arch() {
        let text = SAMPLE_TBD.replace("arm64-macos", "armv7k-watchos");
        let err = parse_tbd(text.as_bytes(), CpuArch::Aarch64).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::MismatchedCpuArchitecture)
        ));
    }

    #[test]
    fn test_empty_stub() {
        let text = "--- !tapi-tbd\ntargets: [ arm64-macos ]\ninstall-name: '/usr/lib/libempty.dylib'\n";
        let err = parse_tbd(text.as_bytes(), CpuArch::Aarch64).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::EmptyStubFile)
        ));
    }

    #[test]
    fn test_export_trie_walk() {
        // Hand-built trie exporting `_a` (regular) and `_ab` (weak).
        //
        // root: no terminal, 1 child "_a" -> node A
        // A: terminal (flags 0, offset 0x100), 1 child "b" -> node B
        // B: terminal (flags WEAK, offset 0x200), 0 children
        let mut trie = Vec::new();
        trie.extend_from_slice(&[0x00, 0x01]); // terminal size 0, 1 child
        trie.extend_from_slice(b"_a\0");
        let fixup_a = trie.len();
        trie.push(0); // child offset, patched below
        let node_a = trie.len();
        trie.extend_from_slice(&[0x03, 0x00, 0x80, 0x02, 0x01]); // size 3, flags 0, offset 0x100, 1 child
        trie.extend_from_slice(b"b\0");
        let fixup_b = trie.len();
        trie.push(0);
        let node_b = trie.len();
        trie.extend_from_slice(&[0x03, 0x04, 0x80, 0x04, 0x00]); // size 3, flags WEAK, offset 0x200
        trie[fixup_a] = node_a as u8;
        trie[fixup_b] = node_b as u8;

        let mut dylib = Dylib {
            install_name: String::new(),
            current_version: 0,
            compatibility_version: 0,
            exports: PassThroughHashMap::default(),
            dependents: Vec::new(),
            weak: false,
            referenced: false,
            needed: false,
        };
        let mut name = Vec::new();
        walk_export_trie(&trie, 0, &mut name, &mut dylib).unwrap();
        assert_eq!(dylib.exports_symbol(b"_a"), Some(ExportInfo { weak: false }));
        assert_eq!(dylib.exports_symbol(b"_ab"), Some(ExportInfo { weak: true }));
    }
}

/// Parses an ELF shared object into the same descriptor shape the Mach-O
/// backend uses: the resolver only cares about the export set and a name to
/// report. Exports come from `.dynsym`; the install name from `DT_SONAME`,
/// falling back to the file name.
pub(crate) fn parse_elf_dynamic(
    data: &[u8],
    fallback_name: &str,
    expected_arch: CpuArch,
) -> Result<Dylib> {
    use object::elf;

    type FileHeader = elf::FileHeader64<LittleEndian>;
    type SectionHeader = elf::SectionHeader64<LittleEndian>;
    type Sym = elf::Sym64<LittleEndian>;

    let header: &FileHeader = object::from_bytes(
        data.get(..size_of::<FileHeader>()).ok_or(LinkError::NotDylib)?,
    )
    .map_err(|()| LinkError::NotDylib)?
    .0;
    let arch = match header.e_machine.get(E) {
        elf::EM_X86_64 => CpuArch::X86_64,
        elf::EM_AARCH64 => CpuArch::Aarch64,
        _ => return Err(LinkError::UnsupportedCpuArchitecture.into()),
    };
    if arch != expected_arch {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }

    let shoff = header.e_shoff.get(E) as usize;
    let shnum = header.e_shnum.get(E) as usize;
    let headers: &[SectionHeader] = object::slice_from_bytes(
        data.get(shoff..).ok_or(LinkError::NotDylib)?,
        shnum,
    )
    .map_err(|()| LinkError::NotDylib)?
    .0;

    let mut dylib = Dylib {
        install_name: fallback_name.to_owned(),
        current_version: 0,
        compatibility_version: 0,
        exports: PassThroughHashMap::default(),
        dependents: Vec::new(),
        weak: false,
        referenced: false,
        needed: false,
    };

    let section_bytes = |sh: &SectionHeader| -> Result<&[u8]> {
        let start = sh.sh_offset.get(E) as usize;
        let size = sh.sh_size.get(E) as usize;
        data.get(start..start + size)
            .ok_or_else(|| LinkError::NotDylib.into())
    };

    let mut dynstr: &[u8] = &[];
    let mut soname_offset = None;
    for sh in headers {
        match sh.sh_type.get(E) {
            elf::SHT_DYNSYM => {
                let strtab_header = headers
                    .get(sh.sh_link.get(E) as usize)
                    .ok_or(LinkError::NotDylib)?;
                let strtab = section_bytes(strtab_header)?;
                dynstr = strtab;
                let count = sh.sh_size.get(E) as usize / size_of::<Sym>();
                let syms: &[Sym] = object::slice_from_bytes(section_bytes(sh)?, count)
                    .map_err(|()| LinkError::NotDylib)?
                    .0;
                for sym in syms {
                    if sym.st_shndx.get(E) == elf::SHN_UNDEF {
                        continue;
                    }
                    let bind = sym.st_bind();
                    if bind == elf::STB_LOCAL {
                        continue;
                    }
                    dylib.add_export(
                        crate::elf::str_at(strtab, sym.st_name.get(E)),
                        ExportInfo {
                            weak: bind == elf::STB_WEAK,
                        },
                    );
                }
            }
            elf::SHT_DYNAMIC => {
                let entries: &[elf::Dyn64<LittleEndian>] = object::slice_from_bytes(
                    section_bytes(sh)?,
                    sh.sh_size.get(E) as usize / size_of::<elf::Dyn64<LittleEndian>>(),
                )
                .map_err(|()| LinkError::NotDylib)?
                .0;
                for entry in entries {
                    if entry.d_tag.get(E) as u32 == elf::DT_SONAME {
                        soname_offset = Some(entry.d_val.get(E) as u32);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(offset) = soname_offset {
        let soname = crate::elf::str_at(dynstr, offset);
        if !soname.is_empty() {
            dylib.install_name = String::from_utf8_lossy(soname).into_owned();
        }
    }

    Ok(dylib)
}
