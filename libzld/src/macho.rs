//! Parsing of 64-bit Mach-O relocatable objects into the common `ObjectFile`
//! shape. Load commands are walked manually over the raw structs; symbol
//! values are rebased from the object's address space to section-relative
//! offsets so the atom builder doesn't care which format fed it.

use crate::alignment::Alignment;
use crate::args::CpuArch;
use crate::elf::str_at;
use crate::error::LinkError;
use crate::error::Result;
use crate::object_file::Binding;
use crate::object_file::DataInCode;
use crate::object_file::InputReloc;
use crate::object_file::InputSection;
use crate::object_file::InputSymbol;
use crate::object_file::ObjectFile;
use crate::object_file::RelocKind;
use crate::object_file::RelocTarget;
use crate::object_file::SectionData;
use crate::object_file::SectionKind;
use crate::object_file::SectionName;
use crate::object_file::SymFlags;
use anyhow::bail;
use object::LittleEndian;
use object::macho;

type MachHeader = macho::MachHeader64<LittleEndian>;
type SegmentCommand = macho::SegmentCommand64<LittleEndian>;
type Section = macho::Section64<LittleEndian>;
type Nlist = macho::Nlist64<LittleEndian>;
type RawReloc = macho::Relocation<LittleEndian>;

const E: LittleEndian = LittleEndian;

/// Symbol-table bits not exposed as named constants where we need them.
const N_NO_DEAD_STRIP: u16 = 0x0020;

fn get_struct<'data, T: object::Pod>(data: &'data [u8], offset: usize) -> Result<&'data T> {
    let bytes = data
        .get(offset..offset + size_of::<T>())
        .ok_or(LinkError::NotObject)?;
    Ok(object::from_bytes(bytes).map_err(|()| LinkError::NotObject)?.0)
}

fn get_slice<'data, T: object::Pod>(
    data: &'data [u8],
    offset: usize,
    count: usize,
) -> Result<&'data [T]> {
    let bytes = data.get(offset..).ok_or(LinkError::NotObject)?;
    Ok(object::slice_from_bytes(bytes, count)
        .map_err(|()| LinkError::NotObject)?
        .0)
}

pub(crate) fn cpu_arch_of(cputype: i32) -> Result<CpuArch> {
    match cputype as u32 {
        macho::CPU_TYPE_X86_64 => Ok(CpuArch::X86_64),
        macho::CPU_TYPE_ARM64 => Ok(CpuArch::Aarch64),
        _ => Err(LinkError::UnsupportedCpuArchitecture.into()),
    }
}

pub(crate) fn parse<'data>(
    data: &'data [u8],
    name: String,
    expected_arch: CpuArch,
) -> Result<ObjectFile<'data>> {
    let header: &MachHeader = get_struct(data, 0)?;
    if header.magic.get(object::BigEndian) != macho::MH_MAGIC_64 {
        return Err(LinkError::NotObject.into());
    }
    let cpu_arch = cpu_arch_of(header.cputype.get(E) as i32)?;
    if cpu_arch != expected_arch {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }
    let subsections_via_symbols =
        header.flags.get(E) & macho::MH_SUBSECTIONS_VIA_SYMBOLS != 0;

    let mut sections = Vec::new();
    // Section ordinal (1-based, across all segments) -> our section index.
    let mut section_map: Vec<Option<usize>> = Vec::new();
    let mut raw_sections: Vec<&Section> = Vec::new();
    let mut symtab: Option<(&[Nlist], &'data [u8])> = None;
    let mut dice_raw: &[macho::DataInCodeEntry<LittleEndian>] = &[];

    let mut offset = size_of::<MachHeader>();
    for _ in 0..header.ncmds.get(E) {
        let cmd: &macho::LoadCommand<LittleEndian> = get_struct(data, offset)?;
        match cmd.cmd.get(E) {
            macho::LC_SEGMENT_64 => {
                let seg: &SegmentCommand = get_struct(data, offset)?;
                let sects: &[Section] = get_slice(
                    data,
                    offset + size_of::<SegmentCommand>(),
                    seg.nsects.get(E) as usize,
                )?;
                for sect in sects {
                    raw_sections.push(sect);
                }
            }
            macho::LC_SYMTAB => {
                let st: &macho::SymtabCommand<LittleEndian> = get_struct(data, offset)?;
                let nlists: &[Nlist] =
                    get_slice(data, st.symoff.get(E) as usize, st.nsyms.get(E) as usize)?;
                let strtab = data
                    .get(st.stroff.get(E) as usize..)
                    .and_then(|b| b.get(..st.strsize.get(E) as usize))
                    .ok_or(LinkError::NotObject)?;
                symtab = Some((nlists, strtab));
            }
            macho::LC_DATA_IN_CODE => {
                let le: &macho::LinkeditDataCommand<LittleEndian> = get_struct(data, offset)?;
                dice_raw = get_slice(
                    data,
                    le.dataoff.get(E) as usize,
                    le.datasize.get(E) as usize / size_of::<macho::DataInCodeEntry<LittleEndian>>(),
                )?;
            }
            _ => {}
        }
        offset += cmd.cmdsize.get(E) as usize;
    }

    for sect in &raw_sections {
        let kind = section_kind(sect);
        if kind == SectionKind::Debug {
            section_map.push(None);
            continue;
        }
        let size = sect.size.get(E);
        let data_part = if kind.is_zerofill() {
            SectionData::Zerofill(size)
        } else {
            let start = sect.offset.get(E) as usize;
            SectionData::Bytes(
                data.get(start..start + size as usize)
                    .ok_or(LinkError::NotObject)?,
            )
        };
        section_map.push(Some(sections.len()));
        sections.push(InputSection {
            name: SectionName::macho(trim_name(&sect.segname), trim_name(&sect.sectname)),
            kind,
            alignment: Alignment::from_log2(sect.align.get(E) as u8)?,
            data: data_part,
            relocs: Vec::new(),
            comdat_signature: None,
        });
    }

    let symbols = match symtab {
        Some((nlists, strtab)) => parse_symbols(nlists, strtab, &raw_sections, &section_map)?,
        None => Vec::new(),
    };

    for (ordinal0, sect) in raw_sections.iter().enumerate() {
        let Some(our_index) = section_map[ordinal0] else {
            continue;
        };
        let relocs = parse_relocations(data, sect, cpu_arch, &raw_sections, &section_map)?;
        sections[our_index].relocs = relocs;
    }

    let data_in_code = dice_raw
        .iter()
        .filter_map(|entry| {
            let file_offset = u64::from(entry.offset.get(E));
            raw_sections.iter().enumerate().find_map(|(ordinal0, sect)| {
                let start = u64::from(sect.offset.get(E));
                let our = section_map[ordinal0]?;
                (start..start + sect.size.get(E))
                    .contains(&file_offset)
                    .then(|| DataInCode {
                        section: our,
                        offset_in_section: file_offset - start,
                        length: entry.length.get(E),
                        kind: entry.kind.get(E),
                    })
            })
        })
        .collect();

    Ok(ObjectFile {
        name,
        cpu_arch,
        sections,
        symbols,
        subsections_via_symbols,
        wasm: None,
        data_in_code,
    })
}

pub(crate) fn trim_name(raw: &[u8; 16]) -> &[u8] {
    let end = memchr::memchr(0, raw).unwrap_or(raw.len());
    &raw[..end]
}

fn section_kind(sect: &Section) -> SectionKind {
    let flags = sect.flags.get(E);
    let section_type = flags & macho::SECTION_TYPE;
    let segname = trim_name(&sect.segname);
    let sectname = trim_name(&sect.sectname);

    match section_type {
        macho::S_ZEROFILL | macho::S_GB_ZEROFILL => SectionKind::Zerofill,
        macho::S_CSTRING_LITERALS => SectionKind::Cstring,
        macho::S_THREAD_LOCAL_REGULAR => SectionKind::TlsData,
        macho::S_THREAD_LOCAL_ZEROFILL => SectionKind::TlsBss,
        macho::S_THREAD_LOCAL_VARIABLES => SectionKind::TlsVariables,
        macho::S_MOD_INIT_FUNC_POINTERS => SectionKind::InitPointers,
        macho::S_MOD_TERM_FUNC_POINTERS => SectionKind::FiniPointers,
        _ => {
            if flags & macho::S_ATTR_DEBUG != 0 || segname == b"__DWARF" {
                SectionKind::Debug
            } else if flags & (macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS)
                != 0
            {
                SectionKind::Code
            } else if segname == b"__TEXT" {
                if sectname == b"__cstring" {
                    SectionKind::Cstring
                } else {
                    SectionKind::ReadOnlyData
                }
            } else if segname == b"__DATA" && sectname == b"__const" {
                SectionKind::ReadOnlyData
            } else {
                SectionKind::Data
            }
        }
    }
}

fn parse_symbols<'data>(
    nlists: &[Nlist],
    strtab: &'data [u8],
    raw_sections: &[&Section],
    section_map: &[Option<usize>],
) -> Result<Vec<InputSymbol<'data>>> {
    nlists
        .iter()
        .map(|nlist| {
            let n_type = nlist.n_type;
            let n_desc = nlist.n_desc.get(E);
            let name = str_at(strtab, nlist.n_strx.get(E));
            let mut flags = SymFlags::empty();
            let mut value = nlist.n_value.get(E);
            let mut size = 0;
            let mut section = None;
            let mut common_alignment = None;

            let external = n_type & macho::N_EXT != 0;

            if n_type & macho::N_STAB != 0 {
                flags |= SymFlags::STAB;
            } else {
                match n_type & macho::N_TYPE {
                    macho::N_UNDF => {
                        if external && value != 0 {
                            // Tentative definition: n_value is the size,
                            // alignment lives in the n_desc comm-align bits.
                            flags |= SymFlags::TENTATIVE;
                            size = value;
                            let align_bits = ((n_desc >> 8) & 0xf) as u8;
                            if align_bits != 0 {
                                common_alignment = Some(Alignment::from_log2(align_bits)?);
                            }
                        } else {
                            flags |= SymFlags::UNDEFINED;
                            value = 0;
                        }
                    }
                    macho::N_ABS => flags |= SymFlags::ABSOLUTE,
                    macho::N_INDR => flags |= SymFlags::INDIRECT,
                    macho::N_SECT => {
                        let ordinal = nlist.n_sect as usize;
                        if ordinal == 0 || ordinal > raw_sections.len() {
                            bail!("Symbol has out-of-range section ordinal {ordinal}");
                        }
                        section = section_map[ordinal - 1];
                        // Rebase from object address space to section offset.
                        value -= raw_sections[ordinal - 1].addr.get(E);
                        let sect_flags = raw_sections[ordinal - 1].flags.get(E);
                        if matches!(
                            sect_flags & macho::SECTION_TYPE,
                            macho::S_THREAD_LOCAL_REGULAR
                                | macho::S_THREAD_LOCAL_ZEROFILL
                                | macho::S_THREAD_LOCAL_VARIABLES
                        ) {
                            flags |= SymFlags::TLS;
                        }
                    }
                    other => bail!("Unsupported symbol type {other:#x}"),
                }
            }

            if n_type & macho::N_PEXT != 0 {
                flags |= SymFlags::PRIVATE_EXTERN;
            }
            if n_desc & N_NO_DEAD_STRIP != 0 || n_desc & macho::REFERENCED_DYNAMICALLY != 0 {
                flags |= SymFlags::NO_DEAD_STRIP;
            }

            let binding = if !external {
                Binding::Local
            } else if n_desc & (macho::N_WEAK_DEF | macho::N_WEAK_REF) != 0 {
                Binding::Weak
            } else {
                Binding::Global
            };

            Ok(InputSymbol {
                name,
                value,
                size,
                section,
                binding,
                flags,
                common_alignment,
            })
        })
        .collect()
}

fn parse_relocations(
    data: &[u8],
    sect: &Section,
    cpu_arch: CpuArch,
    raw_sections: &[&Section],
    section_map: &[Option<usize>],
) -> Result<Vec<InputReloc>> {
    let raw: &[RawReloc] = get_slice(
        data,
        sect.reloff.get(E) as usize,
        sect.nreloc.get(E) as usize,
    )?;
    let section_data = {
        let start = sect.offset.get(E) as usize;
        data.get(start..start + sect.size.get(E) as usize)
            .unwrap_or(&[])
    };

    let mut relocs = Vec::with_capacity(raw.len());
    let mut pending_addend: Option<i64> = None;
    let mut pending_subtrahend: Option<u32> = None;

    // ADDEND and SUBTRACTOR entries immediately precede the entry they
    // modify, so iterate in storage order and carry them forward.
    for r in raw.iter() {
        let word1 = r.r_word1.get(E);
        let r_address = r.r_word0.get(E);
        if r_address & macho::R_SCATTERED != 0 {
            bail!("Scattered relocations are not supported");
        }
        let symbolnum = word1 & 0x00ff_ffff;
        let pcrel = (word1 >> 24) & 1 != 0;
        let length = 1u8 << ((word1 >> 25) & 3);
        let is_extern = (word1 >> 27) & 1 != 0;
        let r_type = ((word1 >> 28) & 0xf) as u8;
        let offset = u64::from(r_address);

        let embedded = |len: u8| -> i64 {
            let at = offset as usize;
            match len {
                8 => section_data
                    .get(at..at + 8)
                    .map(|b| i64::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(0),
                4 => section_data
                    .get(at..at + 4)
                    .map(|b| i64::from(i32::from_le_bytes(b.try_into().unwrap())))
                    .unwrap_or(0),
                _ => 0,
            }
        };

        let (kind, extra_addend) = match (cpu_arch, r_type) {
            (CpuArch::X86_64, macho::X86_64_RELOC_UNSIGNED) => (RelocKind::Absolute, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_SIGNED) => (RelocKind::Relative, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_SIGNED_1) => (RelocKind::Relative, 1),
            (CpuArch::X86_64, macho::X86_64_RELOC_SIGNED_2) => (RelocKind::Relative, 2),
            (CpuArch::X86_64, macho::X86_64_RELOC_SIGNED_4) => (RelocKind::Relative, 4),
            (CpuArch::X86_64, macho::X86_64_RELOC_BRANCH) => (RelocKind::Branch, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_GOT_LOAD) => (RelocKind::GotLoad, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_GOT) => (RelocKind::Got, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_TLV) => (RelocKind::TlvLoad, 0),
            (CpuArch::X86_64, macho::X86_64_RELOC_SUBTRACTOR) => {
                pending_subtrahend = Some(symbolnum);
                continue;
            }
            (CpuArch::Aarch64, macho::ARM64_RELOC_UNSIGNED) => (RelocKind::Absolute, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_BRANCH26) => (RelocKind::Branch, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_PAGE21) => (RelocKind::Page21, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_PAGEOFF12) => (RelocKind::PageOff12, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_GOT_LOAD_PAGE21) => (RelocKind::GotPage21, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12) => {
                (RelocKind::GotPageOff12, 0)
            }
            (CpuArch::Aarch64, macho::ARM64_RELOC_POINTER_TO_GOT) => (RelocKind::PointerToGot, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_TLVP_LOAD_PAGE21) => (RelocKind::TlvPage21, 0),
            (CpuArch::Aarch64, macho::ARM64_RELOC_TLVP_LOAD_PAGEOFF12) => {
                (RelocKind::TlvPageOff12, 0)
            }
            (CpuArch::Aarch64, macho::ARM64_RELOC_SUBTRACTOR) => {
                pending_subtrahend = Some(symbolnum);
                continue;
            }
            (CpuArch::Aarch64, macho::ARM64_RELOC_ADDEND) => {
                pending_addend = Some(i64::from(symbolnum as i32));
                continue;
            }
            (_, other) => bail!("Unsupported Mach-O relocation type {other}"),
        };

        let mut addend = pending_addend.take().unwrap_or(0);
        // x86-64 embeds addends in the instruction stream; aarch64 carries
        // them in ADDEND entries (handled above) for everything but data.
        let has_embedded = match cpu_arch {
            CpuArch::X86_64 => matches!(
                kind,
                RelocKind::Absolute | RelocKind::Relative | RelocKind::Branch
            ),
            _ => kind == RelocKind::Absolute,
        };
        if has_embedded {
            addend += embedded(length) + extra_addend;
        }

        let target = if is_extern {
            RelocTarget::Symbol(symbolnum)
        } else {
            let ordinal = symbolnum as usize;
            if ordinal == 0 || ordinal > raw_sections.len() {
                bail!("Relocation has out-of-range section ordinal {ordinal}");
            }
            let Some(our) = section_map[ordinal - 1] else {
                bail!("Relocation against dropped section");
            };
            // The embedded value was an address in the object's own address
            // space; rebase it to an offset within the target section.
            addend -= raw_sections[ordinal - 1].addr.get(E) as i64;
            RelocTarget::Section(our as u32)
        };

        relocs.push(InputReloc {
            offset,
            target,
            kind,
            addend,
            length,
            pcrel,
            subtrahend: pending_subtrahend.take(),
        });
    }

    relocs.sort_by_key(|r| r.offset);
    Ok(relocs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_name() {
        let mut raw = [0u8; 16];
        raw[..6].copy_from_slice(b"__text");
        assert_eq!(trim_name(&raw), b"__text");
        let full = *b"0123456789abcdef";
        assert_eq!(trim_name(&full), b"0123456789abcdef");
    }
}
