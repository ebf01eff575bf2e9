//! Parsing of 64-bit little-endian ELF relocatable objects into the common
//! `ObjectFile` shape. We work directly on the raw header structs from the
//! `object` crate; the file's bytes are kept mapped for the duration of the
//! link so all slices borrow from them.

use crate::args::CpuArch;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::alignment::Alignment;
use crate::object_file::Binding;
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
use object::elf;
use object::read::elf::Sym as _;

type FileHeader = elf::FileHeader64<LittleEndian>;
type SectionHeader = elf::SectionHeader64<LittleEndian>;
type Sym = elf::Sym64<LittleEndian>;
type Rela = elf::Rela64<LittleEndian>;

const E: LittleEndian = LittleEndian;

pub(crate) fn parse<'data>(
    data: &'data [u8],
    name: String,
    expected_arch: CpuArch,
) -> Result<ObjectFile<'data>> {
    let header: &FileHeader = object::from_bytes(
        data.get(..size_of::<FileHeader>())
            .ok_or(LinkError::NotObject)?,
    )
    .map_err(|()| LinkError::NotObject)?
    .0;

    let cpu_arch = match header.e_machine.get(E) {
        elf::EM_X86_64 => CpuArch::X86_64,
        elf::EM_AARCH64 => CpuArch::Aarch64,
        _ => return Err(LinkError::UnsupportedCpuArchitecture.into()),
    };
    if cpu_arch != expected_arch {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }

    let shoff = header.e_shoff.get(E) as usize;
    let shnum = header.e_shnum.get(E) as usize;
    let headers: &[SectionHeader] = object::slice_from_bytes(&data[shoff..], shnum)
        .map_err(|()| LinkError::NotObject)?
        .0;

    let shstrtab = section_bytes(data, &headers[header.e_shstrndx.get(E) as usize])?;

    // COMDAT groups: record each grouped section's signature so the atom
    // builder can deduplicate across inputs.
    let mut group_signature_of: Vec<Option<&'data [u8]>> = vec![None; shnum];
    for header in headers {
        if header.sh_type.get(E) != elf::SHT_GROUP {
            continue;
        }
        let content = section_bytes(data, header)?;
        let words: &[object::U32Bytes<LittleEndian>] =
            object::slice_from_bytes(content, content.len() / 4)
                .map_err(|()| LinkError::NotObject)?
                .0;
        if words.first().map(|w| w.get(E)) != Some(elf::GRP_COMDAT) {
            continue;
        }
        let signature = group_signature(data, headers, header)?;
        for member in &words[1..] {
            if let Some(slot) = group_signature_of.get_mut(member.get(E) as usize) {
                *slot = Some(signature);
            }
        }
    }

    let mut sections = Vec::with_capacity(shnum);
    // Input section index -> our section index. Not all input sections become
    // content sections (symtab, strtab, rela and group sections don't).
    let mut section_map: Vec<Option<usize>> = vec![None; shnum];

    for (index, sh) in headers.iter().enumerate() {
        let sh_type = sh.sh_type.get(E);
        let keep = matches!(
            sh_type,
            elf::SHT_PROGBITS
                | elf::SHT_NOBITS
                | elf::SHT_INIT_ARRAY
                | elf::SHT_FINI_ARRAY
                | elf::SHT_PREINIT_ARRAY
                | elf::SHT_NOTE
        );
        if !keep {
            continue;
        }
        let name = str_at(shstrtab, sh.sh_name.get(E));
        let kind = section_kind(sh_type, sh.sh_flags.get(E), name);
        let data_part = if sh_type == elf::SHT_NOBITS {
            SectionData::Zerofill(sh.sh_size.get(E))
        } else {
            SectionData::Bytes(section_bytes(data, sh)?)
        };
        section_map[index] = Some(sections.len());
        sections.push(InputSection {
            name: SectionName::elf(name),
            kind,
            alignment: Alignment::new(sh.sh_addralign.get(E).max(1))?,
            data: data_part,
            relocs: Vec::new(),
            comdat_signature: group_signature_of[index],
        });
    }

    let symbols = parse_symbols(data, headers, &section_map, &name)?;
    parse_relocations(
        data,
        headers,
        &section_map,
        &mut sections,
        &symbols,
        cpu_arch,
        &name,
    )?;

    Ok(ObjectFile {
        name,
        cpu_arch,
        sections,
        symbols,
        // ELF compilers emit one function/object per section or use distinct
        // symbols with sizes, so splitting on symbol boundaries is always
        // sound for the section kinds we keep.
        subsections_via_symbols: true,
        wasm: None,
        data_in_code: Vec::new(),
    })
}

fn section_bytes<'data>(data: &'data [u8], sh: &SectionHeader) -> Result<&'data [u8]> {
    if sh.sh_type.get(E) == elf::SHT_NOBITS {
        return Ok(&[]);
    }
    let start = sh.sh_offset.get(E) as usize;
    let size = sh.sh_size.get(E) as usize;
    data.get(start..start + size)
        .ok_or_else(|| LinkError::NotObject.into())
}

pub(crate) fn str_at(strtab: &[u8], offset: u32) -> &[u8] {
    let start = offset as usize;
    if start >= strtab.len() {
        return &[];
    }
    let rest = &strtab[start..];
    let end = memchr::memchr(0, rest).unwrap_or(rest.len());
    &rest[..end]
}

fn section_kind(sh_type: u32, sh_flags: u64, name: &[u8]) -> SectionKind {
    let flags = sh_flags;
    let is_alloc = flags & u64::from(elf::SHF_ALLOC) != 0;
    let is_write = flags & u64::from(elf::SHF_WRITE) != 0;
    let is_exec = flags & u64::from(elf::SHF_EXECINSTR) != 0;
    let is_tls = flags & u64::from(elf::SHF_TLS) != 0;
    let is_strings = flags & u64::from(elf::SHF_STRINGS) != 0;

    match sh_type {
        elf::SHT_NOBITS if is_tls => SectionKind::TlsBss,
        elf::SHT_NOBITS => SectionKind::Zerofill,
        elf::SHT_INIT_ARRAY | elf::SHT_PREINIT_ARRAY => SectionKind::InitPointers,
        elf::SHT_FINI_ARRAY => SectionKind::FiniPointers,
        elf::SHT_NOTE => SectionKind::Note,
        _ if !is_alloc => {
            if name.starts_with(b".debug") {
                SectionKind::Debug
            } else {
                SectionKind::Other
            }
        }
        _ if is_exec => SectionKind::Code,
        _ if is_tls => SectionKind::TlsData,
        _ if is_write => SectionKind::Data,
        _ if is_strings => SectionKind::Cstring,
        _ => SectionKind::ReadOnlyData,
    }
}

fn group_signature<'data>(
    data: &'data [u8],
    headers: &[SectionHeader],
    group: &SectionHeader,
) -> Result<&'data [u8]> {
    let symtab = headers
        .get(group.sh_link.get(E) as usize)
        .context("SHT_GROUP sh_link out of range")?;
    let strtab = section_bytes(
        data,
        headers
            .get(symtab.sh_link.get(E) as usize)
            .context("symtab sh_link out of range")?,
    )?;
    let syms: &[Sym] = object::slice_from_bytes(
        section_bytes(data, symtab)?,
        symtab.sh_size.get(E) as usize / size_of::<Sym>(),
    )
    .map_err(|()| LinkError::NotObject)?
    .0;
    let sym = syms
        .get(group.sh_info.get(E) as usize)
        .context("SHT_GROUP sh_info out of range")?;
    Ok(str_at(strtab, sym.st_name.get(E)))
}

fn parse_symbols<'data>(
    data: &'data [u8],
    headers: &[SectionHeader],
    section_map: &[Option<usize>],
    file_name: &str,
) -> Result<Vec<InputSymbol<'data>>> {
    let Some(symtab) = headers
        .iter()
        .find(|sh| sh.sh_type.get(E) == elf::SHT_SYMTAB)
    else {
        return Ok(Vec::new());
    };
    let strtab = section_bytes(
        data,
        headers
            .get(symtab.sh_link.get(E) as usize)
            .context("symtab sh_link out of range")?,
    )?;
    let count = symtab.sh_size.get(E) as usize / size_of::<Sym>();
    let syms: &[Sym] = object::slice_from_bytes(section_bytes(data, symtab)?, count)
        .map_err(|()| LinkError::NotObject)?
        .0;

    syms.iter()
        .map(|sym| {
            let shndx = sym.st_shndx.get(E);
            let bind = sym.st_bind();
            let kind = sym.st_type();
            let mut flags = SymFlags::empty();
            let mut value = sym.st_value.get(E);
            let mut common_alignment = None;
            let mut section = None;

            match shndx {
                elf::SHN_UNDEF => flags |= SymFlags::UNDEFINED,
                elf::SHN_ABS => flags |= SymFlags::ABSOLUTE,
                elf::SHN_COMMON => {
                    flags |= SymFlags::TENTATIVE;
                    // For COMMON symbols st_value holds the alignment.
                    common_alignment = Some(Alignment::new(value.max(1))?);
                    value = sym.st_size.get(E);
                }
                _ => {
                    section = section_map
                        .get(shndx as usize)
                        .copied()
                        .flatten();
                    if section.is_none() && kind != elf::STT_SECTION {
                        // Defined in a section we dropped (e.g. .comment).
                        // Treat as absolute zero; nothing should reference it.
                        flags |= SymFlags::ABSOLUTE;
                        value = 0;
                    }
                }
            }

            if kind == elf::STT_TLS {
                flags |= SymFlags::TLS;
            }
            if kind == elf::STT_FUNC {
                flags |= SymFlags::FUNCTION;
            }
            let visibility = sym.st_other & 0x3;
            if visibility == elf::STV_HIDDEN || visibility == elf::STV_INTERNAL {
                flags |= SymFlags::PRIVATE_EXTERN;
            }

            let binding = match bind {
                elf::STB_LOCAL => Binding::Local,
                elf::STB_WEAK => Binding::Weak,
                elf::STB_GLOBAL | elf::STB_GNU_UNIQUE => Binding::Global,
                other => bail!("Unsupported symbol binding {other} in `{file_name}`"),
            };

            Ok(InputSymbol {
                name: str_at(strtab, sym.st_name.get(E)),
                value,
                size: sym.st_size.get(E),
                section,
                binding,
                flags,
                common_alignment,
            })
        })
        .collect()
}

fn parse_relocations<'data>(
    data: &'data [u8],
    headers: &[SectionHeader],
    section_map: &[Option<usize>],
    sections: &mut [InputSection<'data>],
    symbols: &[InputSymbol<'data>],
    cpu_arch: CpuArch,
    file_name: &str,
) -> Result {
    for sh in headers {
        match sh.sh_type.get(E) {
            elf::SHT_RELA => {}
            elf::SHT_REL => {
                // Implicit addends would need decoding from the instruction
                // bytes. Nothing we accept produces them for x86-64/aarch64.
                let Some(&Some(target)) = section_map.get(sh.sh_info.get(E) as usize) else {
                    continue;
                };
                bail!(
                    "`{file_name}`: SHT_REL relocations against `{}` are not supported; \
                     re-assemble with RELA",
                    sections[target].name,
                );
            }
            _ => continue,
        }
        let Some(&Some(target_section)) = section_map.get(sh.sh_info.get(E) as usize) else {
            continue;
        };
        let count = sh.sh_size.get(E) as usize / size_of::<Rela>();
        let relas: &[Rela] = object::slice_from_bytes(section_bytes(data, sh)?, count)
            .map_err(|()| LinkError::NotObject)?
            .0;

        let relocs = &mut sections[target_section].relocs;
        relocs.reserve(count);
        for rela in relas {
            let sym_index = rela.r_sym(E, false);
            let r_type = rela.r_type(E, false);
            let (kind, length, pcrel) = match cpu_arch {
                CpuArch::X86_64 => translate_x86_64(r_type)
                    .with_context(|| format!("`{file_name}`: unsupported relocation {r_type}"))?,
                CpuArch::Aarch64 => translate_aarch64(r_type)
                    .with_context(|| format!("`{file_name}`: unsupported relocation {r_type}"))?,
                CpuArch::Wasm32 => bail!("wasm objects don't use ELF relocations"),
            };
            // References through section symbols become section-relative so
            // that atoms can be re-pointed after splitting.
            let target = match symbols.get(sym_index as usize) {
                Some(sym)
                    if sym.binding == Binding::Local
                        && !sym.is_undefined()
                        && sym.name.is_empty()
                        && sym.section.is_some() =>
                {
                    RelocTarget::Section(sym.section.unwrap() as u32)
                }
                _ => RelocTarget::Symbol(sym_index),
            };
            relocs.push(InputReloc {
                offset: rela.r_offset.get(E),
                target,
                kind,
                addend: rela.r_addend.get(E),
                length,
                pcrel,
                subtrahend: None,
            });
        }
    }
    Ok(())
}

fn translate_x86_64(r_type: u32) -> Result<(RelocKind, u8, bool)> {
    let translated = match r_type {
        elf::R_X86_64_NONE => (RelocKind::None, 0, false),
        elf::R_X86_64_64 => (RelocKind::Absolute, 8, false),
        elf::R_X86_64_32 | elf::R_X86_64_32S => (RelocKind::Absolute, 4, false),
        elf::R_X86_64_PC32 => (RelocKind::Relative, 4, true),
        elf::R_X86_64_PC64 => (RelocKind::Relative, 8, true),
        elf::R_X86_64_PLT32 => (RelocKind::Branch, 4, true),
        elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
            (RelocKind::GotLoad, 4, true)
        }
        elf::R_X86_64_GOTTPOFF => (RelocKind::GotTpOff, 4, true),
        elf::R_X86_64_TPOFF32 => (RelocKind::TpOff, 4, false),
        elf::R_X86_64_DTPOFF32 => (RelocKind::DtpOff, 4, false),
        elf::R_X86_64_DTPOFF64 => (RelocKind::DtpOff, 8, false),
        _ => bail!("Unsupported x86-64 relocation type {r_type}"),
    };
    Ok(translated)
}

fn translate_aarch64(r_type: u32) -> Result<(RelocKind, u8, bool)> {
    let translated = match r_type {
        elf::R_AARCH64_NONE => (RelocKind::None, 0, false),
        elf::R_AARCH64_ABS64 => (RelocKind::Absolute, 8, false),
        elf::R_AARCH64_ABS32 => (RelocKind::Absolute, 4, false),
        elf::R_AARCH64_PREL64 => (RelocKind::Relative, 8, true),
        elf::R_AARCH64_PREL32 => (RelocKind::Relative, 4, true),
        elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => (RelocKind::Branch, 4, true),
        elf::R_AARCH64_ADR_PREL_PG_HI21 => (RelocKind::Page21, 4, true),
        elf::R_AARCH64_ADD_ABS_LO12_NC
        | elf::R_AARCH64_LDST8_ABS_LO12_NC
        | elf::R_AARCH64_LDST16_ABS_LO12_NC
        | elf::R_AARCH64_LDST32_ABS_LO12_NC
        | elf::R_AARCH64_LDST64_ABS_LO12_NC
        | elf::R_AARCH64_LDST128_ABS_LO12_NC => (RelocKind::PageOff12, 4, false),
        elf::R_AARCH64_ADR_GOT_PAGE => (RelocKind::GotPage21, 4, true),
        elf::R_AARCH64_LD64_GOT_LO12_NC => (RelocKind::GotPageOff12, 4, false),
        elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => (RelocKind::GotPage21, 4, true),
        elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => (RelocKind::GotPageOff12, 4, false),
        elf::R_AARCH64_TLSLE_ADD_TPREL_HI12 => (RelocKind::TpOffHi12, 4, false),
        elf::R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => (RelocKind::TpOffLo12, 4, false),
        _ => bail!("Unsupported aarch64 relocation type {r_type}"),
    };
    Ok(translated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_at() {
        let strtab = b"\0hello\0world\0";
        assert_eq!(str_at(strtab, 1), b"hello");
        assert_eq!(str_at(strtab, 7), b"world");
        assert_eq!(str_at(strtab, 0), b"");
        assert_eq!(str_at(strtab, 100), b"");
    }

    #[test]
    fn test_section_kind_mapping() {
        let alloc_exec = u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        assert_eq!(
            section_kind(elf::SHT_PROGBITS, alloc_exec, b".text"),
            SectionKind::Code
        );
        let alloc_write = u64::from(elf::SHF_ALLOC | elf::SHF_WRITE);
        assert_eq!(
            section_kind(elf::SHT_PROGBITS, alloc_write, b".data"),
            SectionKind::Data
        );
        assert_eq!(
            section_kind(elf::SHT_NOBITS, alloc_write, b".bss"),
            SectionKind::Zerofill
        );
        assert_eq!(
            section_kind(
                elf::SHT_NOBITS,
                alloc_write | u64::from(elf::SHF_TLS),
                b".tbss"
            ),
            SectionKind::TlsBss
        );
        assert_eq!(
            section_kind(elf::SHT_PROGBITS, 0, b".debug_info"),
            SectionKind::Debug
        );
    }

    #[test]
    fn test_translate_x86_64_got_family_unifies() {
        for r_type in [
            elf::R_X86_64_GOTPCREL,
            elf::R_X86_64_GOTPCRELX,
            elf::R_X86_64_REX_GOTPCRELX,
        ] {
            assert_eq!(
                translate_x86_64(r_type).unwrap(),
                (RelocKind::GotLoad, 4, true)
            );
        }
    }
}
