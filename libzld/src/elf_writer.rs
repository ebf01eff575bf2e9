//! S7 for ELF: section contents, then program headers, then the section
//! header table, then the patched ELF header. Uses the raw header structs
//! from the `object` crate and writes them with `bytes_of`.

use crate::args::CpuArch;
use crate::args::OutputMode;
use crate::error::Result;
use crate::file_writer::SizedOutput;
use crate::object_file::SectionKind;
use crate::output_section_id::OutputSections;
use crate::output_section_id::VM_PROT_EXECUTE;
use crate::output_section_id::VM_PROT_WRITE;
use crate::reloc_writer::LinkContext;
use crate::string_table::StringTable;
use crate::symbol::SymbolName;
use crate::symbol_db::Definition;
use object::LittleEndian;
use object::elf;

const E: LittleEndian = LittleEndian;

type FileHeader = elf::FileHeader64<LittleEndian>;
type ProgramHeader = elf::ProgramHeader64<LittleEndian>;
type SectionHeader = elf::SectionHeader64<LittleEndian>;
type Sym = elf::Sym64<LittleEndian>;

const EHDR_SIZE: u64 = size_of::<FileHeader>() as u64;
const PHDR_SIZE: u64 = size_of::<ProgramHeader>() as u64;
const SHDR_SIZE: u64 = size_of::<SectionHeader>() as u64;
const SYM_SIZE: u64 = size_of::<Sym>() as u64;

struct SymtabEntry {
    name: Vec<u8>,
    value: u64,
    size: u64,
    info: u8,
    shndx: u16,
}

#[tracing::instrument(skip_all, name = "Write ELF output")]
pub(crate) fn write(ctx: &LinkContext, output_sections: &OutputSections) -> Result {
    let layout = ctx.layout;
    let opts = ctx.opts;

    let (locals, globals) = build_symtab(ctx)?;
    let mut strtab = StringTable::new();
    for entry in locals.iter().chain(globals.iter()) {
        strtab.intern(&entry.name);
    }

    let num_symbols = 1 + locals.len() + globals.len();
    let symtab_offset = layout.content_end_file_offset.next_multiple_of(8);
    let symtab_size = num_symbols as u64 * SYM_SIZE;
    let strtab_offset = symtab_offset + symtab_size;

    // Section header string table and the table itself close out the file.
    let mut shstrtab = StringTable::new();
    for section in &layout.sections {
        shstrtab.intern(&output_sections.def(section.id).name);
    }
    for name in [".symtab", ".strtab", ".shstrtab"] {
        shstrtab.intern_str(name);
    }
    let shstrtab_offset = strtab_offset + strtab.len() as u64;
    let shoff = (shstrtab_offset + shstrtab.len() as u64).next_multiple_of(8);
    let shnum = layout.sections.len() as u64 + 4; // null + our 3 tables
    let file_size = shoff + shnum * SHDR_SIZE;

    let mut output = SizedOutput::create(&opts.emit.full_path(), file_size)?;
    let out = &mut output.out;

    write_section_contents(ctx, out)?;

    // Symbol table.
    {
        let mut at = symtab_offset as usize;
        at += SYM_SIZE as usize; // null symbol
        for entry in locals.iter().chain(globals.iter()) {
            let sym = Sym {
                st_name: object::U32::new(E, strtab.intern(&entry.name)),
                st_info: entry.info,
                st_other: 0,
                st_shndx: object::U16::new(E, entry.shndx),
                st_value: object::U64::new(E, entry.value),
                st_size: object::U64::new(E, entry.size),
            };
            out[at..at + SYM_SIZE as usize].copy_from_slice(object::bytes_of(&sym));
            at += SYM_SIZE as usize;
        }
    }
    let strtab_end = strtab_offset as usize + strtab.len();
    out[strtab_offset as usize..strtab_end].copy_from_slice(strtab.as_bytes());
    let shstrtab_end = shstrtab_offset as usize + shstrtab.len();
    out[shstrtab_offset as usize..shstrtab_end].copy_from_slice(shstrtab.as_bytes());

    let phnum = write_program_headers(ctx, output_sections, out)?;
    let strtab_len = strtab.len() as u64;
    let shstrtab_len = shstrtab.len() as u64;
    write_section_headers(
        ctx,
        output_sections,
        &mut shstrtab,
        out,
        shoff,
        symtab_offset,
        num_symbols as u64,
        locals.len() as u64 + 1,
        strtab_offset,
        strtab_len,
        shstrtab_offset,
        shstrtab_len,
    )?;

    write_file_header(ctx, out, phnum, shoff, shnum as u16)?;

    output.finish(opts.is_exe())?;
    Ok(())
}

fn write_section_contents(ctx: &LinkContext, out: &mut [u8]) -> Result {
    for section in &ctx.layout.sections {
        if section.is_zerofill {
            continue;
        }
        let mut cursor = section.first_atom;
        while !cursor.is_null() {
            let atom = ctx.graph.pool.get(cursor);
            if let Some(bytes) = atom.data.bytes() {
                let start = (section.file_offset + (atom.address - section.vmaddr)) as usize;
                let end = start + bytes.len();
                out[start..end].copy_from_slice(bytes);
                ctx.apply_relocations(cursor, &mut out[start..end])?;
            }
            cursor = atom.next;
        }
    }
    Ok(())
}

fn write_program_headers(
    ctx: &LinkContext,
    output_sections: &OutputSections,
    out: &mut [u8],
) -> Result<u16> {
    let mut headers: Vec<ProgramHeader> = Vec::new();
    let page: u64 = 0x1000;

    for segment in &ctx.layout.segments {
        let mut flags = elf::PF_R;
        if segment.protection.0 & VM_PROT_WRITE != 0 {
            flags |= elf::PF_W;
        }
        if segment.protection.0 & VM_PROT_EXECUTE != 0 {
            flags |= elf::PF_X;
        }
        headers.push(ProgramHeader {
            p_type: object::U32::new(E, elf::PT_LOAD),
            p_flags: object::U32::new(E, flags),
            p_offset: object::U64::new(E, segment.file_offset),
            p_vaddr: object::U64::new(E, segment.vmaddr),
            p_paddr: object::U64::new(E, segment.vmaddr),
            p_filesz: object::U64::new(E, segment.file_size),
            p_memsz: object::U64::new(E, segment.vmsize),
            p_align: object::U64::new(E, page),
        });
    }

    if let Some(tls) = ctx.layout.tls {
        // Cover the tdata file range and the full tbss memory range.
        let mut file_offset = 0;
        let mut file_size = 0;
        let mut max_align = 1;
        for section in &ctx.layout.sections {
            let kind = output_sections.def(section.id).kind;
            if kind == SectionKind::TlsData {
                file_offset = section.file_offset;
                file_size += section.size;
            }
            if matches!(kind, SectionKind::TlsData | SectionKind::TlsBss) {
                max_align = max_align.max(section.alignment.value());
            }
        }
        headers.push(ProgramHeader {
            p_type: object::U32::new(E, elf::PT_TLS),
            p_flags: object::U32::new(E, elf::PF_R),
            p_offset: object::U64::new(E, file_offset),
            p_vaddr: object::U64::new(E, tls.start),
            p_paddr: object::U64::new(E, tls.start),
            p_filesz: object::U64::new(E, file_size),
            p_memsz: object::U64::new(E, tls.end_aligned - tls.start),
            p_align: object::U64::new(E, max_align),
        });
    }

    headers.push(ProgramHeader {
        p_type: object::U32::new(E, elf::PT_GNU_STACK),
        p_flags: object::U32::new(E, elf::PF_R | elf::PF_W),
        p_offset: object::U64::new(E, 0),
        p_vaddr: object::U64::new(E, 0),
        p_paddr: object::U64::new(E, 0),
        p_filesz: object::U64::new(E, 0),
        p_memsz: object::U64::new(E, ctx.opts.stack_size.unwrap_or(0)),
        p_align: object::U64::new(E, 0),
    });

    let reserved = (ctx.layout.header_size - EHDR_SIZE) / PHDR_SIZE;
    if headers.len() as u64 > reserved {
        anyhow::bail!(
            "Reserved space for {reserved} program headers, need {}",
            headers.len()
        );
    }

    let mut at = EHDR_SIZE as usize;
    for header in &headers {
        out[at..at + PHDR_SIZE as usize].copy_from_slice(object::bytes_of(header));
        at += PHDR_SIZE as usize;
    }
    Ok(headers.len() as u16)
}

#[allow(clippy::too_many_arguments)]
fn write_section_headers(
    ctx: &LinkContext,
    output_sections: &OutputSections,
    shstrtab: &mut StringTable,
    out: &mut [u8],
    shoff: u64,
    symtab_offset: u64,
    num_symbols: u64,
    first_global: u64,
    strtab_offset: u64,
    strtab_size: u64,
    shstrtab_offset: u64,
    shstrtab_size: u64,
) -> Result {
    let mut at = shoff as usize;
    let mut write_header = |header: SectionHeader, at: &mut usize| {
        out[*at..*at + SHDR_SIZE as usize].copy_from_slice(object::bytes_of(&header));
        *at += SHDR_SIZE as usize;
    };

    write_header(null_section_header(), &mut at);

    for section in &ctx.layout.sections {
        let def = output_sections.def(section.id);
        let (sh_type, mut sh_flags) = match def.kind {
            SectionKind::Code => (elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            SectionKind::ReadOnlyData | SectionKind::Cstring => (elf::SHT_PROGBITS, elf::SHF_ALLOC),
            SectionKind::Data | SectionKind::TlsVariables => {
                (elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE)
            }
            SectionKind::Zerofill => (elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE),
            SectionKind::TlsData => (
                elf::SHT_PROGBITS,
                elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
            ),
            SectionKind::TlsBss => (
                elf::SHT_NOBITS,
                elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
            ),
            SectionKind::InitPointers => (elf::SHT_INIT_ARRAY, elf::SHF_ALLOC | elf::SHF_WRITE),
            SectionKind::FiniPointers => (elf::SHT_FINI_ARRAY, elf::SHF_ALLOC | elf::SHF_WRITE),
            SectionKind::Note => (elf::SHT_NOTE, elf::SHF_ALLOC),
            SectionKind::Debug | SectionKind::Other => (elf::SHT_PROGBITS, 0),
        };
        if section.id == crate::output_section_id::GOT {
            sh_flags = elf::SHF_ALLOC | elf::SHF_WRITE;
        }
        write_header(
            SectionHeader {
                sh_name: object::U32::new(E, shstrtab.intern(&def.name)),
                sh_type: object::U32::new(E, sh_type),
                sh_flags: object::U64::new(E, u64::from(sh_flags)),
                sh_addr: object::U64::new(E, section.vmaddr),
                sh_offset: object::U64::new(E, section.file_offset),
                sh_size: object::U64::new(E, section.size),
                sh_link: object::U32::new(E, 0),
                sh_info: object::U32::new(E, 0),
                sh_addralign: object::U64::new(E, section.alignment.value()),
                sh_entsize: object::U64::new(E, 0),
            },
            &mut at,
        );
    }

    let strtab_index = ctx.layout.sections.len() as u32 + 2;
    write_header(
        SectionHeader {
            sh_name: object::U32::new(E, shstrtab.intern_str(".symtab")),
            sh_type: object::U32::new(E, elf::SHT_SYMTAB),
            sh_flags: object::U64::new(E, 0),
            sh_addr: object::U64::new(E, 0),
            sh_offset: object::U64::new(E, symtab_offset),
            sh_size: object::U64::new(E, num_symbols * SYM_SIZE),
            sh_link: object::U32::new(E, strtab_index),
            sh_info: object::U32::new(E, first_global as u32),
            sh_addralign: object::U64::new(E, 8),
            sh_entsize: object::U64::new(E, SYM_SIZE),
        },
        &mut at,
    );
    write_header(
        SectionHeader {
            sh_name: object::U32::new(E, shstrtab.intern_str(".strtab")),
            sh_type: object::U32::new(E, elf::SHT_STRTAB),
            sh_flags: object::U64::new(E, 0),
            sh_addr: object::U64::new(E, 0),
            sh_offset: object::U64::new(E, strtab_offset),
            sh_size: object::U64::new(E, strtab_size),
            sh_link: object::U32::new(E, 0),
            sh_info: object::U32::new(E, 0),
            sh_addralign: object::U64::new(E, 1),
            sh_entsize: object::U64::new(E, 0),
        },
        &mut at,
    );
    write_header(
        SectionHeader {
            sh_name: object::U32::new(E, shstrtab.intern_str(".shstrtab")),
            sh_type: object::U32::new(E, elf::SHT_STRTAB),
            sh_flags: object::U64::new(E, 0),
            sh_addr: object::U64::new(E, 0),
            sh_offset: object::U64::new(E, shstrtab_offset),
            sh_size: object::U64::new(E, shstrtab_size),
            sh_link: object::U32::new(E, 0),
            sh_info: object::U32::new(E, 0),
            sh_addralign: object::U64::new(E, 1),
            sh_entsize: object::U64::new(E, 0),
        },
        &mut at,
    );

    Ok(())
}

fn null_section_header() -> SectionHeader {
    SectionHeader {
        sh_name: object::U32::new(E, 0),
        sh_type: object::U32::new(E, elf::SHT_NULL),
        sh_flags: object::U64::new(E, 0),
        sh_addr: object::U64::new(E, 0),
        sh_offset: object::U64::new(E, 0),
        sh_size: object::U64::new(E, 0),
        sh_link: object::U32::new(E, 0),
        sh_info: object::U32::new(E, 0),
        sh_addralign: object::U64::new(E, 0),
        sh_entsize: object::U64::new(E, 0),
    }
}

fn write_file_header(
    ctx: &LinkContext,
    out: &mut [u8],
    phnum: u16,
    shoff: u64,
    shnum: u16,
) -> Result {
    let entry = if ctx.opts.is_exe() {
        ctx.symbol_db
            .lookup(&SymbolName::prehashed(
                ctx.opts.entry_symbol_name().as_bytes(),
            ))
            .map(|index| ctx.symbol_address(global_symbol_ref(ctx, index)))
            .transpose()?
            .unwrap_or(0)
    } else {
        0
    };

    let header = FileHeader {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: object::U16::new(
            E,
            if ctx.opts.output_mode == OutputMode::Lib {
                elf::ET_DYN
            } else {
                elf::ET_EXEC
            },
        ),
        e_machine: object::U16::new(
            E,
            match ctx.opts.target.cpu_arch {
                CpuArch::X86_64 => elf::EM_X86_64,
                CpuArch::Aarch64 => elf::EM_AARCH64,
                CpuArch::Wasm32 => anyhow::bail!("wasm output uses the wasm writer"),
            },
        ),
        e_version: object::U32::new(E, u32::from(elf::EV_CURRENT)),
        e_entry: object::U64::new(E, entry),
        e_phoff: object::U64::new(E, EHDR_SIZE),
        e_shoff: object::U64::new(E, shoff),
        e_flags: object::U32::new(E, 0),
        e_ehsize: object::U16::new(E, EHDR_SIZE as u16),
        e_phentsize: object::U16::new(E, PHDR_SIZE as u16),
        e_phnum: object::U16::new(E, phnum),
        e_shentsize: object::U16::new(E, SHDR_SIZE as u16),
        e_shnum: object::U16::new(E, shnum),
        e_shstrndx: object::U16::new(E, shnum - 1),
    };
    out[..EHDR_SIZE as usize].copy_from_slice(object::bytes_of(&header));
    Ok(())
}

fn global_symbol_ref(
    ctx: &LinkContext,
    index: crate::symbol_db::GlobalIndex,
) -> crate::symbol::SymbolRef {
    match ctx.symbol_db.global(index).definition {
        Definition::Object { file, sym_index } => crate::symbol::SymbolRef::object(file, sym_index),
        _ => crate::symbol::SymbolRef::synthetic(u32::MAX),
    }
}

/// Splits the emitted symbols into locals-then-globals as the symtab format
/// requires. Locals are the synthetic atom names we don't have (skipped) plus
/// per-file locals, which we don't carry names for; so locals stay minimal.
fn build_symtab(ctx: &LinkContext) -> Result<(Vec<SymtabEntry>, Vec<SymtabEntry>)> {
    let locals = Vec::new();
    let mut globals = Vec::new();

    for (index, global) in ctx.symbol_db.globals.iter().enumerate() {
        let index = crate::symbol_db::GlobalIndex(index as u32);
        let name = global.name.bytes().to_vec();
        match global.definition {
            Definition::Object { file, sym_index } => {
                let sym = &ctx.objects[file.as_usize()].symbols[sym_index as usize];
                let Some((atom, offset)) = crate::layout::atom_for_symbol(
                    ctx.symbol_db,
                    ctx.graph,
                    ctx.synthetics,
                    crate::symbol::SymbolRef::object(file, sym_index),
                ) else {
                    continue;
                };
                if !ctx.graph.pool.get(atom).alive {
                    continue;
                }
                let value = ctx.graph.pool.get(atom).address + offset;
                let bind = if global.weak {
                    elf::STB_WEAK
                } else {
                    elf::STB_GLOBAL
                };
                let kind = if sym.flags.contains(crate::object_file::SymFlags::FUNCTION) {
                    elf::STT_FUNC
                } else if sym.flags.contains(crate::object_file::SymFlags::TLS) {
                    elf::STT_TLS
                } else {
                    elf::STT_OBJECT
                };
                let value = if kind == elf::STT_TLS {
                    value - ctx.layout.tls.map_or(0, |tls| tls.start)
                } else {
                    value
                };
                globals.push(SymtabEntry {
                    name,
                    value,
                    size: sym.size,
                    info: (bind << 4) | kind,
                    shndx: section_index_for_atom(ctx, atom),
                });
            }
            Definition::Tentative { size, .. } => {
                let Some(&atom) = ctx.synthetics.tentative.get(&index) else {
                    continue;
                };
                globals.push(SymtabEntry {
                    name,
                    value: ctx.graph.pool.get(atom).address,
                    size,
                    info: (elf::STB_GLOBAL << 4) | elf::STT_OBJECT,
                    shndx: section_index_for_atom(ctx, atom),
                });
            }
            Definition::Dylib { .. } | Definition::FlatLookup => {
                globals.push(SymtabEntry {
                    name,
                    value: 0,
                    size: 0,
                    info: (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE,
                    shndx: elf::SHN_UNDEF,
                });
            }
            _ => {}
        }
    }

    Ok((locals, globals))
}

fn section_index_for_atom(ctx: &LinkContext, atom: crate::atom::AtomIndex) -> u16 {
    let section_id = ctx.graph.pool.get(atom).output_section;
    ctx.layout
        .sections
        .iter()
        .position(|section| section.id == section_id)
        .map_or(elf::SHN_ABS, |index| index as u16 + 1)
}
