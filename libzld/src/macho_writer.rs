//! S7 for Mach-O: section contents, the `__LINKEDIT` streams in their fixed
//! order (rebase, bind, lazy bind, export trie, function starts,
//! data-in-code, symtab, strtab, indirect symtab), load commands, the UUID,
//! and finally the ad-hoc code signature.

use crate::args::Abi;
use crate::args::CpuArch;
use crate::args::OsTag;
use crate::args::OutputMode;
use crate::atom::AtomIndex;
use crate::code_signature;
use crate::dyld_info;
use crate::dyld_info::BindEntry;
use crate::error::Result;
use crate::file_writer::SizedOutput;
use crate::layout::SectionLayout;
use crate::leb128::write_uleb128;
use crate::object_file::SymFlags;
use crate::output_section_id;
use crate::output_section_id::OutputSections;
use crate::reloc_writer::LinkContext;
use crate::string_table::StringTable;
use crate::symbol_db::Definition;
use crate::symbol_db::GlobalIndex;
use crate::synthetic::TargetClass;
use crate::synthetic::TargetKey;
use anyhow::bail;
use md5::Digest as _;
use object::LittleEndian;
use object::macho;

const E: LittleEndian = LittleEndian;

type Nlist = macho::Nlist64<LittleEndian>;

const N_NO_DEAD_STRIP: u16 = 0x0020;
const N_OSO: u8 = 0x66;
const N_FUN: u8 = 0x24;

struct SymtabModel {
    nlists: Vec<Nlist>,
    strtab: StringTable,
    num_stabs: u32,
    num_locals: u32,
    num_externals: u32,
    num_undefs: u32,
    /// strtab byte range holding stab strings, excluded from the UUID.
    stab_string_range: std::ops::Range<usize>,
    /// symtab index per global, for the indirect symbol table.
    global_symtab_index: hashbrown::HashMap<GlobalIndex, u32>,
}

struct LinkeditLayout {
    rebase: Vec<u8>,
    bind: Vec<u8>,
    lazy_bind: Vec<u8>,
    lazy_offsets: Vec<u32>,
    export_trie: Vec<u8>,
    function_starts: Vec<u8>,
    data_in_code: Vec<u8>,
    indirect: Vec<u8>,
}

#[tracing::instrument(skip_all, name = "Write Mach-O output")]
pub(crate) fn write(ctx: &LinkContext, output_sections: &OutputSections) -> Result {
    let opts = ctx.opts;
    let layout = ctx.layout;

    // Dylibs that bound nothing are dropped from the load list; ordinals in
    // the bind streams are renumbered accordingly.
    let mut ordinal_map: Vec<Option<u16>> = Vec::with_capacity(ctx.dylibs.len());
    let mut emitted_dylibs: Vec<usize> = Vec::new();
    {
        let mut next = 1u16;
        for (index, dylib) in ctx.dylibs.iter().enumerate() {
            if opts.dead_strip_dylibs && !dylib.referenced && !dylib.needed {
                ordinal_map.push(None);
            } else {
                ordinal_map.push(Some(next));
                emitted_dylibs.push(index);
                next += 1;
            }
        }
    }

    let symtab = build_symtab(ctx, &ordinal_map)?;
    let linkedit = build_linkedit(ctx, &symtab, &ordinal_map)?;

    // __LINKEDIT stream offsets, in emission order.
    let linkedit_start = layout.content_end_file_offset;
    let mut at = linkedit_start;
    let mut place = |len: usize, align: u64| {
        at = at.next_multiple_of(align);
        let start = at;
        at += len as u64;
        start
    };
    let rebase_off = place(linkedit.rebase.len(), 8);
    let bind_off = place(linkedit.bind.len(), 8);
    let lazy_bind_off = place(linkedit.lazy_bind.len(), 8);
    let export_off = place(linkedit.export_trie.len(), 8);
    let function_starts_off = place(linkedit.function_starts.len(), 8);
    let data_in_code_off = place(linkedit.data_in_code.len(), 8);
    let symtab_off = place(symtab.nlists.len() * size_of::<Nlist>(), 8);
    let strtab_off = place(symtab.strtab.len(), 8);
    let indirect_off = place(linkedit.indirect.len(), 8);

    let needs_signature = (opts.target.cpu_arch == CpuArch::Aarch64
        && matches!(opts.target.os_tag, OsTag::Macos)
        || opts.target.abi == Abi::Simulator)
        || opts.entitlements.is_some();
    let identifier = opts
        .emit
        .sub_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a.out".to_owned());

    let codesig_off = at.next_multiple_of(16);
    let codesig_size = if needs_signature {
        code_signature::signature_size(codesig_off, &identifier)
    } else {
        0
    };
    let file_size = codesig_off + codesig_size;

    let mut output = SizedOutput::create(&opts.emit.full_path(), file_size)?;
    let out = &mut output.out;

    write_section_contents(ctx, out)?;
    patch_stub_helpers(ctx, out, &linkedit.lazy_offsets)?;

    // Linkedit streams.
    copy_into(out, rebase_off, &linkedit.rebase);
    copy_into(out, bind_off, &linkedit.bind);
    copy_into(out, lazy_bind_off, &linkedit.lazy_bind);
    copy_into(out, export_off, &linkedit.export_trie);
    copy_into(out, function_starts_off, &linkedit.function_starts);
    copy_into(out, data_in_code_off, &linkedit.data_in_code);
    let symtab_bytes: Vec<u8> = symtab
        .nlists
        .iter()
        .flat_map(|nlist| object::bytes_of(nlist).to_vec())
        .collect();
    copy_into(out, symtab_off, &symtab_bytes);
    copy_into(out, strtab_off, symtab.strtab.as_bytes());
    copy_into(out, indirect_off, &linkedit.indirect);

    // Load commands.
    let commands = CommandOffsets {
        rebase_off,
        rebase_size: linkedit.rebase.len() as u32,
        bind_off,
        bind_size: linkedit.bind.len() as u32,
        lazy_bind_off,
        lazy_bind_size: linkedit.lazy_bind.len() as u32,
        export_off,
        export_size: linkedit.export_trie.len() as u32,
        function_starts_off,
        function_starts_size: linkedit.function_starts.len() as u32,
        data_in_code_off,
        data_in_code_size: linkedit.data_in_code.len() as u32,
        symtab_off,
        strtab_off,
        strtab_size: symtab.strtab.len() as u32,
        indirect_off,
        num_indirect: (linkedit.indirect.len() / 4) as u32,
        codesig_off,
        codesig_size,
        linkedit_start,
        file_size,
    };
    let uuid_ranges = write_load_commands(
        ctx,
        output_sections,
        out,
        &symtab,
        &commands,
        &emitted_dylibs,
        needs_signature,
    )?;

    // UUID: MD5 over the file with the identity-dependent regions excluded,
    // then stamped with the RFC 4122 version/variant bits.
    let mut excluded = uuid_ranges.excluded;
    excluded.push(codesig_off as usize..file_size as usize);
    if symtab.num_stabs > 0 {
        let stab_bytes = symtab.num_stabs as usize * size_of::<Nlist>();
        excluded.push(symtab_off as usize..symtab_off as usize + stab_bytes);
        excluded.push(
            strtab_off as usize + symtab.stab_string_range.start
                ..strtab_off as usize + symtab.stab_string_range.end,
        );
    }
    let uuid = compute_uuid(out, &excluded);
    let uuid_at = uuid_ranges.uuid_payload_offset;
    out[uuid_at..uuid_at + 16].copy_from_slice(uuid.as_bytes());

    if needs_signature {
        let signature = code_signature::build_signature(
            &out[..codesig_off as usize],
            &identifier,
            layout
                .segments
                .first()
                .map_or(0, |segment| segment.file_size + layout.header_size),
            opts.is_exe(),
        );
        copy_into(out, codesig_off, &signature);
    }

    output.finish(opts.is_exe())?;
    Ok(())
}

fn copy_into(out: &mut [u8], offset: u64, bytes: &[u8]) {
    out[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
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

/// Each stub helper entry carries the offset of its record in the lazy-bind
/// stream: an immediate on x86-64, a trailing word on aarch64.
fn patch_stub_helpers(ctx: &LinkContext, out: &mut [u8], lazy_offsets: &[u32]) -> Result {
    let Some(section) = ctx
        .layout
        .section_by_id(output_section_id::STUB_HELPER)
    else {
        return Ok(());
    };
    for (index, &(_, helper_atom)) in ctx.synthetics.stub_helpers.order.iter().enumerate() {
        let atom = ctx.graph.pool.get(helper_atom);
        let file_at = section.file_offset + (atom.address - section.vmaddr);
        let imm_at = match ctx.opts.target.cpu_arch {
            CpuArch::X86_64 => file_at + 1,
            _ => file_at + 8,
        } as usize;
        out[imm_at..imm_at + 4].copy_from_slice(&lazy_offsets[index].to_le_bytes());
    }
    Ok(())
}

fn segment_and_offset(ctx: &LinkContext, address: u64) -> Result<(u8, u64)> {
    for (index, segment) in ctx.layout.segments.iter().enumerate() {
        if (segment.vmaddr..segment.vmaddr + segment.vmsize).contains(&address) {
            // dyld segment indexes count __PAGEZERO.
            let dyld_index = index + if ctx.opts.is_exe() { 1 } else { 0 };
            return Ok((dyld_index as u8, address - segment.vmaddr));
        }
    }
    bail!("Address {address:#x} is outside every segment");
}

fn bind_info_for_key(
    ctx: &LinkContext,
    key: TargetKey,
    ordinal_map: &[Option<u16>],
) -> Option<(Option<u16>, Vec<u8>, bool)> {
    let TargetKey::Global(global_index) = key else {
        return None;
    };
    let global = ctx.symbol_db.global(global_index);
    match global.definition {
        Definition::Dylib { ordinal, weak } => {
            let mapped = ordinal_map
                .get(ordinal as usize - 1)
                .copied()
                .flatten();
            Some((mapped, global.name.bytes().to_vec(), weak))
        }
        Definition::FlatLookup => Some((None, global.name.bytes().to_vec(), false)),
        _ => None,
    }
}

fn build_linkedit(
    ctx: &LinkContext,
    symtab: &SymtabModel,
    ordinal_map: &[Option<u16>],
) -> Result<LinkeditLayout> {
    let mut rebase: Vec<dyld_info::RebaseEntry> = Vec::new();
    let mut binds: Vec<BindEntry> = Vec::new();

    // Pointers in writable segments: locals rebase, externals bind.
    for section in &ctx.layout.sections {
        let writable = ctx.layout.segments[section.segment_index].protection.0
            & output_section_id::VM_PROT_WRITE
            != 0;
        if !writable || section.is_zerofill {
            continue;
        }
        let mut cursor = section.first_atom;
        while !cursor.is_null() {
            let atom = ctx.graph.pool.get(cursor);
            for reloc in &atom.relocs {
                if reloc.kind != crate::object_file::RelocKind::Absolute
                    || reloc.length != 8
                    || reloc.subtrahend.is_some()
                {
                    continue;
                }
                let key = crate::synthetic::target_key(ctx.symbol_db, reloc.target);
                match crate::synthetic::classify_target(ctx.symbol_db, reloc.target) {
                    TargetClass::Local => {
                        rebase.push(segment_and_offset(ctx, atom.address + reloc.offset)?);
                    }
                    TargetClass::External { .. } => {
                        let Some((ordinal, name, weak)) =
                            bind_info_for_key(ctx, key, ordinal_map)
                        else {
                            continue;
                        };
                        let (segment_index, segment_offset) =
                            segment_and_offset(ctx, atom.address + reloc.offset)?;
                        binds.push(BindEntry {
                            segment_index,
                            segment_offset,
                            ordinal,
                            name,
                            addend: reloc.addend,
                            weak,
                        });
                    }
                }
            }
            cursor = atom.next;
        }
    }

    // GOT and TLV-pointer slots bound to dylibs carry no relocation; the
    // binder owns them entirely.
    for table in [&ctx.synthetics.got, &ctx.synthetics.tlv_ptrs] {
        for &(key, atom) in &table.order {
            let Some((ordinal, name, weak)) = bind_info_for_key(ctx, key, ordinal_map) else {
                continue;
            };
            let (segment_index, segment_offset) =
                segment_and_offset(ctx, ctx.graph.pool.get(atom).address)?;
            binds.push(BindEntry {
                segment_index,
                segment_offset,
                ordinal,
                name,
                addend: 0,
                weak,
            });
        }
    }
    binds.sort_by(|a, b| {
        (a.segment_index, a.segment_offset).cmp(&(b.segment_index, b.segment_offset))
    });

    // One lazy bind record per stub, in stub order so the back-patched
    // offsets line up.
    let mut lazy_entries = Vec::new();
    for &(key, _) in &ctx.synthetics.stubs.order {
        let Some((ordinal, name, weak)) = bind_info_for_key(ctx, key, ordinal_map) else {
            continue;
        };
        let lazy_atom = ctx
            .synthetics
            .lazy_ptrs
            .get(key)
            .expect("stub without lazy pointer");
        let (segment_index, segment_offset) =
            segment_and_offset(ctx, ctx.graph.pool.get(lazy_atom).address)?;
        lazy_entries.push(BindEntry {
            segment_index,
            segment_offset,
            ordinal,
            name,
            addend: 0,
            weak,
        });
    }
    let (lazy_bind, lazy_offsets) = dyld_info::encode_lazy_bind(&lazy_entries);

    // Exports.
    let mut exports = Vec::new();
    for global in &ctx.symbol_db.globals {
        let exported = match global.definition {
            Definition::Object { file, sym_index } => {
                let sym = &ctx.objects[file.as_usize()].symbols[sym_index as usize];
                !sym.flags.contains(SymFlags::PRIVATE_EXTERN)
            }
            Definition::Tentative { .. } => true,
            Definition::Synthetic => global.name.bytes().starts_with(b"__mh_"),
            _ => false,
        };
        if !exported {
            continue;
        }
        let Ok(address) = address_of_global(ctx, global) else {
            continue;
        };
        exports.push(dyld_info::ExportEntry {
            name: global.name.bytes().to_vec(),
            offset: address - ctx.layout.base_address,
            weak: global.weak,
        });
    }
    exports.sort_by(|a, b| a.name.cmp(&b.name));

    // Function starts: ULEB deltas over the code atoms.
    let mut function_starts = Vec::new();
    if let Some(text) = ctx.layout.section_by_id(output_section_id::TEXT) {
        let text_segment = &ctx.layout.segments[text.segment_index];
        let mut previous = text_segment.vmaddr;
        let mut cursor = text.first_atom;
        while !cursor.is_null() {
            let atom = ctx.graph.pool.get(cursor);
            write_uleb128(&mut function_starts, atom.address - previous);
            previous = atom.address;
            cursor = atom.next;
        }
    }

    // Data-in-code, rebased from input section offsets to output file
    // offsets.
    let mut dice_out = Vec::new();
    for (file_index, object) in ctx.objects.iter().enumerate() {
        for entry in &object.data_in_code {
            let Some((atom_index, atom)) = ctx.graph.pool.iter().find(|(_, atom)| {
                atom.file == Some(crate::symbol::FileId(file_index as u32))
                    && atom.input_range.is_some_and(|(section, start)| {
                        section as usize == entry.section
                            && (start..start + atom.size).contains(&entry.offset_in_section)
                    })
            }) else {
                continue;
            };
            let _ = atom_index;
            let Some((_, atom_start)) = atom.input_range else {
                continue;
            };
            let address = atom.address + (entry.offset_in_section - atom_start);
            let Some(section) = ctx
                .layout
                .sections
                .iter()
                .find(|s| s.id == atom.output_section)
            else {
                continue;
            };
            let file_offset = section.file_offset + (address - section.vmaddr);
            dice_out.extend_from_slice(&(file_offset as u32).to_le_bytes());
            dice_out.extend_from_slice(&entry.length.to_le_bytes());
            dice_out.extend_from_slice(&entry.kind.to_le_bytes());
        }
    }

    // Indirect symbol table: GOT, stubs, lazy pointers.
    let mut indirect = Vec::new();
    let mut push_indirect = |key: TargetKey| {
        let index = match key {
            TargetKey::Global(global) => symtab
                .global_symtab_index
                .get(&global)
                .copied()
                .unwrap_or(macho::INDIRECT_SYMBOL_LOCAL),
            _ => macho::INDIRECT_SYMBOL_LOCAL,
        };
        indirect.extend_from_slice(&index.to_le_bytes());
    };
    for &(key, _) in &ctx.synthetics.got.order {
        push_indirect(key);
    }
    for &(key, _) in &ctx.synthetics.stubs.order {
        push_indirect(key);
    }
    for &(key, _) in &ctx.synthetics.lazy_ptrs.order {
        push_indirect(key);
    }

    Ok(LinkeditLayout {
        rebase: dyld_info::encode_rebase(&mut rebase),
        bind: dyld_info::encode_bind(&binds),
        lazy_bind,
        lazy_offsets,
        export_trie: dyld_info::encode_export_trie(&exports),
        function_starts,
        data_in_code: dice_out,
        indirect,
    })
}

fn address_of_global(ctx: &LinkContext, global: &crate::symbol_db::Global) -> Result<u64> {
    match global.definition {
        Definition::Object { file, sym_index } => {
            ctx.symbol_address(crate::symbol::SymbolRef::object(file, sym_index))
        }
        Definition::Tentative { .. } | Definition::Synthetic => {
            // Tentative storage is reachable through the per-global map;
            // synthetics resolve by name.
            if let Some(index) = ctx
                .symbol_db
                .globals
                .iter()
                .position(|candidate| std::ptr::eq(candidate, global))
            {
                let index = GlobalIndex(index as u32);
                if let Some(&atom) = ctx.synthetics.tentative.get(&index) {
                    return Ok(ctx.graph.pool.get(atom).address);
                }
            }
            Ok(ctx.layout.base_address)
        }
        _ => bail!("Not an exportable definition"),
    }
}

fn build_symtab(ctx: &LinkContext, ordinal_map: &[Option<u16>]) -> Result<SymtabModel> {
    let mut strtab = StringTable::new();
    let mut nlists = Vec::new();

    // Stabs first: they sit in the local block and their bytes (plus their
    // strings) are excluded from the UUID when debug info is kept.
    let mut num_stabs = 0u32;
    if !ctx.opts.strip {
        for (file_index, object) in ctx.objects.iter().enumerate() {
            let file = crate::symbol::FileId(file_index as u32);
            nlists.push(Nlist {
                n_strx: object::U32::new(E, strtab.intern(object.name.as_bytes())),
                n_type: N_OSO,
                n_sect: 0,
                n_desc: object::U16::new(E, 1),
                n_value: object::U64Bytes::new(E, 0),
            });
            num_stabs += 1;
            for (index, atom) in ctx.graph.pool.iter() {
                if atom.file != Some(file)
                    || !atom.alive
                    || atom.output_section != output_section_id::TEXT
                {
                    continue;
                }
                let Some(name) = primary_name(ctx, index) else {
                    continue;
                };
                nlists.push(Nlist {
                    n_strx: object::U32::new(E, strtab.intern(name)),
                    n_type: N_FUN,
                    n_sect: 1,
                    n_desc: object::U16::new(E, 0),
                    n_value: object::U64Bytes::new(E, atom.address),
                });
                nlists.push(Nlist {
                    n_strx: object::U32::new(E, 0),
                    n_type: N_FUN,
                    n_sect: 0,
                    n_desc: object::U16::new(E, 0),
                    n_value: object::U64Bytes::new(E, atom.size),
                });
                num_stabs += 2;
            }
        }
    }
    let stab_string_range = 0..strtab.len();

    // Named local definitions.
    let mut num_locals = 0u32;
    for (file_index, object) in ctx.objects.iter().enumerate() {
        for (sym_index, sym) in object.symbols.iter().enumerate() {
            if sym.is_external()
                || sym.flags.contains(SymFlags::STAB)
                || sym.name.is_empty()
                || sym.section.is_none()
            {
                continue;
            }
            let symbol =
                crate::symbol::SymbolRef::object(crate::symbol::FileId(file_index as u32), sym_index as u32);
            let Some((atom, offset)) = crate::layout::atom_for_symbol(
                ctx.symbol_db,
                ctx.graph,
                ctx.synthetics,
                symbol,
            ) else {
                continue;
            };
            if !ctx.graph.pool.get(atom).alive {
                continue;
            }
            nlists.push(Nlist {
                n_strx: object::U32::new(E, strtab.intern(sym.name)),
                n_type: macho::N_SECT,
                n_sect: section_ordinal(ctx, atom),
                n_desc: object::U16::new(E, 0),
                n_value: object::U64Bytes::new(E, ctx.graph.pool.get(atom).address + offset),
            });
            num_locals += 1;
        }
    }

    // External definitions, sorted by name as dyld's binary search requires.
    let mut externals: Vec<(Vec<u8>, Nlist, GlobalIndex)> = Vec::new();
    for (raw_index, global) in ctx.symbol_db.globals.iter().enumerate() {
        let global_index = GlobalIndex(raw_index as u32);
        match global.definition {
            Definition::Object { file, sym_index } => {
                let sym = &ctx.objects[file.as_usize()].symbols[sym_index as usize];
                let symbol = crate::symbol::SymbolRef::object(file, sym_index);
                let Some((atom, offset)) = crate::layout::atom_for_symbol(
                    ctx.symbol_db,
                    ctx.graph,
                    ctx.synthetics,
                    symbol,
                ) else {
                    continue;
                };
                if !ctx.graph.pool.get(atom).alive {
                    continue;
                }
                let mut n_type = macho::N_SECT | macho::N_EXT;
                if sym.flags.contains(SymFlags::PRIVATE_EXTERN) {
                    n_type |= macho::N_PEXT;
                }
                let mut n_desc = 0u16;
                if global.weak {
                    n_desc |= macho::N_WEAK_DEF;
                }
                if sym.flags.contains(SymFlags::NO_DEAD_STRIP) {
                    n_desc |= N_NO_DEAD_STRIP;
                }
                externals.push((
                    global.name.bytes().to_vec(),
                    Nlist {
                        n_strx: object::U32::new(E, 0),
                        n_type,
                        n_sect: section_ordinal(ctx, atom),
                        n_desc: object::U16::new(E, n_desc),
                        n_value: object::U64Bytes::new(
                            E,
                            ctx.graph.pool.get(atom).address + offset,
                        ),
                    },
                    global_index,
                ));
            }
            Definition::Tentative { .. } => {
                let Some(&atom) = ctx.synthetics.tentative.get(&global_index) else {
                    continue;
                };
                externals.push((
                    global.name.bytes().to_vec(),
                    Nlist {
                        n_strx: object::U32::new(E, 0),
                        n_type: macho::N_SECT | macho::N_EXT,
                        n_sect: section_ordinal(ctx, atom),
                        n_desc: object::U16::new(E, 0),
                        n_value: object::U64Bytes::new(E, ctx.graph.pool.get(atom).address),
                    },
                    global_index,
                ));
            }
            Definition::Synthetic if global.name.bytes().starts_with(b"__mh_") => {
                externals.push((
                    global.name.bytes().to_vec(),
                    Nlist {
                        n_strx: object::U32::new(E, 0),
                        n_type: macho::N_SECT | macho::N_EXT,
                        n_sect: 1,
                        n_desc: object::U16::new(E, macho::REFERENCED_DYNAMICALLY),
                        n_value: object::U64Bytes::new(E, ctx.layout.base_address),
                    },
                    global_index,
                ));
            }
            _ => {}
        }
    }
    externals.sort_by(|a, b| a.0.cmp(&b.0));

    // Undefined imports, also sorted.
    let mut undefs: Vec<(Vec<u8>, Nlist, GlobalIndex)> = Vec::new();
    for (raw_index, global) in ctx.symbol_db.globals.iter().enumerate() {
        let global_index = GlobalIndex(raw_index as u32);
        let (ordinal, weak) = match global.definition {
            Definition::Dylib { ordinal, weak } => (
                ordinal_map
                    .get(ordinal as usize - 1)
                    .copied()
                    .flatten()
                    .unwrap_or(0),
                weak,
            ),
            Definition::FlatLookup => (0, false),
            _ => continue,
        };
        let mut n_desc = ordinal << 8;
        if weak {
            n_desc |= macho::N_WEAK_REF;
        }
        undefs.push((
            global.name.bytes().to_vec(),
            Nlist {
                n_strx: object::U32::new(E, 0),
                n_type: macho::N_UNDF | macho::N_EXT,
                n_sect: 0,
                n_desc: object::U16::new(E, n_desc),
                n_value: object::U64Bytes::new(E, 0),
            },
            global_index,
        ));
    }
    undefs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut global_symtab_index = hashbrown::HashMap::new();
    for (name, mut nlist, global_index) in externals.drain(..) {
        nlist.n_strx = object::U32::new(E, strtab.intern(&name));
        global_symtab_index.insert(global_index, nlists.len() as u32);
        nlists.push(nlist);
    }
    let num_externals = nlists.len() as u32 - num_stabs - num_locals;
    for (name, mut nlist, global_index) in undefs.drain(..) {
        nlist.n_strx = object::U32::new(E, strtab.intern(&name));
        global_symtab_index.insert(global_index, nlists.len() as u32);
        nlists.push(nlist);
    }
    let num_undefs = nlists.len() as u32 - num_stabs - num_locals - num_externals;

    let mut strtab = strtab;
    strtab.pad_to(8);

    Ok(SymtabModel {
        nlists,
        strtab,
        num_stabs,
        num_locals,
        num_externals,
        num_undefs,
        stab_string_range,
        global_symtab_index,
    })
}

fn primary_name<'a>(ctx: &'a LinkContext, atom_index: AtomIndex) -> Option<&'a [u8]> {
    let atom = ctx.graph.pool.get(atom_index);
    let file = atom.primary.file()?;
    let sym = ctx.objects[file.as_usize()]
        .symbols
        .get(atom.primary.index() as usize)?;
    (!sym.name.is_empty()).then_some(sym.name)
}

/// One-based ordinal of an atom's output section, counting emitted sections.
fn section_ordinal(ctx: &LinkContext, atom: AtomIndex) -> u8 {
    let section_id = ctx.graph.pool.get(atom).output_section;
    ctx.layout
        .sections
        .iter()
        .position(|section| section.id == section_id)
        .map_or(0, |index| index as u8 + 1)
}

struct CommandOffsets {
    rebase_off: u64,
    rebase_size: u32,
    bind_off: u64,
    bind_size: u32,
    lazy_bind_off: u64,
    lazy_bind_size: u32,
    export_off: u64,
    export_size: u32,
    function_starts_off: u64,
    function_starts_size: u32,
    data_in_code_off: u64,
    data_in_code_size: u32,
    symtab_off: u64,
    strtab_off: u64,
    strtab_size: u32,
    indirect_off: u64,
    num_indirect: u32,
    codesig_off: u64,
    codesig_size: u64,
    linkedit_start: u64,
    file_size: u64,
}

struct UuidRanges {
    /// Byte offset of the 16-byte UUID payload inside LC_UUID.
    uuid_payload_offset: usize,
    /// File ranges excluded from the UUID hash.
    excluded: Vec<std::ops::Range<usize>>,
}

#[allow(clippy::too_many_arguments)]
fn write_load_commands(
    ctx: &LinkContext,
    output_sections: &OutputSections,
    out: &mut [u8],
    symtab: &SymtabModel,
    offsets: &CommandOffsets,
    emitted_dylibs: &[usize],
    needs_signature: bool,
) -> Result<UuidRanges> {
    let opts = ctx.opts;
    let layout = ctx.layout;
    let mut buf: Vec<u8> = Vec::new();
    let mut ncmds = 0u32;
    let mut excluded = Vec::new();
    let header_len = size_of::<macho::MachHeader64<LittleEndian>>();

    // __PAGEZERO.
    if opts.is_exe() && opts.pagezero_size() > 0 {
        push_segment(
            &mut buf,
            b"__PAGEZERO",
            0,
            opts.pagezero_size(),
            0,
            0,
            (0, 0),
            &[],
        );
        ncmds += 1;
    }

    // Content segments with their sections.
    for (segment_index, segment) in layout.segments.iter().enumerate() {
        let mut sections: Vec<macho::Section64<LittleEndian>> = Vec::new();
        for &section_index in &segment.sections {
            let section = &layout.sections[section_index];
            sections.push(section64(ctx, output_sections, section)?);
        }
        let (file_offset, file_size) = if segment_index == 0 {
            // __TEXT covers the headers too.
            (0, segment.file_offset + segment.file_size)
        } else {
            (segment.file_offset, segment.file_size)
        };
        push_segment(
            &mut buf,
            segment.name.as_bytes(),
            segment.vmaddr,
            segment.vmsize,
            file_offset,
            file_size,
            segment.protection,
            &sections,
        );
        ncmds += 1;
    }

    // __LINKEDIT. Its sizes depend on the symbol-table content, so the
    // command is excluded from the UUID hash along with symtab/dysymtab.
    let linkedit_cmd_start = header_len + buf.len();
    push_segment(
        &mut buf,
        b"__LINKEDIT",
        layout.content_end_vmaddr,
        (offsets.file_size - offsets.linkedit_start).next_multiple_of(0x4000),
        offsets.linkedit_start,
        offsets.file_size - offsets.linkedit_start,
        (
            output_section_id::VM_PROT_READ,
            output_section_id::VM_PROT_READ,
        ),
        &[],
    );
    ncmds += 1;
    excluded.push(linkedit_cmd_start..header_len + buf.len());

    // LC_DYLD_INFO_ONLY.
    push_pod(
        &mut buf,
        &macho::DyldInfoCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_DYLD_INFO_ONLY),
            cmdsize: object::U32::new(
                E,
                size_of::<macho::DyldInfoCommand<LittleEndian>>() as u32,
            ),
            rebase_off: object::U32::new(E, offsets.rebase_off as u32),
            rebase_size: object::U32::new(E, offsets.rebase_size),
            bind_off: object::U32::new(E, offsets.bind_off as u32),
            bind_size: object::U32::new(E, offsets.bind_size),
            weak_bind_off: object::U32::new(E, 0),
            weak_bind_size: object::U32::new(E, 0),
            lazy_bind_off: object::U32::new(E, offsets.lazy_bind_off as u32),
            lazy_bind_size: object::U32::new(E, offsets.lazy_bind_size),
            export_off: object::U32::new(E, offsets.export_off as u32),
            export_size: object::U32::new(E, offsets.export_size),
        },
    );
    ncmds += 1;

    // LC_FUNCTION_STARTS and LC_DATA_IN_CODE.
    for (cmd, off, size) in [
        (
            macho::LC_FUNCTION_STARTS,
            offsets.function_starts_off,
            offsets.function_starts_size,
        ),
        (
            macho::LC_DATA_IN_CODE,
            offsets.data_in_code_off,
            offsets.data_in_code_size,
        ),
    ] {
        push_pod(
            &mut buf,
            &macho::LinkeditDataCommand::<LittleEndian> {
                cmd: object::U32::new(E, cmd),
                cmdsize: object::U32::new(
                    E,
                    size_of::<macho::LinkeditDataCommand<LittleEndian>>() as u32,
                ),
                dataoff: object::U32::new(E, off as u32),
                datasize: object::U32::new(E, size),
            },
        );
        ncmds += 1;
    }

    // LC_SYMTAB and LC_DYSYMTAB, both excluded from the UUID hash.
    let symtab_cmd_start = header_len + buf.len();
    push_pod(
        &mut buf,
        &macho::SymtabCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_SYMTAB),
            cmdsize: object::U32::new(E, size_of::<macho::SymtabCommand<LittleEndian>>() as u32),
            symoff: object::U32::new(E, offsets.symtab_off as u32),
            nsyms: object::U32::new(E, symtab.nlists.len() as u32),
            stroff: object::U32::new(E, offsets.strtab_off as u32),
            strsize: object::U32::new(E, offsets.strtab_size),
        },
    );
    ncmds += 1;
    let ilocalsym = 0;
    let nlocalsym = symtab.num_stabs + symtab.num_locals;
    push_pod(
        &mut buf,
        &macho::DysymtabCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_DYSYMTAB),
            cmdsize: object::U32::new(
                E,
                size_of::<macho::DysymtabCommand<LittleEndian>>() as u32,
            ),
            ilocalsym: object::U32::new(E, ilocalsym),
            nlocalsym: object::U32::new(E, nlocalsym),
            iextdefsym: object::U32::new(E, nlocalsym),
            nextdefsym: object::U32::new(E, symtab.num_externals),
            iundefsym: object::U32::new(E, nlocalsym + symtab.num_externals),
            nundefsym: object::U32::new(E, symtab.num_undefs),
            tocoff: object::U32::new(E, 0),
            ntoc: object::U32::new(E, 0),
            modtaboff: object::U32::new(E, 0),
            nmodtab: object::U32::new(E, 0),
            extrefsymoff: object::U32::new(E, 0),
            nextrefsyms: object::U32::new(E, 0),
            indirectsymoff: object::U32::new(E, offsets.indirect_off as u32),
            nindirectsyms: object::U32::new(E, offsets.num_indirect),
            extreloff: object::U32::new(E, 0),
            nextrel: object::U32::new(E, 0),
            locreloff: object::U32::new(E, 0),
            nlocrel: object::U32::new(E, 0),
        },
    );
    ncmds += 1;
    excluded.push(symtab_cmd_start..header_len + buf.len());

    // LC_LOAD_DYLINKER (executables only).
    if opts.is_exe() {
        push_string_command(&mut buf, macho::LC_LOAD_DYLINKER, b"/usr/lib/dyld");
        ncmds += 1;
    }

    // LC_MAIN or LC_ID_DYLIB.
    if opts.is_exe() {
        let entry = ctx.symbol_db
            .lookup(&crate::symbol::SymbolName::prehashed(
                opts.entry_symbol_name().as_bytes(),
            ))
            .and_then(|index| {
                let global = ctx.symbol_db.global(index);
                match global.definition {
                    Definition::Object { file, sym_index } => ctx
                        .symbol_address(crate::symbol::SymbolRef::object(file, sym_index))
                        .ok(),
                    _ => None,
                }
            })
            .unwrap_or(layout.base_address);
        push_pod(
            &mut buf,
            &macho::EntryPointCommand::<LittleEndian> {
                cmd: object::U32::new(E, macho::LC_MAIN),
                cmdsize: object::U32::new(
                    E,
                    size_of::<macho::EntryPointCommand<LittleEndian>>() as u32,
                ),
                entryoff: object::U64::new(E, entry - layout.base_address),
                stacksize: object::U64::new(E, opts.stack_size.unwrap_or(0)),
            },
        );
        ncmds += 1;
    } else {
        let install_name = opts
            .install_name
            .clone()
            .unwrap_or_else(|| opts.emit.sub_path.to_string_lossy().into_owned());
        push_dylib_command(&mut buf, macho::LC_ID_DYLIB, install_name.as_bytes(), 0, 0);
        ncmds += 1;
    }

    // LC_RPATH.
    for rpath in &opts.rpaths {
        push_string_command(&mut buf, macho::LC_RPATH, rpath.as_bytes());
        ncmds += 1;
    }

    // LC_SOURCE_VERSION and LC_BUILD_VERSION.
    push_pod(
        &mut buf,
        &macho::SourceVersionCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_SOURCE_VERSION),
            cmdsize: object::U32::new(
                E,
                size_of::<macho::SourceVersionCommand<LittleEndian>>() as u32,
            ),
            version: object::U64::new(E, 0),
        },
    );
    ncmds += 1;
    let platform = match (opts.target.os_tag, opts.target.abi) {
        (OsTag::Ios, Abi::Simulator) => macho::PLATFORM_IOSSIMULATOR,
        (OsTag::Ios, _) => macho::PLATFORM_IOS,
        _ => macho::PLATFORM_MACOS,
    };
    push_pod(
        &mut buf,
        &macho::BuildVersionCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_BUILD_VERSION),
            cmdsize: object::U32::new(
                E,
                size_of::<macho::BuildVersionCommand<LittleEndian>>() as u32,
            ),
            platform: object::U32::new(E, platform),
            minos: object::U32::new(E, 11 << 16),
            sdk: object::U32::new(E, 11 << 16),
            ntools: object::U32::new(E, 0),
        },
    );
    ncmds += 1;

    // LC_UUID: written as zero now, patched after hashing. The whole command
    // is excluded from the hash.
    let uuid_cmd_start = header_len + buf.len();
    push_pod(
        &mut buf,
        &macho::UuidCommand::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_UUID),
            cmdsize: object::U32::new(E, size_of::<macho::UuidCommand<LittleEndian>>() as u32),
            uuid: [0; 16],
        },
    );
    ncmds += 1;
    let uuid_payload_offset = uuid_cmd_start + 8;
    excluded.push(uuid_cmd_start..header_len + buf.len());

    // LC_LOAD_DYLIB / LC_LOAD_WEAK_DYLIB.
    for &dylib_index in emitted_dylibs {
        let dylib = &ctx.dylibs[dylib_index];
        let cmd = if dylib.weak {
            macho::LC_LOAD_WEAK_DYLIB
        } else {
            macho::LC_LOAD_DYLIB
        };
        push_dylib_command(
            &mut buf,
            cmd,
            dylib.install_name.as_bytes(),
            dylib.current_version,
            dylib.compatibility_version,
        );
        ncmds += 1;
    }

    // LC_CODE_SIGNATURE, excluded from the hash.
    if needs_signature {
        let start = header_len + buf.len();
        push_pod(
            &mut buf,
            &macho::LinkeditDataCommand::<LittleEndian> {
                cmd: object::U32::new(E, macho::LC_CODE_SIGNATURE),
                cmdsize: object::U32::new(
                    E,
                    size_of::<macho::LinkeditDataCommand<LittleEndian>>() as u32,
                ),
                dataoff: object::U32::new(E, offsets.codesig_off as u32),
                datasize: object::U32::new(E, offsets.codesig_size as u32),
            },
        );
        ncmds += 1;
        excluded.push(start..header_len + buf.len());
    }

    if (header_len + buf.len()) as u64 > layout.header_size {
        bail!(
            "Load commands ({} bytes) overflow the reserved header space ({} bytes)",
            header_len + buf.len(),
            layout.header_size
        );
    }

    // Header flags per the format contract.
    let mut flags = macho::MH_NOUNDEFS | macho::MH_DYLDLINK | macho::MH_TWOLEVEL;
    if opts.is_exe() {
        flags |= macho::MH_PIE;
    } else {
        flags |= macho::MH_NO_REEXPORTED_DYLIBS;
    }
    let has_tlv = layout
        .sections
        .iter()
        .any(|section| section.id == output_section_id::TLV_VARS);
    if has_tlv {
        flags |= macho::MH_HAS_TLV_DESCRIPTORS;
    }
    let (cputype, cpusubtype) = match opts.target.cpu_arch {
        CpuArch::X86_64 => (macho::CPU_TYPE_X86_64, macho::CPU_SUBTYPE_X86_64_ALL),
        CpuArch::Aarch64 => (macho::CPU_TYPE_ARM64, macho::CPU_SUBTYPE_ARM64_ALL),
        CpuArch::Wasm32 => bail!("wasm output uses the wasm writer"),
    };
    let header = macho::MachHeader64::<LittleEndian> {
        magic: object::U32::new(object::BigEndian, macho::MH_MAGIC_64),
        cputype: object::U32::new(E, cputype),
        cpusubtype: object::U32::new(E, cpusubtype),
        filetype: object::U32::new(
            E,
            if opts.output_mode == OutputMode::Lib {
                macho::MH_DYLIB
            } else {
                macho::MH_EXECUTE
            },
        ),
        ncmds: object::U32::new(E, ncmds),
        sizeofcmds: object::U32::new(E, buf.len() as u32),
        flags: object::U32::new(E, flags),
        reserved: object::U32::new(E, 0),
    };
    out[..header_len].copy_from_slice(object::bytes_of(&header));
    out[header_len..header_len + buf.len()].copy_from_slice(&buf);

    Ok(UuidRanges {
        uuid_payload_offset,
        excluded,
    })
}

fn section64(
    ctx: &LinkContext,
    output_sections: &OutputSections,
    section: &SectionLayout,
) -> Result<macho::Section64<LittleEndian>> {
    let def = output_sections.def(section.id);
    let mut sectname = [0u8; 16];
    let name = &def.name;
    sectname[..name.len().min(16)].copy_from_slice(&name[..name.len().min(16)]);
    let mut segname = [0u8; 16];
    let seg = def.segment_name.as_bytes();
    segname[..seg.len().min(16)].copy_from_slice(&seg[..seg.len().min(16)]);

    // Indirect-table bookkeeping rides in reserved1/reserved2.
    let (reserved1, reserved2) = if section.id == output_section_id::GOT {
        (0u32, 0u32)
    } else if section.id == output_section_id::STUBS {
        let stub_size = match ctx.opts.target.cpu_arch {
            CpuArch::X86_64 => 6,
            _ => 12,
        };
        (ctx.synthetics.got.len() as u32, stub_size)
    } else if section.id == output_section_id::LAZY_SYMBOL_PTR {
        (
            (ctx.synthetics.got.len() + ctx.synthetics.stubs.len()) as u32,
            0,
        )
    } else {
        (0, 0)
    };

    Ok(macho::Section64 {
        sectname,
        segname,
        addr: object::U64::new(E, section.vmaddr),
        size: object::U64::new(E, section.size),
        offset: object::U32::new(E, if section.is_zerofill { 0 } else { section.file_offset as u32 }),
        align: object::U32::new(E, u32::from(section.alignment.exponent)),
        reloff: object::U32::new(E, 0),
        nreloc: object::U32::new(E, 0),
        flags: object::U32::new(E, def.macho_flags),
        reserved1: object::U32::new(E, reserved1),
        reserved2: object::U32::new(E, reserved2),
        reserved3: object::U32::new(E, 0),
    })
}

fn push_pod<T: object::Pod>(buf: &mut Vec<u8>, value: &T) {
    buf.extend_from_slice(object::bytes_of(value));
}

#[allow(clippy::too_many_arguments)]
fn push_segment(
    buf: &mut Vec<u8>,
    name: &[u8],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    protection: (u32, u32),
    sections: &[macho::Section64<LittleEndian>],
) {
    let cmdsize = size_of::<macho::SegmentCommand64<LittleEndian>>()
        + sections.len() * size_of::<macho::Section64<LittleEndian>>();
    let mut segname = [0u8; 16];
    segname[..name.len().min(16)].copy_from_slice(&name[..name.len().min(16)]);
    push_pod(
        buf,
        &macho::SegmentCommand64::<LittleEndian> {
            cmd: object::U32::new(E, macho::LC_SEGMENT_64),
            cmdsize: object::U32::new(E, cmdsize as u32),
            segname,
            vmaddr: object::U64::new(E, vmaddr),
            vmsize: object::U64::new(E, vmsize),
            fileoff: object::U64::new(E, fileoff),
            filesize: object::U64::new(E, filesize),
            maxprot: object::U32::new(E, protection.1),
            initprot: object::U32::new(E, protection.0),
            nsects: object::U32::new(E, sections.len() as u32),
            flags: object::U32::new(E, 0),
        },
    );
    for section in sections {
        push_pod(buf, section);
    }
}

fn push_string_command(buf: &mut Vec<u8>, cmd: u32, string: &[u8]) {
    // Fixed struct is cmd/cmdsize/offset; the string follows, NUL-terminated
    // and padded to 8 bytes.
    let fixed = 12usize;
    let cmdsize = (fixed + string.len() + 1).next_multiple_of(8);
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(&(cmdsize as u32).to_le_bytes());
    buf.extend_from_slice(&(fixed as u32).to_le_bytes());
    buf.extend_from_slice(string);
    buf.resize(buf.len() + cmdsize - fixed - string.len(), 0);
}

fn push_dylib_command(
    buf: &mut Vec<u8>,
    cmd: u32,
    install_name: &[u8],
    current_version: u32,
    compatibility_version: u32,
) {
    let fixed = size_of::<macho::DylibCommand<LittleEndian>>();
    let cmdsize = (fixed + install_name.len() + 1).next_multiple_of(8);
    push_pod(
        buf,
        &macho::DylibCommand::<LittleEndian> {
            cmd: object::U32::new(E, cmd),
            cmdsize: object::U32::new(E, cmdsize as u32),
            dylib: macho::Dylib {
                name: macho::LcStr {
                    offset: object::U32::new(E, fixed as u32),
                },
                timestamp: object::U32::new(E, 2),
                current_version: object::U32::new(E, current_version),
                compatibility_version: object::U32::new(E, compatibility_version),
            },
        },
    );
    buf.extend_from_slice(install_name);
    buf.resize(buf.len() + cmdsize - fixed - install_name.len(), 0);
}

/// RFC 4122 v3 UUID: the MD5 of the file with the excluded ranges zero-
/// skipped, then version/variant bits applied (byte 6 high nibble = 3, byte 8
/// top two bits = 10).
fn compute_uuid(out: &[u8], excluded: &[std::ops::Range<usize>]) -> uuid::Uuid {
    let mut sorted: Vec<&std::ops::Range<usize>> = excluded.iter().collect();
    sorted.sort_by_key(|range| range.start);
    let mut hasher = md5::Md5::new();
    let mut at = 0usize;
    for range in sorted {
        if range.start > at {
            hasher.update(&out[at..range.start]);
        }
        at = at.max(range.end);
    }
    if at < out.len() {
        hasher.update(&out[at..]);
    }
    let digest: [u8; 16] = hasher.finalize().into();
    uuid::Builder::from_md5_bytes(digest).into_uuid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_bit_pattern() {
        let data = vec![0x42u8; 256];
        let uuid = compute_uuid(&data, &[]);
        let bytes = uuid.as_bytes();
        assert_eq!(bytes[6] >> 4, 3);
        assert_eq!(bytes[8] >> 6, 0b10);
    }

    #[test]
    fn test_uuid_ignores_excluded_ranges() {
        let mut a = vec![0u8; 128];
        let mut b = vec![0u8; 128];
        a[64] = 1;
        b[64] = 2;
        assert_ne!(compute_uuid(&a, &[]), compute_uuid(&b, &[]));
        let excluded = vec![60..70];
        assert_eq!(
            compute_uuid(&a, &[excluded[0].clone()]),
            compute_uuid(&b, &[excluded[0].clone()])
        );
    }

    #[test]
    fn test_string_command_padding() {
        let mut buf = Vec::new();
        push_string_command(&mut buf, macho::LC_LOAD_DYLINKER, b"/usr/lib/dyld");
        assert_eq!(buf.len() % 8, 0);
        let cmdsize = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(cmdsize as usize, buf.len());
        assert!(buf.windows(13).any(|w| w == b"/usr/lib/dyld"));
    }
}
