//! Parsing of WebAssembly relocatable objects (the clang/LLVM object format:
//! a standard module plus `linking` and `reloc.*` custom sections). Function
//! bodies and data segments become input sections so the shared resolver and
//! atom engine treat them like any other content; module-level structure the
//! writer needs (types, imports, globals, exports) rides along in
//! `WasmModuleInfo`.

use crate::alignment::Alignment;
use crate::args::CpuArch;
use crate::error::LinkError;
use crate::error::Result;
use crate::leb128::read_sleb128;
use crate::leb128::read_uleb128;
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
use crate::object_file::WasmRelocKind;
use anyhow::bail;

pub(crate) const SECTION_CUSTOM: u8 = 0;
pub(crate) const SECTION_TYPE: u8 = 1;
pub(crate) const SECTION_IMPORT: u8 = 2;
pub(crate) const SECTION_FUNCTION: u8 = 3;
pub(crate) const SECTION_TABLE: u8 = 4;
pub(crate) const SECTION_MEMORY: u8 = 5;
pub(crate) const SECTION_GLOBAL: u8 = 6;
pub(crate) const SECTION_EXPORT: u8 = 7;
const SECTION_START: u8 = 8;
pub(crate) const SECTION_ELEMENT: u8 = 9;
pub(crate) const SECTION_CODE: u8 = 10;
pub(crate) const SECTION_DATA: u8 = 11;
pub(crate) const SECTION_DATA_COUNT: u8 = 12;

// Symbol table constants from the tool-conventions linking spec.
const SYMTAB_FUNCTION: u8 = 0;
const SYMTAB_DATA: u8 = 1;
const SYMTAB_GLOBAL: u8 = 2;
const SYMTAB_SECTION: u8 = 3;
const SYMTAB_EVENT: u8 = 4;
const SYMTAB_TABLE: u8 = 5;

const WASM_SYM_BINDING_WEAK: u32 = 0x01;
const WASM_SYM_BINDING_LOCAL: u32 = 0x02;
const WASM_SYM_VISIBILITY_HIDDEN: u32 = 0x04;
const WASM_SYM_UNDEFINED: u32 = 0x10;
const WASM_SYM_NO_STRIP: u32 = 0x80;

const SUBSECTION_SEGMENT_INFO: u8 = 5;
const SUBSECTION_SYMBOL_TABLE: u8 = 8;

const R_WASM_FUNCTION_INDEX_LEB: u8 = 0;
const R_WASM_TABLE_INDEX_SLEB: u8 = 1;
const R_WASM_TABLE_INDEX_I32: u8 = 2;
const R_WASM_MEMORY_ADDR_LEB: u8 = 3;
const R_WASM_MEMORY_ADDR_SLEB: u8 = 4;
const R_WASM_MEMORY_ADDR_I32: u8 = 5;
const R_WASM_TYPE_INDEX_LEB: u8 = 6;
const R_WASM_GLOBAL_INDEX_LEB: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WasmSymbolKind {
    Function,
    Data,
    Global,
    Table,
}

/// The wasm-level identity of each symbol-table entry, indexed in step with
/// `ObjectFile::symbols`. The writer uses this to renumber function and
/// global indexes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WasmSymbolInfo {
    pub(crate) kind: WasmSymbolKind,
    /// Function/global/table index in the input module (imports first), or
    /// data segment index for data symbols.
    pub(crate) index: u32,
}

pub(crate) struct WasmImport<'data> {
    pub(crate) field: &'data [u8],
    pub(crate) kind: WasmImportKind<'data>,
}

pub(crate) enum WasmImportKind<'data> {
    /// Type index into the input module's type table.
    Function(u32),
    Table(&'data [u8]),
    Memory(&'data [u8]),
    /// valtype + mutability bytes.
    Global(&'data [u8]),
}

pub(crate) struct WasmGlobal<'data> {
    /// valtype + mutability.
    pub(crate) ty: &'data [u8],
    /// Init expression, including the terminating `end`.
    pub(crate) init: &'data [u8],
}

pub(crate) struct WasmDataSegmentInfo<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) alignment: Alignment,
}

pub(crate) struct WasmModuleInfo<'data> {
    /// Each type entry's raw encoding (starting at the 0x60 tag), used for
    /// cross-module deduplication by byte equality.
    pub(crate) types: Vec<&'data [u8]>,
    pub(crate) imports: Vec<WasmImport<'data>>,
    /// Type index per defined function, parallel to the code-section order.
    pub(crate) function_types: Vec<u32>,
    pub(crate) num_func_imports: u32,
    pub(crate) num_global_imports: u32,
    pub(crate) globals: Vec<WasmGlobal<'data>>,
    /// Function indexes listed in active element segments (the input's
    /// indirect call table); they keep their table slots in the output.
    pub(crate) element_functions: Vec<u32>,
    pub(crate) symbol_info: Vec<WasmSymbolInfo>,
    /// `sections` index of each defined function / data segment.
    pub(crate) function_sections: Vec<usize>,
    pub(crate) data_segment_sections: Vec<usize>,
    pub(crate) producers: Option<&'data [u8]>,
    pub(crate) target_features: Option<&'data [u8]>,
    /// `.debug_*` custom sections, passed through verbatim unless stripping.
    pub(crate) debug_sections: Vec<(&'data [u8], &'data [u8])>,
}

struct RawSection<'data> {
    id: u8,
    name: &'data [u8],
    payload: &'data [u8],
}

pub(crate) fn parse<'data>(
    data: &'data [u8],
    name: String,
    expected_arch: CpuArch,
) -> Result<ObjectFile<'data>> {
    if expected_arch != CpuArch::Wasm32 {
        return Err(LinkError::MismatchedCpuArchitecture.into());
    }
    let rest = data.strip_prefix(b"\0asm").ok_or(LinkError::NotObject)?;
    if rest.get(..4) != Some(&[1, 0, 0, 0]) {
        bail!("Unsupported wasm version");
    }

    let mut raw_sections = Vec::new();
    let mut offset = 8;
    while offset < data.len() {
        let id = data[offset];
        offset += 1;
        let size = read_uleb128(data, &mut offset)? as usize;
        let payload = data
            .get(offset..offset + size)
            .ok_or(LinkError::NotObject)?;
        offset += size;
        let (name, payload) = if id == SECTION_CUSTOM {
            let mut at = 0;
            let name_len = read_uleb128(payload, &mut at)? as usize;
            let name = payload
                .get(at..at + name_len)
                .ok_or(LinkError::NotObject)?;
            (name, &payload[at + name_len..])
        } else {
            (&b""[..], payload)
        };
        raw_sections.push(RawSection { id, name, payload });
    }

    let mut info = WasmModuleInfo {
        types: Vec::new(),
        imports: Vec::new(),
        function_types: Vec::new(),
        num_func_imports: 0,
        num_global_imports: 0,
        globals: Vec::new(),
        element_functions: Vec::new(),
        symbol_info: Vec::new(),
        function_sections: Vec::new(),
        data_segment_sections: Vec::new(),
        producers: None,
        target_features: None,
        debug_sections: Vec::new(),
    };

    let mut sections: Vec<InputSection<'data>> = Vec::new();
    // Body ranges within the code/data section payloads, for reloc rebasing.
    let mut code_ranges: Vec<(usize, usize)> = Vec::new();
    let mut data_ranges: Vec<(usize, usize)> = Vec::new();
    let mut segment_infos: Vec<WasmDataSegmentInfo<'data>> = Vec::new();
    let mut raw_symbols: Vec<RawSymbol<'data>> = Vec::new();
    let mut code_payload: &'data [u8] = &[];
    let mut data_payload: &'data [u8] = &[];

    for section in &raw_sections {
        let payload = section.payload;
        let mut at = 0;
        match section.id {
            SECTION_TYPE => {
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    let start = at;
                    if payload.get(at) != Some(&0x60) {
                        bail!("Unsupported type entry");
                    }
                    at += 1;
                    for _ in 0..2 {
                        let n = read_uleb128(payload, &mut at)?;
                        at += n as usize;
                    }
                    info.types.push(&payload[start..at]);
                }
            }
            SECTION_IMPORT => {
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    read_name(payload, &mut at)?; // module, always re-emitted as "env"
                    let field = read_name(payload, &mut at)?;
                    let kind_byte = *payload.get(at).ok_or(LinkError::NotObject)?;
                    at += 1;
                    let kind = match kind_byte {
                        0 => {
                            info.num_func_imports += 1;
                            WasmImportKind::Function(read_uleb128(payload, &mut at)? as u32)
                        }
                        1 => {
                            let start = at;
                            at += 1; // reftype
                            skip_limits(payload, &mut at)?;
                            WasmImportKind::Table(&payload[start..at])
                        }
                        2 => {
                            let start = at;
                            skip_limits(payload, &mut at)?;
                            WasmImportKind::Memory(&payload[start..at])
                        }
                        3 => {
                            info.num_global_imports += 1;
                            let start = at;
                            at += 2; // valtype + mutability
                            WasmImportKind::Global(&payload[start..at])
                        }
                        other => bail!("Unsupported import kind {other}"),
                    };
                    info.imports.push(WasmImport { field, kind });
                }
            }
            SECTION_FUNCTION => {
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    info.function_types.push(read_uleb128(payload, &mut at)? as u32);
                }
            }
            SECTION_GLOBAL => {
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    let ty = payload.get(at..at + 2).ok_or(LinkError::NotObject)?;
                    at += 2;
                    let init_start = at;
                    skip_init_expr(payload, &mut at)?;
                    info.globals.push(WasmGlobal {
                        ty,
                        init: &payload[init_start..at],
                    });
                }
            }
            SECTION_EXPORT => {
                // Input-module exports are linking metadata we derive from
                // the symbol table instead; validate and skip.
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    read_name(payload, &mut at)?;
                    at += 1; // kind
                    read_uleb128(payload, &mut at)?;
                }
            }
            SECTION_ELEMENT => {
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    let flags = read_uleb128(payload, &mut at)?;
                    if flags != 0 {
                        bail!("Unsupported element segment flags {flags}");
                    }
                    skip_init_expr(payload, &mut at)?;
                    let n = read_uleb128(payload, &mut at)?;
                    for _ in 0..n {
                        info.element_functions
                            .push(read_uleb128(payload, &mut at)? as u32);
                    }
                }
            }
            SECTION_CODE => {
                code_payload = payload;
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    let body_size = read_uleb128(payload, &mut at)? as usize;
                    code_ranges.push((at, at + body_size));
                    at += body_size;
                }
            }
            SECTION_DATA => {
                data_payload = payload;
                let count = read_uleb128(payload, &mut at)?;
                for _ in 0..count {
                    let flags = read_uleb128(payload, &mut at)?;
                    // Input placement is irrelevant: layout assigns fresh
                    // memory addresses. The initializer just gets skipped.
                    if flags == 0 || flags == 2 {
                        if flags == 2 {
                            read_uleb128(payload, &mut at)?; // memory index
                        }
                        skip_init_expr(payload, &mut at)?;
                    }
                    let size = read_uleb128(payload, &mut at)? as usize;
                    data_ranges.push((at, at + size));
                    at += size;
                }
            }
            SECTION_CUSTOM => match section.name {
                b"linking" => {
                    raw_symbols = parse_linking(payload, &info, &mut segment_infos)?;
                }
                b"producers" => info.producers = Some(payload),
                b"target_features" => info.target_features = Some(payload),
                name if name.starts_with(b".debug_") => {
                    info.debug_sections.push((name, payload));
                }
                _ => {}
            },
            _ => {}
        }
    }

    // Defined functions and data segments become input sections: one atom
    // each after splitting.
    for &(start, end) in &code_ranges {
        info.function_sections.push(sections.len());
        sections.push(InputSection {
            name: SectionName::elf(b".text"),
            kind: SectionKind::Code,
            alignment: crate::alignment::MIN,
            data: SectionData::Bytes(&code_payload[start..end]),
            relocs: Vec::new(),
            comdat_signature: None,
        });
    }
    for (index, &(start, end)) in data_ranges.iter().enumerate() {
        info.data_segment_sections.push(sections.len());
        let seg_info = segment_infos.get(index);
        sections.push(InputSection {
            name: SectionName::elf(seg_info.map_or(&b".data"[..], |s| s.name)),
            kind: SectionKind::Data,
            alignment: seg_info.map_or(crate::alignment::MIN, |s| s.alignment),
            data: SectionData::Bytes(&data_payload[start..end]),
            relocs: Vec::new(),
            comdat_signature: None,
        });
    }

    // Now that section indexes exist, build the unified symbol table in
    // symbol-table order (relocations index it).
    let mut symbols = Vec::new();
    build_symbols(&mut info, raw_symbols, &mut symbols)?;

    // Distribute relocations to the owning function/segment sections.
    for section in &raw_sections {
        let (ranges, section_of) = match section.name {
            b"reloc.CODE" => (&code_ranges, &info.function_sections),
            b"reloc.DATA" => (&data_ranges, &info.data_segment_sections),
            _ => continue,
        };
        let mut at = 0;
        read_uleb128(section.payload, &mut at)?; // target section index
        let count = read_uleb128(section.payload, &mut at)?;
        for _ in 0..count {
            let reloc = parse_reloc(section.payload, &mut at)?;
            let Some(slot) = ranges
                .iter()
                .position(|&(start, end)| (start..end).contains(&(reloc.0 as usize)))
            else {
                bail!("Relocation offset {} outside any body", reloc.0);
            };
            let (kind, length) = reloc.2;
            sections[section_of[slot]].relocs.push(InputReloc {
                offset: reloc.0 - ranges[slot].0 as u64,
                target: RelocTarget::Symbol(reloc.1),
                kind: RelocKind::Wasm(kind),
                addend: reloc.3,
                length,
                pcrel: false,
                subtrahend: None,
            });
        }
    }

    Ok(ObjectFile {
        name,
        cpu_arch: CpuArch::Wasm32,
        sections,
        symbols,
        subsections_via_symbols: true,
        wasm: Some(info),
        data_in_code: Vec::new(),
    })
}

fn read_name<'data>(payload: &'data [u8], at: &mut usize) -> Result<&'data [u8]> {
    let len = read_uleb128(payload, at)? as usize;
    let name = payload.get(*at..*at + len).ok_or(LinkError::NotObject)?;
    *at += len;
    Ok(name)
}

fn skip_limits(payload: &[u8], at: &mut usize) -> Result {
    let flags = read_uleb128(payload, at)?;
    read_uleb128(payload, at)?;
    if flags & 1 != 0 {
        read_uleb128(payload, at)?;
    }
    Ok(())
}

fn skip_init_expr(payload: &[u8], at: &mut usize) -> Result {
    loop {
        let Some(&op) = payload.get(*at) else {
            bail!("Truncated init expression");
        };
        *at += 1;
        match op {
            0x0b => return Ok(()), // end
            0x41 => {
                read_sleb128(payload, at)?; // i32.const
            }
            0x23 => {
                read_uleb128(payload, at)?; // global.get
            }
            other => bail!("Unsupported init expression opcode {other:#x}"),
        }
    }
}

/// Symbol rows as read from the symbol table; section indexes aren't known
/// while the linking section is being parsed, so materialization into
/// `InputSymbol`s happens afterwards in `build_symbols`.
struct RawSymbol<'data> {
    name: &'data [u8],
    flags: u32,
    kind: u8,
    index: u32,
    offset: u64,
    size: u64,
}

fn parse_linking<'data>(
    payload: &'data [u8],
    info: &WasmModuleInfo<'data>,
    segment_infos: &mut Vec<WasmDataSegmentInfo<'data>>,
) -> Result<Vec<RawSymbol<'data>>> {
    let mut raw_symbols = Vec::new();
    let mut at = 0;
    let version = read_uleb128(payload, &mut at)?;
    if version != 2 {
        bail!("Unsupported linking section version {version}");
    }
    while at < payload.len() {
        let subsection = payload[at];
        at += 1;
        let size = read_uleb128(payload, &mut at)? as usize;
        let sub = payload.get(at..at + size).ok_or(LinkError::NotObject)?;
        at += size;
        match subsection {
            SUBSECTION_SEGMENT_INFO => {
                let mut sat = 0;
                let count = read_uleb128(sub, &mut sat)?;
                for _ in 0..count {
                    let name = read_name(sub, &mut sat)?;
                    let align = read_uleb128(sub, &mut sat)? as u8;
                    read_uleb128(sub, &mut sat)?; // segment flags
                    segment_infos.push(WasmDataSegmentInfo {
                        name,
                        alignment: Alignment::from_log2(align)?,
                    });
                }
            }
            SUBSECTION_SYMBOL_TABLE => {
                let mut sat = 0;
                let count = read_uleb128(sub, &mut sat)?;
                for _ in 0..count {
                    let kind = *sub.get(sat).ok_or(LinkError::NotObject)?;
                    sat += 1;
                    let flags = read_uleb128(sub, &mut sat)? as u32;
                    match kind {
                        SYMTAB_FUNCTION | SYMTAB_GLOBAL | SYMTAB_TABLE | SYMTAB_EVENT => {
                            let index = read_uleb128(sub, &mut sat)? as u32;
                            let undefined = flags & WASM_SYM_UNDEFINED != 0;
                            let explicit_name = flags & 0x40 != 0;
                            let name = if !undefined || explicit_name {
                                read_name(sub, &mut sat)?
                            } else {
                                // The name comes from the import table.
                                import_field_name(info, kind, index)?
                            };
                            raw_symbols.push(RawSymbol {
                                name,
                                flags,
                                kind,
                                index,
                                offset: 0,
                                size: 0,
                            });
                        }
                        SYMTAB_DATA => {
                            let name = read_name(sub, &mut sat)?;
                            let undefined = flags & WASM_SYM_UNDEFINED != 0;
                            let (index, offset, size) = if undefined {
                                (0, 0, 0)
                            } else {
                                (
                                    read_uleb128(sub, &mut sat)? as u32,
                                    read_uleb128(sub, &mut sat)?,
                                    read_uleb128(sub, &mut sat)?,
                                )
                            };
                            raw_symbols.push(RawSymbol {
                                name,
                                flags,
                                kind,
                                index,
                                offset,
                                size,
                            });
                        }
                        SYMTAB_SECTION => {
                            read_uleb128(sub, &mut sat)?;
                            raw_symbols.push(RawSymbol {
                                name: b"",
                                flags: flags | WASM_SYM_BINDING_LOCAL,
                                kind,
                                index: u32::MAX,
                                offset: 0,
                                size: 0,
                            });
                        }
                        other => bail!("Unsupported symbol kind {other}"),
                    }
                }
            }
            _ => {}
        }
    }
    Ok(raw_symbols)
}

fn import_field_name<'data>(
    info: &WasmModuleInfo<'data>,
    kind: u8,
    index: u32,
) -> Result<&'data [u8]> {
    let mut seen = 0u32;
    for import in &info.imports {
        let matches = matches!(
            (&import.kind, kind),
            (WasmImportKind::Function(_), SYMTAB_FUNCTION)
                | (WasmImportKind::Global(_), SYMTAB_GLOBAL)
                | (WasmImportKind::Table(_), SYMTAB_TABLE)
        );
        if matches {
            if seen == index {
                return Ok(import.field);
            }
            seen += 1;
        }
    }
    bail!("Undefined symbol references import {index} which doesn't exist");
}

fn build_symbols<'data>(
    info: &mut WasmModuleInfo<'data>,
    raw_symbols: Vec<RawSymbol<'data>>,
    symbols: &mut Vec<InputSymbol<'data>>,
) -> Result {
    for raw in raw_symbols {
        let undefined = raw.flags & WASM_SYM_UNDEFINED != 0;
        let mut flags = SymFlags::empty();
        let mut section = None;
        let mut value = 0;

        match raw.kind {
            SYMTAB_FUNCTION => {
                flags |= SymFlags::FUNCTION;
                if undefined {
                    flags |= SymFlags::UNDEFINED;
                } else {
                    let defined_index = raw
                        .index
                        .checked_sub(info.num_func_imports)
                        .ok_or_else(|| anyhow::anyhow!("Defined symbol references import"))?;
                    section = info.function_sections.get(defined_index as usize).copied();
                    if section.is_none() {
                        bail!("Function symbol index {} out of range", raw.index);
                    }
                }
                info.symbol_info.push(WasmSymbolInfo {
                    kind: WasmSymbolKind::Function,
                    index: raw.index,
                });
            }
            SYMTAB_DATA => {
                if undefined {
                    flags |= SymFlags::UNDEFINED;
                } else {
                    section = info.data_segment_sections.get(raw.index as usize).copied();
                    if section.is_none() {
                        bail!("Data symbol segment {} out of range", raw.index);
                    }
                    value = raw.offset;
                }
                info.symbol_info.push(WasmSymbolInfo {
                    kind: WasmSymbolKind::Data,
                    index: raw.index,
                });
            }
            SYMTAB_GLOBAL | SYMTAB_TABLE | SYMTAB_EVENT => {
                // Globals and tables don't occupy the address space; the
                // writer renumbers them via `symbol_info`.
                if undefined {
                    flags |= SymFlags::UNDEFINED;
                } else {
                    flags |= SymFlags::ABSOLUTE;
                    value = u64::from(raw.index);
                }
                info.symbol_info.push(WasmSymbolInfo {
                    kind: if raw.kind == SYMTAB_TABLE {
                        WasmSymbolKind::Table
                    } else {
                        WasmSymbolKind::Global
                    },
                    index: raw.index,
                });
            }
            SYMTAB_SECTION => {
                flags |= SymFlags::ABSOLUTE;
                info.symbol_info.push(WasmSymbolInfo {
                    kind: WasmSymbolKind::Data,
                    index: u32::MAX,
                });
            }
            other => bail!("Unsupported symbol kind {other}"),
        }

        if raw.flags & WASM_SYM_VISIBILITY_HIDDEN != 0 {
            flags |= SymFlags::PRIVATE_EXTERN;
        }
        if raw.flags & WASM_SYM_NO_STRIP != 0 {
            flags |= SymFlags::NO_DEAD_STRIP;
        }
        let binding = if raw.flags & WASM_SYM_BINDING_LOCAL != 0 {
            Binding::Local
        } else if raw.flags & WASM_SYM_BINDING_WEAK != 0 {
            Binding::Weak
        } else {
            Binding::Global
        };

        symbols.push(InputSymbol {
            name: raw.name,
            value,
            size: raw.size,
            section,
            binding,
            flags,
            common_alignment: None,
        });
    }
    Ok(())
}

fn parse_reloc(payload: &[u8], at: &mut usize) -> Result<(u64, u32, (WasmRelocKind, u8), i64)> {
    let ty = *payload.get(*at).ok_or(LinkError::NotObject)?;
    *at += 1;
    let offset = read_uleb128(payload, at)?;
    let index = read_uleb128(payload, at)? as u32;
    let (kind, length, has_addend) = match ty {
        R_WASM_FUNCTION_INDEX_LEB => (WasmRelocKind::FunctionIndexLeb, 5, false),
        R_WASM_TABLE_INDEX_SLEB => (WasmRelocKind::TableIndexSleb, 5, false),
        R_WASM_TABLE_INDEX_I32 => (WasmRelocKind::TableIndexI32, 4, false),
        R_WASM_MEMORY_ADDR_LEB => (WasmRelocKind::MemoryAddrLeb, 5, true),
        R_WASM_MEMORY_ADDR_SLEB => (WasmRelocKind::MemoryAddrSleb, 5, true),
        R_WASM_MEMORY_ADDR_I32 => (WasmRelocKind::MemoryAddrI32, 4, true),
        R_WASM_TYPE_INDEX_LEB => (WasmRelocKind::TypeIndexLeb, 5, false),
        R_WASM_GLOBAL_INDEX_LEB => (WasmRelocKind::GlobalIndexLeb, 5, false),
        other => bail!("Unsupported wasm relocation type {other}"),
    };
    let addend = if has_addend {
        read_sleb128(payload, at)?
    } else {
        0
    };
    Ok((offset, index, (kind, length), addend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128::write_uleb128;

    /// Builds a minimal object: one imported function `ext`, one defined
    /// function `foo` that calls it, with a FUNCTION_INDEX_LEB reloc.
    fn minimal_object() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"\0asm\x01\0\0\0");

        let mut push_section = |out: &mut Vec<u8>, id: u8, payload: &[u8]| {
            out.push(id);
            write_uleb128(out, payload.len() as u64);
            out.extend_from_slice(payload);
        };

        // type: () -> ()
        push_section(&mut out, SECTION_TYPE, &[0x01, 0x60, 0x00, 0x00]);
        // import: env.ext func type 0
        let mut imports = vec![0x01];
        imports.push(3);
        imports.extend_from_slice(b"env");
        imports.push(3);
        imports.extend_from_slice(b"ext");
        imports.extend_from_slice(&[0x00, 0x00]);
        push_section(&mut out, SECTION_IMPORT, &imports);
        // function: one defined function of type 0
        push_section(&mut out, SECTION_FUNCTION, &[0x01, 0x00]);
        // code: one body: 0 locals; call <5-byte leb 0>; end
        let body = [0x00, 0x10, 0x80, 0x80, 0x80, 0x80, 0x00, 0x0b];
        let mut code = vec![0x01];
        write_uleb128(&mut code, body.len() as u64);
        let body_start_in_payload = code.len();
        code.extend_from_slice(&body);
        push_section(&mut out, SECTION_CODE, &code);

        // linking: version 2, symbol table with the import then the function.
        let mut symtab = Vec::new();
        write_uleb128(&mut symtab, 2);
        symtab.push(SYMTAB_FUNCTION);
        write_uleb128(&mut symtab, u64::from(WASM_SYM_UNDEFINED));
        write_uleb128(&mut symtab, 0); // import index
        symtab.push(SYMTAB_FUNCTION);
        write_uleb128(&mut symtab, 0); // defined, default binding
        write_uleb128(&mut symtab, 1); // function index (after 1 import)
        symtab.push(3);
        symtab.extend_from_slice(b"foo");
        let mut linking = Vec::new();
        write_uleb128(&mut linking, 2); // version
        linking.push(SUBSECTION_SYMBOL_TABLE);
        write_uleb128(&mut linking, symtab.len() as u64);
        linking.extend_from_slice(&symtab);
        let mut linking_payload = Vec::new();
        linking_payload.push(7);
        linking_payload.extend_from_slice(b"linking");
        linking_payload.extend_from_slice(&linking);
        push_section(&mut out, SECTION_CUSTOM, &linking_payload);

        // reloc.CODE: one FUNCTION_INDEX_LEB at the call's operand, against
        // symbol 0 (the import).
        let mut reloc = Vec::new();
        write_uleb128(&mut reloc, 5); // target section index (unused by us)
        write_uleb128(&mut reloc, 1);
        reloc.push(R_WASM_FUNCTION_INDEX_LEB);
        write_uleb128(&mut reloc, (body_start_in_payload + 2) as u64);
        write_uleb128(&mut reloc, 0);
        let mut reloc_payload = Vec::new();
        reloc_payload.push(10);
        reloc_payload.extend_from_slice(b"reloc.CODE");
        reloc_payload.extend_from_slice(&reloc);
        push_section(&mut out, SECTION_CUSTOM, &reloc_payload);

        out
    }

    #[test]
    fn test_parse_minimal_object() {
        let bytes = minimal_object();
        let object = parse(&bytes, "test.o".to_owned(), CpuArch::Wasm32).unwrap();

        assert_eq!(object.sections.len(), 1);
        assert_eq!(object.sections[0].kind, SectionKind::Code);
        assert_eq!(object.symbols.len(), 2);
        assert!(object.symbols[0].is_undefined());
        assert_eq!(object.symbols[0].name, b"ext");
        assert_eq!(object.symbols[1].name, b"foo");
        assert_eq!(object.symbols[1].section, Some(0));

        let relocs = &object.sections[0].relocs;
        assert_eq!(relocs.len(), 1);
        assert_eq!(
            relocs[0].kind,
            RelocKind::Wasm(WasmRelocKind::FunctionIndexLeb)
        );
        // Offset is rebased to within the function body.
        assert_eq!(relocs[0].offset, 2);

        let info = object.wasm.unwrap();
        assert_eq!(info.num_func_imports, 1);
        assert_eq!(info.function_types, vec![0]);
        assert_eq!(info.types.len(), 1);
    }

    #[test]
    fn test_wrong_arch_rejected() {
        let bytes = minimal_object();
        assert!(parse(&bytes, "test.o".to_owned(), CpuArch::X86_64).is_err());
    }
}
