//! S7 for WebAssembly: merge the input modules' index spaces (types,
//! functions, globals, table slots), resolve LEB-slot relocations, and emit
//! the sections in canonical order with fixed-width 5-byte size fields.
//! `data_count` lands immediately before `code` when shared memory is on, and
//! the `name`, `producers` and `target_features` custom sections close out
//! the file.

use crate::args::OutputMode;
use crate::atom::AtomIndex;
use crate::error::Result;
use crate::file_writer::SizedOutput;
use crate::layout::SectionLayout;
use crate::leb128::patch_uleb128_fixed5;
use crate::leb128::read_uleb128;
use crate::leb128::write_uleb128;
use crate::leb128::write_uleb128_fixed5;
use crate::object_file::RelocKind;
use crate::object_file::SymFlags;
use crate::object_file::WasmRelocKind;
use crate::output_section_id::OutputSections;
use crate::reloc_writer::LinkContext;
use crate::symbol::FileId;
use crate::symbol::SymbolRef;
use crate::symbol_db::Definition;
use crate::wasm;
use crate::wasm::WasmImportKind;
use crate::wasm::WasmSymbolKind;
use anyhow::bail;

const PAGE_SIZE: u64 = 65536;

/// Everything needed to renumber a reference from an input module into the
/// output index spaces.
struct IndexSpaces {
    /// Per file: input type index → output type index.
    type_maps: Vec<Vec<u32>>,
    /// Output type entries, deduplicated raw encodings.
    types: Vec<Vec<u8>>,
    /// Function imports in assignment order: (field name, output type index).
    func_imports: Vec<(Vec<u8>, u32)>,
    /// Global imports: (field name, type bytes).
    global_imports: Vec<(Vec<u8>, Vec<u8>)>,
    /// Code atoms in layout order; position = defined function index.
    code_atoms: Vec<AtomIndex>,
    func_index_of_atom: hashbrown::HashMap<AtomIndex, u32>,
    /// Per file: defined global index → output global index.
    global_maps: Vec<Vec<u32>>,
    globals: Vec<(Vec<u8>, Vec<u8>)>, // (type bytes, init bytes)
    /// Function table slots; slot 0 is reserved null.
    table_slots: Vec<u32>, // output function indexes
    table_slot_of_func: hashbrown::HashMap<u32, u32>,
    /// Global-table index (raw `GlobalIndex.0`) → import slot.
    func_import_of_global: hashbrown::HashMap<u32, u32>,
    global_import_of_global: hashbrown::HashMap<u32, u32>,
}

#[tracing::instrument(skip_all, name = "Write wasm output")]
pub(crate) fn write(ctx: &LinkContext, output_sections: &OutputSections) -> Result {
    let mut spaces = build_index_spaces(ctx)?;
    assign_table_slots(ctx, &mut spaces)?;

    let data_sections: Vec<&SectionLayout> = ctx
        .layout
        .sections
        .iter()
        .filter(|section| {
            section.id != crate::output_section_id::TEXT && section.size > 0 && !section.is_zerofill
        })
        .collect();
    let bss_end = ctx
        .layout
        .sections
        .iter()
        .map(|section| section.vmaddr + section.size)
        .max()
        .unwrap_or(1024);

    let mut module = Vec::new();
    module.extend_from_slice(b"\0asm");
    module.extend_from_slice(&1u32.to_le_bytes());

    // type
    let mut payload = Vec::new();
    write_uleb128(&mut payload, spaces.types.len() as u64);
    for ty in &spaces.types {
        payload.extend_from_slice(ty);
    }
    push_section(&mut module, wasm::SECTION_TYPE, &payload);

    // import
    let mut payload = Vec::new();
    let num_imports = spaces.func_imports.len()
        + spaces.global_imports.len()
        + usize::from(ctx.opts.import_memory);
    write_uleb128(&mut payload, num_imports as u64);
    for (field, type_index) in &spaces.func_imports {
        write_name(&mut payload, b"env");
        write_name(&mut payload, field);
        payload.push(0x00);
        write_uleb128(&mut payload, u64::from(*type_index));
    }
    for (field, ty) in &spaces.global_imports {
        write_name(&mut payload, b"env");
        write_name(&mut payload, field);
        payload.push(0x03);
        payload.extend_from_slice(ty);
    }
    if ctx.opts.import_memory {
        write_name(&mut payload, b"env");
        write_name(&mut payload, b"memory");
        payload.push(0x02);
        write_memory_limits(&mut payload, ctx, bss_end);
    }
    if num_imports > 0 {
        push_section(&mut module, wasm::SECTION_IMPORT, &payload);
    }

    // function
    let mut payload = Vec::new();
    write_uleb128(&mut payload, spaces.code_atoms.len() as u64);
    for &atom in &spaces.code_atoms {
        let type_index = function_type_of_atom(ctx, &spaces, atom)?;
        write_uleb128(&mut payload, u64::from(type_index));
    }
    if !spaces.code_atoms.is_empty() {
        push_section(&mut module, wasm::SECTION_FUNCTION, &payload);
    }

    // table
    if !spaces.table_slots.is_empty() {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, 1);
        payload.push(0x70); // funcref
        payload.push(0x00); // min only
        write_uleb128(&mut payload, spaces.table_slots.len() as u64 + 1);
        push_section(&mut module, wasm::SECTION_TABLE, &payload);
    }

    // memory
    if !ctx.opts.import_memory {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, 1);
        write_memory_limits(&mut payload, ctx, bss_end);
        push_section(&mut module, wasm::SECTION_MEMORY, &payload);
    }

    // global
    if !spaces.globals.is_empty() {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, spaces.globals.len() as u64);
        for (ty, init) in &spaces.globals {
            payload.extend_from_slice(ty);
            payload.extend_from_slice(init);
        }
        push_section(&mut module, wasm::SECTION_GLOBAL, &payload);
    }

    // export
    let mut payload = Vec::new();
    let mut exports: Vec<(Vec<u8>, u8, u32)> = Vec::new();
    if !ctx.opts.import_memory {
        exports.push((b"memory".to_vec(), 0x02, 0));
    }
    if ctx.opts.output_mode == OutputMode::Exe {
        if let Some(entry_index) = function_index_of_name(
            ctx,
            &spaces,
            ctx.opts.entry_symbol_name().as_bytes(),
        ) {
            exports.push((
                ctx.opts.entry_symbol_name().as_bytes().to_vec(),
                0x00,
                entry_index,
            ));
        }
    }
    // Library output re-exports every visible definition: functions as kind
    // 0x00, wasm globals as kind 0x03.
    if ctx.opts.output_mode == OutputMode::Lib {
        for global in &ctx.symbol_db.globals {
            let Definition::Object { file, sym_index } = global.definition else {
                continue;
            };
            let sym = &ctx.objects[file.as_usize()].symbols[sym_index as usize];
            if sym.flags.contains(SymFlags::PRIVATE_EXTERN) {
                continue;
            }
            let symbol = SymbolRef::object(file, sym_index);
            let wasm_kind = ctx.objects[file.as_usize()]
                .wasm
                .as_ref()
                .and_then(|info| info.symbol_info.get(sym_index as usize))
                .map(|info| info.kind);
            match wasm_kind {
                Some(WasmSymbolKind::Function) => {
                    if let Some(func) = function_index_of_symbol(ctx, &spaces, symbol) {
                        exports.push((global.name.bytes().to_vec(), 0x00, func));
                    }
                }
                Some(WasmSymbolKind::Global) => {
                    if let Some(index) = global_index_of_symbol(ctx, &spaces, symbol) {
                        exports.push((global.name.bytes().to_vec(), 0x03, index));
                    }
                }
                _ => {}
            }
        }
    }
    write_uleb128(&mut payload, exports.len() as u64);
    for (name, kind, index) in &exports {
        write_name(&mut payload, name);
        payload.push(*kind);
        write_uleb128(&mut payload, u64::from(*index));
    }
    push_section(&mut module, wasm::SECTION_EXPORT, &payload);

    // element
    if !spaces.table_slots.is_empty() {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, 1);
        write_uleb128(&mut payload, 0); // flags: active, table 0
        payload.push(0x41); // i32.const 1
        payload.push(0x01);
        payload.push(0x0b);
        write_uleb128(&mut payload, spaces.table_slots.len() as u64);
        for &func in &spaces.table_slots {
            write_uleb128(&mut payload, u64::from(func));
        }
        push_section(&mut module, wasm::SECTION_ELEMENT, &payload);
    }

    // data_count, immediately before code.
    if ctx.opts.shared_memory && !data_sections.is_empty() {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, data_sections.len() as u64);
        push_section(&mut module, wasm::SECTION_DATA_COUNT, &payload);
    }

    // code: bodies in atom order with relocations applied.
    let mut payload = Vec::new();
    write_uleb128(&mut payload, spaces.code_atoms.len() as u64);
    for &atom_index in &spaces.code_atoms {
        let atom = ctx.graph.pool.get(atom_index);
        let mut body = atom
            .data
            .bytes()
            .ok_or_else(|| anyhow::anyhow!("Code atom without bytes"))?
            .to_vec();
        apply_wasm_relocations(ctx, &spaces, atom_index, &mut body)?;
        write_uleb128(&mut payload, body.len() as u64);
        payload.extend_from_slice(&body);
    }
    if !spaces.code_atoms.is_empty() {
        push_section(&mut module, wasm::SECTION_CODE, &payload);
    }

    // data: one active segment per non-empty data section.
    if !data_sections.is_empty() {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, data_sections.len() as u64);
        for section in &data_sections {
            write_uleb128(&mut payload, 0); // flags
            payload.push(0x41); // i32.const vmaddr
            crate::leb128::write_sleb128(&mut payload, section.vmaddr as i64);
            payload.push(0x0b);
            let mut contents = vec![0u8; section.size as usize];
            let mut cursor = section.first_atom;
            while !cursor.is_null() {
                let atom = ctx.graph.pool.get(cursor);
                let start = (atom.address - section.vmaddr) as usize;
                if let Some(bytes) = atom.data.bytes() {
                    contents[start..start + bytes.len()].copy_from_slice(bytes);
                    let end = start + bytes.len();
                    apply_wasm_relocations(ctx, &spaces, cursor, &mut contents[start..end])?;
                }
                cursor = atom.next;
            }
            write_uleb128(&mut payload, contents.len() as u64);
            payload.extend_from_slice(&contents);
        }
        push_section(&mut module, wasm::SECTION_DATA, &payload);
    }

    // Custom sections: name, .debug_*, producers, target_features.
    push_custom_section(
        &mut module,
        b"name",
        &build_name_section(ctx, output_sections, &spaces),
    );
    if !ctx.opts.strip {
        for object in ctx.objects {
            let Some(info) = &object.wasm else { continue };
            for &(name, payload) in &info.debug_sections {
                push_custom_section(&mut module, name, payload);
            }
        }
    }
    push_custom_section(&mut module, b"producers", &build_producers(ctx)?);
    if let Some(features) = build_target_features(ctx)? {
        push_custom_section(&mut module, b"target_features", &features);
    }

    let mut output = SizedOutput::create(&ctx.opts.emit.full_path(), module.len() as u64)?;
    output.out.copy_from_slice(&module);
    output.finish(false)?;
    Ok(())
}

fn push_section(module: &mut Vec<u8>, id: u8, payload: &[u8]) {
    module.push(id);
    // Fixed-width size so the field can be back-patched; kept even when the
    // size is already known, for determinism with the patching writers.
    write_uleb128_fixed5(module, payload.len() as u32);
    module.extend_from_slice(payload);
}

fn push_custom_section(module: &mut Vec<u8>, name: &[u8], payload: &[u8]) {
    let mut full = Vec::with_capacity(name.len() + payload.len() + 1);
    write_name(&mut full, name);
    full.extend_from_slice(payload);
    push_section(module, wasm::SECTION_CUSTOM, &full);
}

fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    write_uleb128(out, name.len() as u64);
    out.extend_from_slice(name);
}

fn write_memory_limits(payload: &mut Vec<u8>, ctx: &LinkContext, bss_end: u64) {
    let min_pages = (bss_end + ctx.opts.stack_size.unwrap_or(64 * 1024)).div_ceil(PAGE_SIZE);
    if ctx.opts.shared_memory {
        // Shared memories require a maximum.
        payload.push(0x03);
        write_uleb128(payload, min_pages);
        write_uleb128(payload, min_pages.max(256));
    } else {
        payload.push(0x00);
        write_uleb128(payload, min_pages);
    }
}

fn build_index_spaces(ctx: &LinkContext) -> Result<IndexSpaces> {
    let mut spaces = IndexSpaces {
        type_maps: Vec::new(),
        types: Vec::new(),
        func_imports: Vec::new(),
        global_imports: Vec::new(),
        code_atoms: Vec::new(),
        func_index_of_atom: hashbrown::HashMap::new(),
        global_maps: Vec::new(),
        globals: Vec::new(),
        table_slots: Vec::new(),
        table_slot_of_func: hashbrown::HashMap::new(),
        func_import_of_global: hashbrown::HashMap::new(),
        global_import_of_global: hashbrown::HashMap::new(),
    };

    // Types: dedupe by raw encoding.
    let mut type_lookup: hashbrown::HashMap<Vec<u8>, u32> = hashbrown::HashMap::new();
    for object in ctx.objects {
        let Some(info) = &object.wasm else {
            bail!("Non-wasm object `{object}` in a wasm link");
        };
        let map = info
            .types
            .iter()
            .map(|&ty| {
                *type_lookup.entry(ty.to_vec()).or_insert_with(|| {
                    spaces.types.push(ty.to_vec());
                    spaces.types.len() as u32 - 1
                })
            })
            .collect();
        spaces.type_maps.push(map);
    }

    // Imports: one per still-undefined (flat-lookup) function/global global.
    let mut func_import_of_global: hashbrown::HashMap<u32, u32> = hashbrown::HashMap::new();
    let mut global_import_of_global: hashbrown::HashMap<u32, u32> = hashbrown::HashMap::new();
    for (file_index, object) in ctx.objects.iter().enumerate() {
        let info = object.wasm.as_ref().unwrap();
        for (sym_index, sym) in object.symbols.iter().enumerate() {
            if !sym.is_undefined() {
                continue;
            }
            let Some(global_index) = ctx
                .symbol_db
                .global_for(FileId(file_index as u32), sym_index as u32)
            else {
                continue;
            };
            if !matches!(
                ctx.symbol_db.global(global_index).definition,
                Definition::FlatLookup | Definition::Undefined
            ) {
                continue;
            }
            let wasm_info = info.symbol_info[sym_index];
            match wasm_info.kind {
                WasmSymbolKind::Function => {
                    func_import_of_global
                        .entry(global_index.0)
                        .or_insert_with(|| {
                            let type_index = import_type_index(info, wasm_info.index)
                                .map(|input_type| {
                                    spaces.type_maps[file_index][input_type as usize]
                                })
                                .unwrap_or(0);
                            spaces.func_imports.push((sym.name.to_vec(), type_index));
                            spaces.func_imports.len() as u32 - 1
                        });
                }
                WasmSymbolKind::Global => {
                    global_import_of_global
                        .entry(global_index.0)
                        .or_insert_with(|| {
                            let ty = import_global_type(info, wasm_info.index)
                                .unwrap_or_else(|| vec![0x7f, 0x01]);
                            spaces.global_imports.push((sym.name.to_vec(), ty));
                            spaces.global_imports.len() as u32 - 1
                        });
                }
                _ => {}
            }
        }
    }
    spaces.func_import_of_global = func_import_of_global;
    spaces.global_import_of_global = global_import_of_global;

    // Defined functions: the TEXT chain in layout order.
    if let Some(text) = ctx.layout.section_by_id(crate::output_section_id::TEXT) {
        let mut cursor = text.first_atom;
        while !cursor.is_null() {
            let out_index = (spaces.func_imports.len() + spaces.code_atoms.len()) as u32;
            spaces.func_index_of_atom.insert(cursor, out_index);
            spaces.code_atoms.push(cursor);
            cursor = ctx.graph.pool.get(cursor).next;
        }
    }

    // Defined globals, appended per file.
    for object in ctx.objects {
        let info = object.wasm.as_ref().unwrap();
        let base = (spaces.global_imports.len() + spaces.globals.len()) as u32;
        let map = (0..info.globals.len() as u32).map(|i| base + i).collect();
        for global in &info.globals {
            spaces
                .globals
                .push((global.ty.to_vec(), global.init.to_vec()));
        }
        spaces.global_maps.push(map);
    }

    Ok(spaces)
}

fn import_type_index(info: &wasm::WasmModuleInfo, func_index: u32) -> Option<u32> {
    let mut seen = 0u32;
    for import in &info.imports {
        if let WasmImportKind::Function(type_index) = import.kind {
            if seen == func_index {
                return Some(type_index);
            }
            seen += 1;
        }
    }
    None
}

fn import_global_type(info: &wasm::WasmModuleInfo, global_index: u32) -> Option<Vec<u8>> {
    let mut seen = 0u32;
    for import in &info.imports {
        if let WasmImportKind::Global(ty) = &import.kind {
            if seen == global_index {
                return Some(ty.to_vec());
            }
            seen += 1;
        }
    }
    None
}

fn function_type_of_atom(ctx: &LinkContext, spaces: &IndexSpaces, atom: AtomIndex) -> Result<u32> {
    let file = ctx
        .graph
        .pool
        .get(atom)
        .file
        .ok_or_else(|| anyhow::anyhow!("Synthetic atom in wasm code section"))?;
    let info = ctx.objects[file.as_usize()].wasm.as_ref().unwrap();
    let Some((section_index, _)) = ctx.graph.pool.get(atom).input_range else {
        bail!("Code atom lost its input section");
    };
    let defined_index = info
        .function_sections
        .iter()
        .position(|&s| s == section_index as usize)
        .ok_or_else(|| anyhow::anyhow!("Code atom's section is not a function"))?;
    let input_type = info.function_types[defined_index];
    Ok(spaces.type_maps[file.as_usize()][input_type as usize])
}

fn function_index_of_symbol(
    ctx: &LinkContext,
    spaces: &IndexSpaces,
    symbol: SymbolRef,
) -> Option<u32> {
    if let Some(file) = symbol.file() {
        if let Some(global_index) = ctx.symbol_db.global_for(file, symbol.index()) {
            if let Some(&import) = spaces.func_import_of_global.get(&global_index.0) {
                return Some(import);
            }
        }
    }
    let (atom, _) = crate::layout::atom_for_symbol(
        ctx.symbol_db,
        ctx.graph,
        ctx.synthetics,
        symbol,
    )?;
    spaces.func_index_of_atom.get(&atom).copied()
}

fn function_index_of_name(ctx: &LinkContext, spaces: &IndexSpaces, name: &[u8]) -> Option<u32> {
    let global_index = ctx
        .symbol_db
        .lookup(&crate::symbol::SymbolName::prehashed(name))?;
    let Definition::Object { file, sym_index } = ctx.symbol_db.global(global_index).definition
    else {
        return None;
    };
    function_index_of_symbol(ctx, spaces, SymbolRef::object(file, sym_index))
}

fn global_index_of_symbol(
    ctx: &LinkContext,
    spaces: &IndexSpaces,
    symbol: SymbolRef,
) -> Option<u32> {
    let file = symbol.file()?;
    if let Some(global_index) = ctx.symbol_db.global_for(file, symbol.index()) {
        if let Some(&import) = spaces.global_import_of_global.get(&global_index.0) {
            return Some(import);
        }
        if let Definition::Object { file, sym_index } =
            ctx.symbol_db.global(global_index).definition
        {
            return resolved_global_index(ctx, spaces, file, sym_index);
        }
    }
    resolved_global_index(ctx, spaces, file, symbol.index())
}

fn resolved_global_index(
    ctx: &LinkContext,
    spaces: &IndexSpaces,
    file: FileId,
    sym_index: u32,
) -> Option<u32> {
    let info = ctx.objects[file.as_usize()].wasm.as_ref()?;
    let wasm_info = info.symbol_info.get(sym_index as usize)?;
    let defined_index = wasm_info.index.checked_sub(info.num_global_imports)?;
    spaces.global_maps[file.as_usize()]
        .get(defined_index as usize)
        .copied()
}

fn assign_table_slots(ctx: &LinkContext, spaces: &mut IndexSpaces) -> Result {
    let mut claim = |spaces: &mut IndexSpaces, func: u32| {
        if !spaces.table_slot_of_func.contains_key(&func) {
            let slot = spaces.table_slots.len() as u32 + 1;
            spaces.table_slots.push(func);
            spaces.table_slot_of_func.insert(func, slot);
        }
    };

    // Functions the inputs already placed in their indirect-call tables keep
    // a slot, in module order.
    for (file_index, object) in ctx.objects.iter().enumerate() {
        let Some(info) = &object.wasm else {
            continue;
        };
        for &input_index in &info.element_functions {
            if let Some(func) =
                out_func_index_for_input(ctx, spaces, FileId(file_index as u32), input_index)
            {
                claim(spaces, func);
            }
        }
    }

    // Then slots are handed out in first-use order over the table-index
    // relocations; slot 0 stays null.
    for &atom_index in &spaces.code_atoms.clone() {
        for reloc in &ctx.graph.pool.get(atom_index).relocs {
            let RelocKind::Wasm(
                WasmRelocKind::TableIndexSleb | WasmRelocKind::TableIndexI32,
            ) = reloc.kind
            else {
                continue;
            };
            let Some(func) = function_index_of_symbol(ctx, spaces, reloc.target) else {
                bail!("Table-index relocation against an unresolved function");
            };
            claim(spaces, func);
        }
    }
    Ok(())
}

/// Maps an input module's function index (imports first) to the output index
/// space. Imports resolve by name through the global table, so an import
/// that another module defines lands on the definition.
fn out_func_index_for_input(
    ctx: &LinkContext,
    spaces: &IndexSpaces,
    file: FileId,
    input_index: u32,
) -> Option<u32> {
    let info = ctx.objects[file.as_usize()].wasm.as_ref()?;
    match input_index.checked_sub(info.num_func_imports) {
        None => {
            let field = nth_func_import_field(info, input_index)?;
            let global_index = ctx
                .symbol_db
                .lookup(&crate::symbol::SymbolName::prehashed(field))?;
            if let Some(&import) = spaces.func_import_of_global.get(&global_index.0) {
                return Some(import);
            }
            match ctx.symbol_db.global(global_index).definition {
                Definition::Object { file, sym_index } => {
                    function_index_of_symbol(ctx, spaces, SymbolRef::object(file, sym_index))
                }
                _ => None,
            }
        }
        Some(defined_index) => {
            let section = *info.function_sections.get(defined_index as usize)?;
            let atom = ctx
                .graph
                .pool
                .iter()
                .find(|(_, atom)| {
                    atom.file == Some(file)
                        && atom
                            .input_range
                            .is_some_and(|(input_section, _)| input_section as usize == section)
                })?
                .0;
            spaces.func_index_of_atom.get(&atom).copied()
        }
    }
}

fn nth_func_import_field<'data>(
    info: &wasm::WasmModuleInfo<'data>,
    index: u32,
) -> Option<&'data [u8]> {
    let mut seen = 0u32;
    for import in &info.imports {
        if matches!(import.kind, WasmImportKind::Function(_)) {
            if seen == index {
                return Some(import.field);
            }
            seen += 1;
        }
    }
    None
}

fn apply_wasm_relocations(
    ctx: &LinkContext,
    spaces: &IndexSpaces,
    atom_index: AtomIndex,
    body: &mut [u8],
) -> Result {
    let atom = ctx.graph.pool.get(atom_index);
    for reloc in &atom.relocs {
        let RelocKind::Wasm(kind) = reloc.kind else {
            bail!("Native relocation in a wasm atom");
        };
        let at = reloc.offset as usize;
        match kind {
            WasmRelocKind::FunctionIndexLeb => {
                let func = function_index_of_symbol(ctx, spaces, reloc.target)
                    .ok_or_else(|| anyhow::anyhow!("Call to unresolved function"))?;
                patch_uleb128_fixed5(body, at, func);
            }
            WasmRelocKind::TypeIndexLeb => {
                let file = atom.file.expect("wasm atoms come from objects");
                let out_type = spaces.type_maps[file.as_usize()]
                    .get(reloc.target.index() as usize)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Type index out of range"))?;
                patch_uleb128_fixed5(body, at, out_type);
            }
            WasmRelocKind::GlobalIndexLeb => {
                let global = global_index_of_symbol(ctx, spaces, reloc.target)
                    .ok_or_else(|| anyhow::anyhow!("Reference to unresolved global"))?;
                patch_uleb128_fixed5(body, at, global);
            }
            WasmRelocKind::TableIndexSleb => {
                let func = function_index_of_symbol(ctx, spaces, reloc.target)
                    .ok_or_else(|| anyhow::anyhow!("Table reference to unresolved function"))?;
                let slot = spaces.table_slot_of_func[&func];
                patch_sleb128_fixed5(body, at, slot as i32);
            }
            WasmRelocKind::TableIndexI32 => {
                let func = function_index_of_symbol(ctx, spaces, reloc.target)
                    .ok_or_else(|| anyhow::anyhow!("Table reference to unresolved function"))?;
                let slot = spaces.table_slot_of_func[&func];
                body[at..at + 4].copy_from_slice(&slot.to_le_bytes());
            }
            WasmRelocKind::MemoryAddrLeb => {
                let address = ctx.symbol_address(reloc.target)? as i64 + reloc.addend;
                patch_uleb128_fixed5(body, at, u32::try_from(address)?);
            }
            WasmRelocKind::MemoryAddrSleb => {
                let address = ctx.symbol_address(reloc.target)? as i64 + reloc.addend;
                patch_sleb128_fixed5(body, at, i32::try_from(address)?);
            }
            WasmRelocKind::MemoryAddrI32 => {
                let address = ctx.symbol_address(reloc.target)? as i64 + reloc.addend;
                body[at..at + 4].copy_from_slice(&(address as i32).to_le_bytes());
            }
        }
    }
    Ok(())
}

fn patch_sleb128_fixed5(out: &mut [u8], at: usize, value: i32) {
    let mut value = i64::from(value);
    for i in 0..4 {
        out[at + i] = (value & 0x7f) as u8 | 0x80;
        value >>= 7;
    }
    out[at + 4] = (value & 0x7f) as u8;
}

/// `name` custom section: function names (imports then defined) and
/// data-segment names.
fn build_name_section(
    ctx: &LinkContext,
    output_sections: &OutputSections,
    spaces: &IndexSpaces,
) -> Vec<u8> {
    let mut out = Vec::new();

    let mut function_names: Vec<(u32, Vec<u8>)> = Vec::new();
    for (index, (name, _)) in spaces.func_imports.iter().enumerate() {
        function_names.push((index as u32, name.clone()));
    }
    for &atom_index in &spaces.code_atoms {
        let Some(&func) = spaces.func_index_of_atom.get(&atom_index) else {
            continue;
        };
        let atom = ctx.graph.pool.get(atom_index);
        let Some(file) = atom.primary.file() else {
            continue;
        };
        let Some(sym) = ctx.objects[file.as_usize()]
            .symbols
            .get(atom.primary.index() as usize)
        else {
            continue;
        };
        if !sym.name.is_empty() {
            function_names.push((func, sym.name.to_vec()));
        }
    }
    if !function_names.is_empty() {
        let mut sub = Vec::new();
        write_uleb128(&mut sub, function_names.len() as u64);
        for (index, name) in &function_names {
            write_uleb128(&mut sub, u64::from(*index));
            write_name(&mut sub, name);
        }
        out.push(1); // function names
        write_uleb128(&mut out, sub.len() as u64);
        out.extend_from_slice(&sub);
    }

    let mut data_names: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut segment = 0u32;
    for section in &ctx.layout.sections {
        if section.id == crate::output_section_id::TEXT
            || section.size == 0
            || section.is_zerofill
        {
            continue;
        }
        data_names.push((segment, output_sections.def(section.id).name.clone()));
        segment += 1;
    }
    if !data_names.is_empty() {
        let mut sub = Vec::new();
        write_uleb128(&mut sub, data_names.len() as u64);
        for (index, name) in &data_names {
            write_uleb128(&mut sub, u64::from(*index));
            write_name(&mut sub, name);
        }
        out.push(9); // data segment names
        write_uleb128(&mut out, sub.len() as u64);
        out.extend_from_slice(&sub);
    }

    out
}

/// Merge the inputs' `producers` sections and add ourselves to processed-by.
fn build_producers(ctx: &LinkContext) -> Result<Vec<u8>> {
    type FieldMap = Vec<(Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>)>;
    let mut fields: FieldMap = Vec::new();
    let mut add = |field: &[u8], name: &[u8], version: &[u8]| {
        let entry = match fields.iter_mut().find(|(f, _)| f == field) {
            Some((_, values)) => values,
            None => {
                fields.push((field.to_vec(), Vec::new()));
                &mut fields.last_mut().unwrap().1
            }
        };
        if !entry.iter().any(|(n, v)| n == name && v == version) {
            entry.push((name.to_vec(), version.to_vec()));
        }
    };

    for object in ctx.objects {
        let Some(payload) = object.wasm.as_ref().and_then(|info| info.producers) else {
            continue;
        };
        let mut at = 0;
        let field_count = read_uleb128(payload, &mut at)?;
        for _ in 0..field_count {
            let field = read_name_at(payload, &mut at)?;
            let value_count = read_uleb128(payload, &mut at)?;
            for _ in 0..value_count {
                let name = read_name_at(payload, &mut at)?;
                let version = read_name_at(payload, &mut at)?;
                add(field, name, version);
            }
        }
    }
    add(b"processed-by", b"zld", env!("CARGO_PKG_VERSION").as_bytes());

    let mut out = Vec::new();
    write_uleb128(&mut out, fields.len() as u64);
    for (field, values) in &fields {
        write_name(&mut out, field);
        write_uleb128(&mut out, values.len() as u64);
        for (name, version) in values {
            write_name(&mut out, name);
            write_name(&mut out, version);
        }
    }
    Ok(out)
}

/// Union of the inputs' feature sets.
fn build_target_features(ctx: &LinkContext) -> Result<Option<Vec<u8>>> {
    let mut features: Vec<(u8, Vec<u8>)> = Vec::new();
    for object in ctx.objects {
        let Some(payload) = object.wasm.as_ref().and_then(|info| info.target_features)
        else {
            continue;
        };
        let mut at = 0;
        let count = read_uleb128(payload, &mut at)?;
        for _ in 0..count {
            let prefix = payload[at];
            at += 1;
            let name = read_name_at(payload, &mut at)?;
            if !features.iter().any(|(_, n)| n == name) {
                features.push((prefix, name.to_vec()));
            }
        }
    }
    if features.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::new();
    write_uleb128(&mut out, features.len() as u64);
    for (prefix, name) in &features {
        out.push(*prefix);
        write_name(&mut out, name);
    }
    Ok(Some(out))
}

fn read_name_at<'a>(payload: &'a [u8], at: &mut usize) -> Result<&'a [u8]> {
    let len = read_uleb128(payload, at)? as usize;
    let name = payload
        .get(*at..*at + len)
        .ok_or_else(|| anyhow::anyhow!("Truncated name"))?;
    *at += len;
    Ok(name)
}
