//! S2: symbol resolution. Walks every object's symbol table into the global
//! table, pulls archive members in until a fixed point, binds leftover
//! undefineds against dylibs, registers the per-backend synthetic symbols,
//! and finally reports whatever is still undefined.

use crate::args::Backend;
use crate::args::Options;
use crate::args::OutputMode;
use crate::error::LinkError;
use crate::error::Result;
use crate::parsing;
use crate::parsing::LinkInputs;
use crate::symbol::FileId;
use crate::symbol::SymbolName;
use crate::symbol_db::Definition;
use crate::symbol_db::GlobalIndex;
use crate::symbol_db::SymbolDb;

/// The non-lazy binder entry point every Mach-O stub helper calls through.
pub(crate) const DYLD_STUB_BINDER: &[u8] = b"dyld_stub_binder";

#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_symbols<'data>(
    opts: &'data Options,
    inputs: &mut LinkInputs<'data>,
    symbol_db: &mut SymbolDb<'data>,
) -> Result {
    for index in 0..inputs.objects.len() {
        let symbols = std::mem::take(&mut inputs.objects[index].symbols);
        symbol_db.add_object_symbols(FileId(index as u32), &symbols)?;
        inputs.objects[index].symbols = symbols;
    }

    register_references(opts, symbol_db);
    pull_in_archive_members(opts, inputs, symbol_db)?;
    bind_dylibs(inputs, symbol_db);
    register_synthetics(opts, symbol_db);
    check_entry_point(opts, symbol_db)?;
    report_undefined(opts, symbol_db)?;
    Ok(())
}

/// Names the linker itself is going to reference, registered before archive
/// search so their definitions can still be pulled out of an archive or bound
/// to a dylib.
fn register_references<'data>(opts: &'data Options, symbol_db: &mut SymbolDb<'data>) {
    if opts.is_exe() {
        let entry = opts.entry_symbol_name().as_bytes();
        let index = intern_reference(symbol_db, entry);
        symbol_db.global_mut(index).referenced = true;
    }
    if opts.backend == Backend::MachO {
        let index = intern_reference(symbol_db, DYLD_STUB_BINDER);
        symbol_db.global_mut(index).referenced = true;
    }
}

fn intern_reference<'data>(symbol_db: &mut SymbolDb<'data>, name: &'data [u8]) -> GlobalIndex {
    if let Some(existing) = symbol_db.lookup(&SymbolName::prehashed(name)) {
        return existing;
    }
    // Adding as synthetic then downgrading gives us an Undefined entry that
    // participates in archive search.
    let index = symbol_db.add_synthetic(name);
    let global = symbol_db.global_mut(index);
    if global.definition == Definition::Synthetic {
        global.definition = Definition::Undefined;
    }
    index
}

/// Archive pull-in. An archive member is loaded iff it defines at least one
/// name that is undefined at the moment the archive is inspected; loading a
/// member can create new undefineds, so archives are re-scanned until a whole
/// pass loads nothing.
#[tracing::instrument(skip_all, name = "Archive pull-in")]
fn pull_in_archive_members<'data>(
    opts: &Options,
    inputs: &mut LinkInputs<'data>,
    symbol_db: &mut SymbolDb<'data>,
) -> Result {
    loop {
        let mut loaded_any = false;

        for archive_index in 0..inputs.archives.len() {
            if !inputs.archives[archive_index].archive.has_symbols() {
                continue;
            }
            loop {
                let mut offsets_to_load = Vec::new();
                {
                    let link_archive = &inputs.archives[archive_index];
                    for undefined in symbol_db.undefined_globals() {
                        let name = symbol_db.global(undefined).name.bytes();
                        if let Some(&offset) = link_archive.toc_map.get(name) {
                            if !link_archive.loaded_members.contains(&offset)
                                && !offsets_to_load.contains(&offset)
                            {
                                offsets_to_load.push(offset);
                            }
                        }
                    }
                }
                if offsets_to_load.is_empty() {
                    break;
                }
                for offset in offsets_to_load {
                    if !inputs.archives[archive_index]
                        .loaded_members
                        .insert(offset)
                    {
                        continue;
                    }
                    let object = parsing::parse_member(
                        &inputs.archives[archive_index],
                        offset,
                        opts.target.cpu_arch,
                    )?;
                    let file_id = FileId(inputs.objects.len() as u32);
                    symbol_db.add_object_symbols(file_id, &object.symbols)?;
                    inputs.objects.push(object);
                    loaded_any = true;
                }
            }
        }

        if !loaded_any {
            return Ok(());
        }
    }
}

/// Binds remaining undefined globals to the first dylib exporting them.
/// Ordinals are one-based positions in load order.
fn bind_dylibs(inputs: &mut LinkInputs, symbol_db: &mut SymbolDb) {
    let undefined: Vec<GlobalIndex> = symbol_db.undefined_globals().collect();
    for global_index in undefined {
        let name = symbol_db.global(global_index).name.bytes().to_vec();
        for (dylib_index, dylib) in inputs.dylibs.iter_mut().enumerate() {
            if let Some(export) = dylib.exports_symbol(&name) {
                dylib.referenced = true;
                let global = symbol_db.global_mut(global_index);
                global.definition = Definition::Dylib {
                    ordinal: (dylib_index + 1) as u16,
                    weak: export.weak || dylib.weak,
                };
                global.weak = export.weak;
                break;
            }
        }
    }
}

/// Symbols the linker defines itself when something references them.
fn register_synthetics(opts: &Options, symbol_db: &mut SymbolDb) {
    match opts.backend {
        Backend::MachO => {
            if opts.output_mode == OutputMode::Exe {
                symbol_db.add_synthetic(b"__mh_execute_header");
            } else {
                symbol_db.add_synthetic(b"__mh_dylib_header");
            }
            symbol_db.add_synthetic(b"___dso_handle");
            // When no dylib provides the stub binder (fully static test
            // setups), the linker supplies a placeholder so the stub helper
            // still assembles.
            let binder = symbol_db
                .lookup(&SymbolName::prehashed(DYLD_STUB_BINDER))
                .expect("registered in register_references");
            let global = symbol_db.global_mut(binder);
            if global.definition == Definition::Undefined {
                global.definition = Definition::Synthetic;
            }
        }
        Backend::Elf => {
            for name in [
                &b"_GLOBAL_OFFSET_TABLE_"[..],
                b"__executable_start",
                b"__bss_start",
                b"_edata",
                b"_end",
            ] {
                if let Some(index) = symbol_db.lookup(&SymbolName::prehashed(name)) {
                    let global = symbol_db.global_mut(index);
                    if global.definition == Definition::Undefined {
                        global.definition = Definition::Synthetic;
                    }
                }
            }
        }
        Backend::Wasm | Backend::Coff => {}
    }
}

fn check_entry_point(opts: &Options, symbol_db: &mut SymbolDb) -> Result {
    if !opts.is_exe() {
        return Ok(());
    }
    let entry = opts.entry_symbol_name();
    let defined = symbol_db
        .lookup(&SymbolName::prehashed(entry.as_bytes()))
        .map(|index| symbol_db.global(index).definition)
        .is_some_and(|definition| {
            !matches!(definition, Definition::Undefined | Definition::FlatLookup)
        });
    if !defined {
        return Err(LinkError::MissingMainEntrypoint(entry.to_owned()).into());
    }
    Ok(())
}

/// Every name still undefined is either declared flat-lookup (`allow_undef`)
/// or reported, all together, as an error.
fn report_undefined(opts: &Options, symbol_db: &mut SymbolDb) -> Result {
    let undefined: Vec<GlobalIndex> = symbol_db
        .undefined_globals()
        .filter(|&index| symbol_db.global(index).referenced)
        .collect();
    if undefined.is_empty() {
        return Ok(());
    }
    if opts.allow_undef {
        for index in undefined {
            symbol_db.global_mut(index).definition = Definition::FlatLookup;
        }
        return Ok(());
    }
    let names = undefined
        .iter()
        .map(|&index| symbol_db.global(index).name.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(LinkError::UndefinedSymbolReference(names).into())
}
