//! S4: linker-generated atoms. GOT slots, stubs, lazy pointers, stub
//! helpers, TLV pointers, tentative-definition storage and (during layout)
//! aarch64 range-extension thunks all come from here. Every kind is keyed by
//! its target so a given symbol gets at most one of each.

use crate::alignment;
use crate::args::Backend;
use crate::args::CpuArch;
use crate::args::Options;
use crate::atom::Atom;
use crate::atom::AtomData;
use crate::atom::AtomIndex;
use crate::atom::NULL_ATOM;
use crate::atom::Relocation;
use crate::atom_builder::AtomGraph;
use crate::error::Result;
use crate::object_file::RelocKind;
use crate::output_section_id;
use crate::output_section_id::OutputSectionId;
use crate::resolution::DYLD_STUB_BINDER;
use crate::symbol::FileId;
use crate::symbol::SymbolName;
use crate::symbol::SymbolRef;
use crate::symbol_db::Definition;
use crate::symbol_db::GlobalIndex;
use crate::symbol_db::SymbolDb;

/// Canonical identity of a relocation target, used to key synthetic atoms.
/// External references collapse to their global; locals stay per-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TargetKey {
    Global(GlobalIndex),
    Local(FileId, u32),
    Synthetic(u32),
}

pub(crate) fn target_key(symbol_db: &SymbolDb, symbol: SymbolRef) -> TargetKey {
    match symbol.file() {
        None => TargetKey::Synthetic(symbol.index()),
        Some(file) => match symbol_db.global_for(file, symbol.index()) {
            Some(global) => TargetKey::Global(global),
            None => TargetKey::Local(file, symbol.index()),
        },
    }
}

/// Resolved definition class of a target, as far as indirection decisions
/// care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetClass {
    /// Defined in this link (object atom, tentative storage, or synthetic).
    Local,
    /// Bound to a dylib or flat-namespace lookup; needs binding at runtime.
    External { weak: bool },
}

pub(crate) fn classify_target(symbol_db: &SymbolDb, symbol: SymbolRef) -> TargetClass {
    match target_key(symbol_db, symbol) {
        TargetKey::Global(global) => match symbol_db.global(global).definition {
            Definition::Dylib { weak, .. } => TargetClass::External { weak },
            Definition::FlatLookup => TargetClass::External { weak: false },
            _ => TargetClass::Local,
        },
        _ => TargetClass::Local,
    }
}

/// One kind of uniquely-keyed synthetic atom, in creation order.
#[derive(Default)]
pub(crate) struct UniqueAtoms {
    map: hashbrown::HashMap<TargetKey, AtomIndex>,
    pub(crate) order: Vec<(TargetKey, AtomIndex)>,
}

impl UniqueAtoms {
    pub(crate) fn get(&self, key: TargetKey) -> Option<AtomIndex> {
        self.map.get(&key).copied()
    }

    fn insert(&mut self, key: TargetKey, atom: AtomIndex) {
        if self.map.insert(key, atom).is_none() {
            self.order.push((key, atom));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub(crate) struct Synthetics {
    pub(crate) got: UniqueAtoms,
    pub(crate) stubs: UniqueAtoms,
    pub(crate) lazy_ptrs: UniqueAtoms,
    pub(crate) stub_helpers: UniqueAtoms,
    pub(crate) tlv_ptrs: UniqueAtoms,
    pub(crate) tentative: hashbrown::HashMap<GlobalIndex, AtomIndex>,
    pub(crate) stub_helper_preamble: Option<AtomIndex>,
    pub(crate) dyld_private: Option<AtomIndex>,
}

#[tracing::instrument(skip_all, name = "Create synthetic atoms")]
pub(crate) fn create_synthetics<'data>(
    opts: &Options,
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
) -> Result<Synthetics> {
    let mut synthetics = Synthetics {
        got: UniqueAtoms::default(),
        stubs: UniqueAtoms::default(),
        lazy_ptrs: UniqueAtoms::default(),
        stub_helpers: UniqueAtoms::default(),
        tlv_ptrs: UniqueAtoms::default(),
        tentative: hashbrown::HashMap::new(),
        stub_helper_preamble: None,
        dyld_private: None,
    };

    create_tentative_atoms(symbol_db, graph, &mut synthetics);

    if opts.backend == Backend::Wasm {
        // Wasm indirection happens through index spaces, not synthetic code.
        return Ok(synthetics);
    }

    collect_indirection_needs(opts, symbol_db, graph, &mut synthetics);

    if opts.backend == Backend::MachO && !synthetics.stubs.is_empty() {
        create_lazy_binding_chain(opts, symbol_db, graph, &mut synthetics)?;
    }

    Ok(synthetics)
}

/// Every surviving tentative global gets zerofill storage.
fn create_tentative_atoms<'data>(
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &mut Synthetics,
) {
    for (index, global) in symbol_db.globals.iter().enumerate() {
        let Definition::Tentative { size, alignment } = global.definition else {
            continue;
        };
        let (atom, _) = graph.add_synthetic_atom(Atom {
            file: None,
            primary: SymbolRef::synthetic(0),
            size,
            alignment,
            data: AtomData::Zerofill,
            relocs: Vec::new(),
            prev: NULL_ATOM,
            next: NULL_ATOM,
            inner: Vec::new(),
            input_range: None,
            output_section: output_section_id::COMMON,
            address: 0,
            alive: true,
        });
        synthetics.tentative.insert(GlobalIndex(index as u32), atom);
    }
}

fn collect_indirection_needs<'data>(
    opts: &Options,
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &mut Synthetics,
) {
    // Decide from the relocations what indirection each target needs, then
    // create the atoms. Two passes because atom creation grows the pool we'd
    // be iterating.
    let mut needs_got = Vec::new();
    let mut needs_stub = Vec::new();
    let mut needs_tlv_ptr = Vec::new();

    for (_, atom) in graph.pool.iter() {
        if atom.file.is_none() {
            continue;
        }
        let bytes = atom.data.bytes();
        for reloc in &atom.relocs {
            let key = target_key(symbol_db, reloc.target);
            let class = classify_target(symbol_db, reloc.target);
            match reloc.kind {
                RelocKind::GotLoad => {
                    // The ELF mov→lea peephole bypasses the GOT entirely for
                    // locally-defined targets; only allocate a slot when the
                    // rewrite won't happen.
                    let bypassed = opts.backend == Backend::Elf
                        && class == TargetClass::Local
                        && bytes.is_some_and(|bytes| {
                            crate::x86_64::gotpcrelx_rewritable(bytes, reloc.offset)
                        });
                    if !bypassed {
                        needs_got.push(key);
                    }
                }
                RelocKind::Got
                | RelocKind::PointerToGot
                | RelocKind::GotPage21
                | RelocKind::GotPageOff12 => needs_got.push(key),
                RelocKind::GotTpOff => {
                    let bypassed = opts.backend == Backend::Elf
                        && opts.target.cpu_arch == CpuArch::X86_64
                        && class == TargetClass::Local
                        && bytes.is_some_and(|bytes| {
                            crate::x86_64::gottpoff_rewritable(bytes, reloc.offset)
                        });
                    if !bypassed {
                        needs_got.push(key);
                    }
                }
                RelocKind::Branch => {
                    if matches!(class, TargetClass::External { .. }) {
                        needs_stub.push(key);
                    }
                }
                RelocKind::TlvLoad | RelocKind::TlvPage21 | RelocKind::TlvPageOff12 => {
                    if matches!(class, TargetClass::External { .. }) {
                        needs_tlv_ptr.push(key);
                    }
                }
                _ => {}
            }
        }
    }

    for key in needs_got {
        add_got_entry(symbol_db, graph, synthetics, key);
    }
    for key in needs_tlv_ptr {
        add_pointer_atom(
            graph,
            &mut synthetics.tlv_ptrs,
            key,
            output_section_id::TLV_PTRS,
            None,
        );
    }
    if opts.backend == Backend::MachO {
        for key in needs_stub {
            add_stub(opts, graph, synthetics, key);
        }
    } else {
        for key in needs_stub {
            add_elf_plt_entry(opts, symbol_db, graph, synthetics, key);
        }
    }
}

/// An 8-byte pointer slot. For locally-defined targets it carries an
/// `Absolute` relocation so the fixup writer fills the address in (and the
/// rebase collector sees a pointer); externally-bound targets leave the slot
/// zero for the binder.
fn add_pointer_atom(
    graph: &mut AtomGraph<'_>,
    unique: &mut UniqueAtoms,
    key: TargetKey,
    section: OutputSectionId,
    reloc_target: Option<SymbolRef>,
) -> AtomIndex {
    if let Some(existing) = unique.get(key) {
        return existing;
    }
    let relocs = reloc_target
        .map(|target| {
            vec![Relocation {
                offset: 0,
                target,
                kind: RelocKind::Absolute,
                addend: 0,
                length: 8,
                pcrel: false,
                subtrahend: None,
            }]
        })
        .unwrap_or_default();
    let (atom, _) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: 8,
        alignment: alignment::POINTER,
        data: AtomData::Owned(vec![0; 8]),
        relocs,
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: section,
        address: 0,
        alive: true,
    });
    unique.insert(key, atom);
    atom
}

fn add_got_entry(
    symbol_db: &SymbolDb,
    graph: &mut AtomGraph<'_>,
    synthetics: &mut Synthetics,
    key: TargetKey,
) {
    if synthetics.got.get(key).is_some() {
        return;
    }
    // Locally-resolved targets get their address written at fixup time;
    // loader-bound ones stay zero and get a bind entry instead.
    let reloc_target = match key {
        TargetKey::Global(global_index) => match symbol_db.global(global_index).definition {
            Definition::Object { file, sym_index } => Some(SymbolRef::object(file, sym_index)),
            Definition::Tentative { .. } => synthetics
                .tentative
                .get(&global_index)
                .map(|&atom| graph.add_synthetic_symbol(atom, 0)),
            _ => None,
        },
        TargetKey::Local(file, sym_index) => Some(SymbolRef::object(file, sym_index)),
        TargetKey::Synthetic(index) => Some(SymbolRef::synthetic(index)),
    };
    add_pointer_atom(
        graph,
        &mut synthetics.got,
        key,
        output_section_id::GOT,
        reloc_target,
    );
}

const STUB_X86_64: &[u8] = &[
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp *lazy_ptr(%rip)
];

const STUB_AARCH64: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(lazy_ptr)
    0x10, 0x02, 0x40, 0xf9, // ldr x16, [x16, pageoff(lazy_ptr)]
    0x00, 0x02, 0x1f, 0xd6, // br x16
];

const STUB_HELPER_X86_64: &[u8] = &[
    0x68, 0x00, 0x00, 0x00, 0x00, // push $lazy_bind_offset
    0xe9, 0x00, 0x00, 0x00, 0x00, // jmp preamble
];

const STUB_HELPER_AARCH64: &[u8] = &[
    0x50, 0x00, 0x00, 0x18, // ldr w16, #8
    0x00, 0x00, 0x00, 0x14, // b preamble
    0x00, 0x00, 0x00, 0x00, // lazy bind offset, patched by the writer
];

const STUB_HELPER_PREAMBLE_X86_64: &[u8] = &[
    0x4c, 0x8d, 0x1d, 0x00, 0x00, 0x00, 0x00, // lea __dyld_private(%rip), %r11
    0x41, 0x53, // push %r11
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp *dyld_stub_binder@got(%rip)
    0x90, // nop
];

const STUB_HELPER_PREAMBLE_AARCH64: &[u8] = &[
    0x11, 0x00, 0x00, 0x90, // adrp x17, page(__dyld_private)
    0x31, 0x02, 0x00, 0x91, // add x17, x17, pageoff(__dyld_private)
    0xf0, 0x47, 0xbf, 0xa9, // stp x16, x17, [sp, #-16]!
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(got(dyld_stub_binder))
    0x10, 0x02, 0x40, 0xf9, // ldr x16, [x16, pageoff(got(dyld_stub_binder))]
    0x00, 0x02, 0x1f, 0xd6, // br x16
];

/// Mach-O lazy binding for one external target: stub → lazy pointer → stub
/// helper → binder preamble.
fn add_stub(opts: &Options, graph: &mut AtomGraph<'_>, synthetics: &mut Synthetics, key: TargetKey) {
    if synthetics.stubs.get(key).is_some() {
        return;
    }

    // Helper entry first; the lazy pointer's initial value points at it.
    let helper_template = match opts.target.cpu_arch {
        CpuArch::X86_64 => STUB_HELPER_X86_64,
        _ => STUB_HELPER_AARCH64,
    };
    let (helper_atom, helper_symbol) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: helper_template.len() as u64,
        alignment: alignment::CODE,
        data: AtomData::Owned(helper_template.to_vec()),
        relocs: Vec::new(),
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: output_section_id::STUB_HELPER,
        address: 0,
        alive: true,
    });
    synthetics.stub_helpers.insert(key, helper_atom);

    let lazy_atom = add_pointer_atom(
        graph,
        &mut synthetics.lazy_ptrs,
        key,
        output_section_id::LAZY_SYMBOL_PTR,
        Some(helper_symbol),
    );
    let lazy_symbol = graph.pool.get(lazy_atom).primary;

    let (stub_template, stub_relocs): (&[u8], Vec<Relocation>) = match opts.target.cpu_arch {
        CpuArch::X86_64 => (
            STUB_X86_64,
            vec![Relocation {
                offset: 2,
                target: lazy_symbol,
                kind: RelocKind::Relative,
                addend: 0,
                length: 4,
                pcrel: true,
                subtrahend: None,
            }],
        ),
        _ => (
            STUB_AARCH64,
            vec![
                Relocation {
                    offset: 0,
                    target: lazy_symbol,
                    kind: RelocKind::Page21,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
                Relocation {
                    offset: 4,
                    target: lazy_symbol,
                    kind: RelocKind::PageOff12,
                    addend: 0,
                    length: 4,
                    pcrel: false,
                    subtrahend: None,
                },
            ],
        ),
    };
    let (stub_atom, _) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: stub_template.len() as u64,
        alignment: alignment::CODE,
        data: AtomData::Owned(stub_template.to_vec()),
        relocs: stub_relocs,
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: output_section_id::STUBS,
        address: 0,
        alive: true,
    });
    synthetics.stubs.insert(key, stub_atom);
}

/// ELF lazy binding is not emitted; calls to shared-library symbols go
/// through an eagerly-bound PLT entry whose GOT slot gets a JUMP_SLOT
/// relocation.
fn add_elf_plt_entry(
    opts: &Options,
    symbol_db: &SymbolDb,
    graph: &mut AtomGraph<'_>,
    synthetics: &mut Synthetics,
    key: TargetKey,
) {
    if synthetics.stubs.get(key).is_some() {
        return;
    }
    add_got_entry(symbol_db, graph, synthetics, key);
    let got_symbol = graph
        .pool
        .get(synthetics.got.get(key).expect("just created"))
        .primary;

    let (template, relocs): (&[u8], Vec<Relocation>) = match opts.target.cpu_arch {
        CpuArch::X86_64 => (
            // endbr64; bnd jmp *got(%rip); pad
            &[
                0xf3, 0x0f, 0x1e, 0xfa, 0xf2, 0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0x0f, 0x1f,
                0x44, 0x00, 0x00,
            ],
            vec![Relocation {
                offset: 7,
                target: got_symbol,
                kind: RelocKind::Relative,
                addend: 0,
                length: 4,
                pcrel: true,
                subtrahend: None,
            }],
        ),
        _ => (
            // adrp x16, page(got); ldr x17, [x16, off]; br x17; nop
            &[
                0x10, 0x00, 0x00, 0x90, 0x11, 0x02, 0x40, 0xf9, 0x20, 0x02, 0x1f, 0xd6, 0x1f,
                0x20, 0x03, 0xd5,
            ],
            vec![
                Relocation {
                    offset: 0,
                    target: got_symbol,
                    kind: RelocKind::Page21,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
                Relocation {
                    offset: 4,
                    target: got_symbol,
                    kind: RelocKind::PageOff12,
                    addend: 0,
                    length: 4,
                    pcrel: false,
                    subtrahend: None,
                },
            ],
        ),
    };
    let (atom, _) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: template.len() as u64,
        alignment: alignment::PLT_ENTRY,
        data: AtomData::Owned(template.to_vec()),
        relocs,
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: output_section_id::STUBS,
        address: 0,
        alive: true,
    });
    synthetics.stubs.insert(key, atom);
}

fn create_lazy_binding_chain<'data>(
    opts: &Options,
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &mut Synthetics,
) -> Result {
    // The binder cache the preamble hands to dyld_stub_binder.
    let (dyld_private, dyld_private_symbol) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: 8,
        alignment: alignment::POINTER,
        data: AtomData::Owned(vec![0; 8]),
        relocs: Vec::new(),
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: output_section_id::DATA,
        address: 0,
        alive: true,
    });
    synthetics.dyld_private = Some(dyld_private);

    let binder_global = symbol_db
        .lookup(&SymbolName::prehashed(DYLD_STUB_BINDER))
        .expect("registered during resolution");
    let binder_key = TargetKey::Global(binder_global);
    add_got_entry(symbol_db, graph, synthetics, binder_key);
    let binder_got_symbol = graph
        .pool
        .get(synthetics.got.get(binder_key).expect("just created"))
        .primary;

    let (template, relocs): (&[u8], Vec<Relocation>) = match opts.target.cpu_arch {
        CpuArch::X86_64 => (
            STUB_HELPER_PREAMBLE_X86_64,
            vec![
                Relocation {
                    offset: 3,
                    target: dyld_private_symbol,
                    kind: RelocKind::Relative,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
                Relocation {
                    offset: 11,
                    target: binder_got_symbol,
                    kind: RelocKind::Relative,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
            ],
        ),
        _ => (
            STUB_HELPER_PREAMBLE_AARCH64,
            vec![
                Relocation {
                    offset: 0,
                    target: dyld_private_symbol,
                    kind: RelocKind::Page21,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
                Relocation {
                    offset: 4,
                    target: dyld_private_symbol,
                    kind: RelocKind::PageOff12,
                    addend: 0,
                    length: 4,
                    pcrel: false,
                    subtrahend: None,
                },
                Relocation {
                    offset: 12,
                    target: binder_got_symbol,
                    kind: RelocKind::Page21,
                    addend: 0,
                    length: 4,
                    pcrel: true,
                    subtrahend: None,
                },
                Relocation {
                    offset: 16,
                    target: binder_got_symbol,
                    kind: RelocKind::PageOff12,
                    addend: 0,
                    length: 4,
                    pcrel: false,
                    subtrahend: None,
                },
            ],
        ),
    };
    let (preamble_atom, preamble_symbol) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: template.len() as u64,
        alignment: alignment::CODE,
        data: AtomData::Owned(template.to_vec()),
        relocs,
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section: output_section_id::STUB_HELPER,
        address: 0,
        alive: true,
    });
    synthetics.stub_helper_preamble = Some(preamble_atom);

    // Helper entries jump to the preamble; the branch targets only exist now.
    let branch_offset = match opts.target.cpu_arch {
        CpuArch::X86_64 => 6,
        _ => 4,
    };
    for &(_, helper_atom) in &synthetics.stub_helpers.order {
        graph.pool.get_mut(helper_atom).relocs.push(Relocation {
            offset: branch_offset,
            target: preamble_symbol,
            kind: RelocKind::Branch,
            addend: 0,
            length: 4,
            pcrel: true,
            subtrahend: None,
        });
    }

    Ok(())
}

/// A range-extension thunk: three instructions reaching any 64-bit address.
/// Inserted by layout when an aarch64 branch overflows ±128 MiB.
pub(crate) const THUNK_SIZE: u64 = 12;

pub(crate) fn make_thunk<'data>(
    graph: &mut AtomGraph<'data>,
    target: SymbolRef,
    output_section: OutputSectionId,
) -> AtomIndex {
    let template = [
        0x10, 0x00, 0x00, 0x90, // adrp x16, page(target)
        0x10, 0x02, 0x00, 0x91, // add x16, x16, pageoff(target)
        0x00, 0x02, 0x1f, 0xd6, // br x16
    ];
    let relocs = vec![
        Relocation {
            offset: 0,
            target,
            kind: RelocKind::Page21,
            addend: 0,
            length: 4,
            pcrel: true,
            subtrahend: None,
        },
        Relocation {
            offset: 4,
            target,
            kind: RelocKind::PageOff12,
            addend: 0,
            length: 4,
            pcrel: false,
            subtrahend: None,
        },
    ];
    let (atom, _) = graph.add_synthetic_atom(Atom {
        file: None,
        primary: SymbolRef::synthetic(0),
        size: THUNK_SIZE,
        alignment: alignment::CODE,
        data: AtomData::Owned(template.to_vec()),
        relocs,
        prev: NULL_ATOM,
        next: NULL_ATOM,
        inner: Vec::new(),
        input_range: None,
        output_section,
        address: 0,
        alive: true,
    });
    atom
}
