//! S5: section and segment layout. Atoms are chained into their output
//! sections, empty sections pruned, sections sorted by the fixed precedence
//! order and grouped into segments, then sizes, virtual addresses and file
//! offsets are computed. aarch64 gets an extra pass that inserts
//! range-extension thunks and re-lays-out until no branch overflows.

use crate::alignment;
use crate::alignment::Alignment;
use crate::args::Backend;
use crate::args::CpuArch;
use crate::args::Options;
use crate::atom::AtomIndex;
use crate::atom::NULL_ATOM;
use crate::atom_builder::AtomGraph;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::object_file::RelocKind;
use crate::object_file::SymFlags;
use crate::output_section_id;
use crate::output_section_id::OutputSectionId;
use crate::output_section_id::OutputSections;
use crate::output_section_id::SegmentRank;
use crate::output_section_id::segment_protection;
use crate::symbol::FileId;
use crate::symbol::SymbolName;
use crate::symbol::SymbolRef;
use crate::symbol_db::Definition;
use crate::symbol_db::SymbolDb;
use crate::synthetic::Synthetics;
use crate::synthetic::TargetKey;
use crate::synthetic::classify_target;
use crate::synthetic::make_thunk;
use crate::synthetic::target_key;
use anyhow::bail;

pub(crate) struct SectionLayout {
    pub(crate) id: OutputSectionId,
    pub(crate) first_atom: AtomIndex,
    pub(crate) last_atom: AtomIndex,
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,
    pub(crate) vmaddr: u64,
    pub(crate) file_offset: u64,
    pub(crate) segment_index: usize,
    pub(crate) is_zerofill: bool,
}

pub(crate) struct SegmentLayout {
    pub(crate) name: &'static str,
    pub(crate) vmaddr: u64,
    pub(crate) vmsize: u64,
    pub(crate) file_offset: u64,
    pub(crate) file_size: u64,
    pub(crate) protection: (u32, u32),
    /// Indexes into `Layout::sections`.
    pub(crate) sections: Vec<usize>,
}

#[derive(Default, Clone, Copy)]
pub(crate) struct TlsLayout {
    pub(crate) start: u64,
    /// End of the TLS block, rounded up to its alignment: x86-64 thread
    /// pointers sit here.
    pub(crate) end_aligned: u64,
}

pub(crate) struct Layout {
    pub(crate) sections: Vec<SectionLayout>,
    pub(crate) segments: Vec<SegmentLayout>,
    pub(crate) base_address: u64,
    /// File space reserved for headers and (Mach-O) load commands before the
    /// first section's content.
    pub(crate) header_size: u64,
    pub(crate) tls: Option<TlsLayout>,
    /// End of all allocated content, where linkedit/section-tables start.
    pub(crate) content_end_file_offset: u64,
    pub(crate) content_end_vmaddr: u64,
}

impl Layout {
    pub(crate) fn section_by_id(&self, id: OutputSectionId) -> Option<&SectionLayout> {
        self.sections.iter().find(|section| section.id == id)
    }

}

#[tracing::instrument(skip_all, name = "Compute layout")]
pub(crate) fn compute_layout<'data>(
    opts: &Options,
    objects: &[ObjectFile<'data>],
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &mut Synthetics,
    output_sections: &OutputSections,
) -> Result<Layout> {
    if opts.dead_strip {
        sweep_dead_atoms(opts, objects, symbol_db, graph, synthetics);
    }

    let mut layout = assign_addresses(opts, graph, output_sections)?;

    if opts.target.cpu_arch == CpuArch::Aarch64 {
        // Thunks change section sizes, which moves everything after them, so
        // iterate until a pass inserts nothing.
        loop {
            let inserted = insert_thunks(symbol_db, graph, synthetics)?;
            if inserted == 0 {
                break;
            }
            layout = assign_addresses(opts, graph, output_sections)?;
        }
    }

    Ok(layout)
}

/// Chains live atoms into their sections and computes every address. Also the
/// re-layout entry point after thunk insertion, which is why chains are
/// rebuilt only on the first call (thunks are already chained in place).
fn assign_addresses<'data>(
    opts: &Options,
    graph: &mut AtomGraph<'data>,
    output_sections: &OutputSections,
) -> Result<Layout> {
    let chains = build_chains(graph, output_sections);

    // Prune and sort by the precedence order.
    let mut section_ids: Vec<OutputSectionId> = output_sections
        .ids()
        .filter(|&id| !chains[id.as_usize()].0.is_null())
        .collect();
    section_ids.sort_by_key(|&id| output_sections.sort_key(id));

    // Size pass: place each atom within its section.
    let mut sections = Vec::with_capacity(section_ids.len());
    for &id in &section_ids {
        let (first, last) = chains[id.as_usize()];
        let mut running = 0u64;
        let mut max_alignment = alignment::MIN;
        let mut cursor = first;
        while !cursor.is_null() {
            let atom = graph.pool.get_mut(cursor);
            running = atom.alignment.align_up(running);
            // Section-relative for now; rebased below.
            atom.address = running;
            running += atom.size;
            max_alignment = max_alignment.max(atom.alignment);
            cursor = atom.next;
        }
        let def = output_sections.def(id);
        sections.push(SectionLayout {
            id,
            first_atom: first,
            last_atom: last,
            size: running,
            alignment: max_alignment,
            vmaddr: 0,
            file_offset: 0,
            segment_index: 0,
            is_zerofill: def.kind.is_zerofill(),
        });
    }

    let mut layout = Layout {
        sections,
        segments: Vec::new(),
        base_address: opts.base_address(),
        header_size: estimated_header_size(opts),
        tls: None,
        content_end_file_offset: 0,
        content_end_vmaddr: 0,
    };

    group_into_segments(opts, output_sections, &mut layout);
    place_segments(opts, &mut layout)?;

    // Rebase atom addresses from section-relative to absolute.
    for section in &layout.sections {
        let mut cursor = section.first_atom;
        while !cursor.is_null() {
            let atom = graph.pool.get_mut(cursor);
            atom.address += section.vmaddr;
            cursor = atom.next;
        }
    }

    compute_tls_layout(&mut layout, output_sections);
    Ok(layout)
}

/// (first, last) atom per output section, in pool order, which preserves
/// input declaration order.
fn build_chains(
    graph: &mut AtomGraph<'_>,
    output_sections: &OutputSections,
) -> Vec<(AtomIndex, AtomIndex)> {
    // Chains may already exist from a previous pass (with thunks spliced
    // in); rebuilding would lose the thunk positions. Detect a prior pass by
    // any non-null link.
    let already_chained = graph
        .pool
        .iter()
        .any(|(_, atom)| !atom.next.is_null() || !atom.prev.is_null());

    let mut chains = vec![(NULL_ATOM, NULL_ATOM); output_sections.len()];
    if already_chained {
        for (index, atom) in graph.pool.iter() {
            if !atom.alive {
                continue;
            }
            let slot = &mut chains[atom.output_section.as_usize()];
            if atom.prev.is_null() && slot.0.is_null() {
                slot.0 = index;
            }
            if atom.next.is_null() {
                slot.1 = index;
            }
        }
        return chains;
    }

    let atom_count = graph.pool.len();
    for raw in 1..atom_count {
        let index = AtomIndex(raw as u32);
        let atom = graph.pool.get(index);
        if !atom.alive {
            continue;
        }
        let section = atom.output_section.as_usize();
        let (first, last) = chains[section];
        let new_last = graph.pool.link_after(last, index);
        chains[section] = if first.is_null() {
            (new_last, new_last)
        } else {
            (first, new_last)
        };
    }
    chains
}

fn group_into_segments(opts: &Options, output_sections: &OutputSections, layout: &mut Layout) {
    match opts.backend {
        Backend::MachO => {
            // Group consecutive sections sharing a segment name.
            let mut current: Option<&'static str> = None;
            for index in 0..layout.sections.len() {
                let def = output_sections.def(layout.sections[index].id);
                if def.segment_rank == SegmentRank::NonAlloc {
                    continue;
                }
                if current != Some(def.segment_name) {
                    current = Some(def.segment_name);
                    layout.segments.push(SegmentLayout {
                        name: def.segment_name,
                        vmaddr: 0,
                        vmsize: 0,
                        file_offset: 0,
                        file_size: 0,
                        protection: segment_protection(def.segment_name),
                        sections: Vec::new(),
                    });
                }
                let segment_index = layout.segments.len() - 1;
                layout.sections[index].segment_index = segment_index;
                layout.segments.last_mut().unwrap().sections.push(index);
            }
        }
        Backend::Elf => {
            // Two loadable segments: text (R+X) and data (R+W).
            for (rank, name, protection) in [
                (
                    SegmentRank::Text,
                    "text",
                    (
                        output_section_id::VM_PROT_READ | output_section_id::VM_PROT_EXECUTE,
                        0,
                    ),
                ),
                (
                    SegmentRank::Data,
                    "data",
                    (
                        output_section_id::VM_PROT_READ | output_section_id::VM_PROT_WRITE,
                        0,
                    ),
                ),
            ] {
                let members: Vec<usize> = layout
                    .sections
                    .iter()
                    .enumerate()
                    .filter(|(_, section)| {
                        let actual = output_sections.def(section.id).segment_rank;
                        match rank {
                            SegmentRank::Text => actual == SegmentRank::Text,
                            _ => matches!(actual, SegmentRank::DataConst | SegmentRank::Data),
                        }
                    })
                    .map(|(index, _)| index)
                    .collect();
                if members.is_empty() {
                    continue;
                }
                let segment_index = layout.segments.len();
                for &member in &members {
                    layout.sections[member].segment_index = segment_index;
                }
                layout.segments.push(SegmentLayout {
                    name,
                    vmaddr: 0,
                    vmsize: 0,
                    file_offset: 0,
                    file_size: 0,
                    protection,
                    sections: members,
                });
            }
        }
        Backend::Wasm | Backend::Coff => {}
    }
}

/// Walks segments in order, placing sections at ascending, non-overlapping
/// addresses. File offsets stay congruent with virtual addresses modulo the
/// page size; zerofill sections take address space but no file space.
fn place_segments(opts: &Options, layout: &mut Layout) -> Result {
    let page = match (opts.backend, opts.target.cpu_arch) {
        (Backend::MachO, CpuArch::Aarch64) => alignment::PAGE_16K,
        _ => alignment::PAGE,
    };

    if opts.backend == Backend::Wasm {
        // No segments: data sections get memory addresses from a fixed data
        // base; the code "address space" is just section-relative ordering.
        let mut memory_addr = 1024u64;
        for section in &mut layout.sections {
            section.vmaddr = section.alignment.align_up(memory_addr);
            memory_addr = section.vmaddr + section.size;
        }
        layout.content_end_vmaddr = memory_addr;
        return Ok(());
    }

    let mut vmaddr = layout.base_address;
    let mut file_offset = 0u64;

    for segment_index in 0..layout.segments.len() {
        let is_first = segment_index == 0;
        vmaddr = page.align_up(vmaddr);
        file_offset = page.align_up(file_offset);
        let seg_vmaddr = vmaddr;
        let seg_file_offset = file_offset;

        // Headers and load commands live at the front of the first segment.
        if is_first {
            vmaddr += layout.header_size;
            file_offset += layout.header_size;
        }

        let mut seg_file_end = file_offset;
        let section_indexes = layout.segments[segment_index].sections.clone();
        let mut seen_zerofill = false;
        for &section_index in &section_indexes {
            let section = &mut layout.sections[section_index];
            if section.is_zerofill {
                seen_zerofill = true;
                section.vmaddr = section.alignment.align_up(vmaddr);
                section.file_offset = 0;
                vmaddr = section.vmaddr + section.size;
            } else {
                if seen_zerofill {
                    bail!("Content section follows zerofill within a segment");
                }
                section.vmaddr = section.alignment.align_up(vmaddr);
                // Keep file offset congruent with the address.
                file_offset += section.vmaddr - vmaddr;
                section.file_offset = file_offset;
                vmaddr = section.vmaddr + section.size;
                file_offset += section.size;
                seg_file_end = file_offset;
            }
        }

        let segment = &mut layout.segments[segment_index];
        segment.vmaddr = seg_vmaddr;
        segment.vmsize = page.align_up(vmaddr - seg_vmaddr);
        segment.file_offset = seg_file_offset;
        segment.file_size = seg_file_end - seg_file_offset;
        vmaddr = seg_vmaddr + segment.vmsize;
        file_offset = seg_file_offset + page.align_up(segment.file_size);
    }

    layout.content_end_file_offset = file_offset;
    layout.content_end_vmaddr = vmaddr;
    Ok(())
}

fn compute_tls_layout(layout: &mut Layout, output_sections: &OutputSections) {
    let mut start = u64::MAX;
    let mut end = 0u64;
    let mut max_alignment = alignment::MIN;
    for section in &layout.sections {
        let kind = output_sections.def(section.id).kind;
        if matches!(
            kind,
            crate::object_file::SectionKind::TlsData | crate::object_file::SectionKind::TlsBss
        ) {
            start = start.min(section.vmaddr);
            end = end.max(section.vmaddr + section.size);
            max_alignment = max_alignment.max(section.alignment);
        }
    }
    if start != u64::MAX {
        layout.tls = Some(TlsLayout {
            start,
            end_aligned: max_alignment.align_up(end),
        });
    }
}

/// Space reserved for the file header (and Mach-O load commands) ahead of the
/// first section. Generous on purpose; the writer verifies its commands fit.
fn estimated_header_size(opts: &Options) -> u64 {
    match opts.backend {
        Backend::MachO => {
            let base = 0x1000u64 + opts.headerpad_size.unwrap_or(0x100);
            base.next_multiple_of(0x400)
        }
        Backend::Elf => {
            // ELF header plus a fixed program-header allowance: two loads,
            // TLS, GNU_STACK and one spare.
            64 + 5 * 56
        }
        Backend::Wasm | Backend::Coff => 0,
    }
}

/// The simple reachability sweep. Roots are the entry point, anything marked
/// no-dead-strip, initializer/finalizer pointers, and (for libraries) every
/// exported symbol. Everything else must be reached through a relocation.
fn sweep_dead_atoms<'data>(
    opts: &Options,
    objects: &[ObjectFile<'data>],
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &Synthetics,
) {
    let atom_of = |symbol: SymbolRef| -> Option<AtomIndex> {
        atom_for_symbol(symbol_db, graph, synthetics, symbol).map(|(atom, _)| atom)
    };

    let mut worklist: Vec<AtomIndex> = Vec::new();

    if opts.is_exe() {
        if let Some(index) = symbol_db.lookup(&SymbolName::prehashed(
            opts.entry_symbol_name().as_bytes(),
        )) {
            if let Definition::Object { file, sym_index } = symbol_db.global(index).definition {
                if let Some(atom) = atom_of(SymbolRef::object(file, sym_index)) {
                    worklist.push(atom);
                }
            }
        }
    }

    for (index, atom) in graph.pool.iter() {
        let section_kind = atom.output_section;
        if section_kind == output_section_id::INIT_POINTERS
            || section_kind == output_section_id::FINI_POINTERS
            || section_kind == output_section_id::TLV_VARS
        {
            worklist.push(index);
        }
        // Synthetic atoms stay pinned; they were created for a reason.
        if atom.file.is_none() {
            worklist.push(index);
        }
    }

    for (file_index, object) in objects.iter().enumerate() {
        for (sym_index, sym) in object.symbols.iter().enumerate() {
            let no_strip = sym.flags.contains(SymFlags::NO_DEAD_STRIP);
            let exported = !opts.is_exe()
                && sym.is_external()
                && !sym.is_undefined()
                && !sym.flags.contains(SymFlags::PRIVATE_EXTERN);
            if no_strip || exported {
                if let Some(atom) = atom_of(SymbolRef::object(
                    FileId(file_index as u32),
                    sym_index as u32,
                )) {
                    worklist.push(atom);
                }
            }
        }
    }

    let atom_count = graph.pool.len();
    let mut alive = vec![false; atom_count];
    alive[0] = true;
    while let Some(index) = worklist.pop() {
        if std::mem::replace(&mut alive[index.as_usize()], true) {
            continue;
        }
        for reloc_index in 0..graph.pool.get(index).relocs.len() {
            let reloc = graph.pool.get(index).relocs[reloc_index];
            if let Some(target) = atom_of(reloc.target) {
                worklist.push(target);
            }
            if let Some(sub) = reloc.subtrahend.and_then(atom_of) {
                worklist.push(sub);
            }
        }
    }

    for raw in 1..atom_count {
        graph.pool.get_mut(AtomIndex(raw as u32)).alive = alive[raw];
    }
}

/// Maps a symbol reference to its defining atom and offset, following the
/// global table for external references.
pub(crate) fn atom_for_symbol(
    symbol_db: &SymbolDb,
    graph: &AtomGraph,
    synthetics: &Synthetics,
    symbol: SymbolRef,
) -> Option<(AtomIndex, u64)> {
    match symbol.file() {
        None => {
            let synth = graph.synthetic_symbols.get(symbol.index() as usize)?;
            Some((synth.atom, synth.offset))
        }
        Some(file) => match symbol_db.global_for(file, symbol.index()) {
            Some(global_index) => match symbol_db.global(global_index).definition {
                Definition::Object { file, sym_index } => graph
                    .file_sym_atoms
                    .get(file.as_usize())?
                    .get(sym_index as usize)
                    .copied()
                    .flatten(),
                Definition::Tentative { .. } => synthetics
                    .tentative
                    .get(&global_index)
                    .map(|&atom| (atom, 0)),
                _ => None,
            },
            None => graph
                .file_sym_atoms
                .get(file.as_usize())?
                .get(symbol.index() as usize)
                .copied()
                .flatten(),
        },
    }
}

/// Inserts thunks for branches whose displacement exceeds the aarch64 range.
/// Returns how many were inserted.
fn insert_thunks<'data>(
    symbol_db: &SymbolDb<'data>,
    graph: &mut AtomGraph<'data>,
    synthetics: &Synthetics,
) -> Result<usize> {
    const MARGIN: i64 = 0x80_0000; // Re-layout shifts addresses; leave slack.
    let max_range = crate::aarch64::MAX_BRANCH_RANGE - MARGIN;

    let mut inserted = 0;
    // (section, target) → thunk, reused while still in range.
    let mut existing: hashbrown::HashMap<(OutputSectionId, TargetKey), AtomIndex> =
        hashbrown::HashMap::new();

    let atom_count = graph.pool.len();
    for raw in 1..atom_count {
        let atom_index = AtomIndex(raw as u32);
        let atom = graph.pool.get(atom_index);
        if !atom.alive || atom.file.is_none() {
            continue;
        }
        let section = atom.output_section;
        let atom_addr = atom.address;

        for reloc_index in 0..graph.pool.get(atom_index).relocs.len() {
            let reloc = graph.pool.get(atom_index).relocs[reloc_index];
            if reloc.kind != RelocKind::Branch {
                continue;
            }
            // External branches already go through a stub next to the code.
            if matches!(
                classify_target(symbol_db, reloc.target),
                crate::synthetic::TargetClass::External { .. }
            ) {
                continue;
            }
            let Some((target_atom, target_offset)) =
                atom_for_symbol(symbol_db, graph, synthetics, reloc.target)
            else {
                continue;
            };
            let target_addr = graph.pool.get(target_atom).address + target_offset;
            let source_addr = atom_addr + reloc.offset;
            let displacement = target_addr.wrapping_sub(source_addr) as i64;
            if displacement.abs() <= max_range {
                continue;
            }

            let key = (section, target_key(symbol_db, reloc.target));
            let thunk = match existing.get(&key) {
                Some(&thunk)
                    if (graph.pool.get(thunk).address.wrapping_sub(source_addr) as i64)
                        .abs()
                        <= max_range =>
                {
                    thunk
                }
                _ => {
                    let thunk = make_thunk(graph, reloc.target, section);
                    graph.pool.insert_after(atom_index, thunk);
                    existing.insert(key, thunk);
                    inserted += 1;
                    thunk
                }
            };
            let thunk_symbol = graph.pool.get(thunk).primary;
            graph.pool.get_mut(atom_index).relocs[reloc_index].target = thunk_symbol;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::atom::AtomData;
    use crate::atom::Relocation;

    fn synthetic_code_atom<'data>(
        graph: &mut AtomGraph<'data>,
        size: u64,
        align: u64,
        section: OutputSectionId,
    ) -> AtomIndex {
        let (index, _) = graph.add_synthetic_atom(Atom {
            file: None,
            primary: SymbolRef::synthetic(0),
            size,
            alignment: Alignment::new(align).unwrap(),
            data: AtomData::Owned(vec![0; size as usize]),
            relocs: Vec::new(),
            prev: NULL_ATOM,
            next: NULL_ATOM,
            inner: Vec::new(),
            input_range: None,
            output_section: section,
            address: 0,
            alive: true,
        });
        index
    }

    fn empty_synthetics() -> Synthetics {
        Synthetics {
            got: Default::default(),
            stubs: Default::default(),
            lazy_ptrs: Default::default(),
            stub_helpers: Default::default(),
            tlv_ptrs: Default::default(),
            tentative: hashbrown::HashMap::new(),
            stub_helper_preamble: None,
            dyld_private: None,
        }
    }

    #[test]
    fn test_size_pass_respects_alignment() {
        let opts = crate::args::Options::new(
            Backend::MachO,
            crate::args::default_target(Backend::MachO),
        );
        let mut sections = OutputSections::new(Backend::MachO);
        let mut graph = AtomGraph::new();
        let a = synthetic_code_atom(&mut graph, 10, 4, output_section_id::TEXT);
        let b = synthetic_code_atom(&mut graph, 8, 16, output_section_id::TEXT);
        let mut synthetics = empty_synthetics();

        let symbol_db = SymbolDb::new();
        let layout = compute_layout(
            &opts,
            &[],
            &symbol_db,
            &mut graph,
            &mut synthetics,
            &mut sections,
        )
        .unwrap();

        let text = layout.section_by_id(output_section_id::TEXT).unwrap();
        // 10 bytes, padded to 16 for the second atom's alignment, plus 8.
        assert_eq!(text.size, 24);
        assert_eq!(text.alignment.value(), 16);
        let addr_a = graph.pool.get(a).address;
        let addr_b = graph.pool.get(b).address;
        assert_eq!(addr_b - addr_a, 16);
        assert_eq!(addr_b % 16, 0);
    }

    #[test]
    fn test_sections_sorted_and_segments_monotone() {
        let opts = crate::args::Options::new(
            Backend::MachO,
            crate::args::default_target(Backend::MachO),
        );
        let mut sections = OutputSections::new(Backend::MachO);
        let mut graph = AtomGraph::new();
        // Deliberately create in reverse precedence order.
        synthetic_code_atom(&mut graph, 8, 8, output_section_id::DATA);
        synthetic_code_atom(&mut graph, 8, 8, output_section_id::GOT);
        synthetic_code_atom(&mut graph, 8, 8, output_section_id::TEXT);
        let mut synthetics = empty_synthetics();

        let symbol_db = SymbolDb::new();
        let layout = compute_layout(
            &opts,
            &[],
            &symbol_db,
            &mut graph,
            &mut synthetics,
            &mut sections,
        )
        .unwrap();

        let ids: Vec<OutputSectionId> = layout.sections.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                output_section_id::TEXT,
                output_section_id::GOT,
                output_section_id::DATA
            ]
        );
        // __TEXT < __DATA_CONST < __DATA, non-overlapping and ascending.
        assert_eq!(layout.segments.len(), 3);
        for pair in layout.segments.windows(2) {
            assert!(pair[0].vmaddr + pair[0].vmsize <= pair[1].vmaddr);
            assert!(pair[0].file_offset + pair[0].file_size <= pair[1].file_offset);
        }
        // Executables start above the page-zero reservation.
        assert_eq!(layout.segments[0].vmaddr, 0x1_0000_0000);
    }

    #[test]
    fn test_far_branch_gets_thunk() {
        let mut opts = crate::args::Options::new(
            Backend::MachO,
            crate::args::default_target(Backend::MachO),
        );
        opts.target.cpu_arch = CpuArch::Aarch64;
        let mut sections = OutputSections::new(Backend::MachO);
        let mut graph = AtomGraph::new();

        let near = synthetic_code_atom(&mut graph, 4, 4, output_section_id::TEXT);
        // A huge atom pushes the callee out of direct branch range.
        synthetic_code_atom(&mut graph, 200 * 1024 * 1024, 4, output_section_id::TEXT);
        let far = synthetic_code_atom(&mut graph, 4, 4, output_section_id::TEXT);
        let far_symbol = graph.pool.get(far).primary;
        graph.pool.get_mut(near).relocs.push(Relocation {
            offset: 0,
            target: far_symbol,
            kind: RelocKind::Branch,
            addend: 0,
            length: 4,
            pcrel: true,
            subtrahend: None,
        });
        // Give the pool a fake file atom marker so the thunk pass looks at it.
        graph.pool.get_mut(near).file = Some(FileId(0));

        let mut synthetics = empty_synthetics();
        let symbol_db = SymbolDb::new();
        let atoms_before = graph.pool.len();
        compute_layout(
            &opts,
            &[],
            &symbol_db,
            &mut graph,
            &mut synthetics,
            &mut sections,
        )
        .unwrap();

        // A thunk atom was inserted right after the branching atom.
        assert_eq!(graph.pool.len(), atoms_before + 1);
        let thunk = graph.pool.get(near).next;
        assert_eq!(graph.pool.get(thunk).size, crate::synthetic::THUNK_SIZE);
        // The branch now targets the thunk, which is in range.
        let reloc = graph.pool.get(near).relocs[0];
        let (thunk_atom, _) =
            atom_for_symbol(&symbol_db, &graph, &synthetics, reloc.target).unwrap();
        assert_eq!(thunk_atom, thunk);
        let displacement = graph.pool.get(thunk_atom).address as i64
            - graph.pool.get(near).address as i64;
        assert!(displacement.abs() < crate::aarch64::MAX_BRANCH_RANGE);
    }
}
