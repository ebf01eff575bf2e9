//! S3: slicing input sections into atoms. A subdividable section gets one
//! atom per externally-addressable symbol, running to the next symbol's
//! offset; anything else becomes a single atom carrying its symbols as inner
//! offsets. Relocation targets are re-pointed from input symbol/section
//! indexes to `SymbolRef`s while offsets are rebased to the owning atom.

use crate::alignment::Alignment;
use crate::atom::Atom;
use crate::atom::AtomData;
use crate::atom::AtomIndex;
use crate::atom::AtomPool;
use crate::atom::InnerSymbol;
use crate::atom::NULL_ATOM;
use crate::atom::Relocation;
use crate::error::Result;
use crate::object_file::InputSection;
use crate::object_file::ObjectFile;
use crate::object_file::RelocTarget;
use crate::object_file::SectionData;
use crate::object_file::SectionKind;
use crate::object_file::SymFlags;
use crate::output_section_id::OutputSections;
use crate::symbol::FileId;
use crate::symbol::SymbolRef;
use anyhow::bail;
use smallvec::SmallVec;

/// Linker-synthesized local symbols. `SymbolRef::synthetic(i)` addresses
/// entry `i`; the symbol's value is its atom's address plus `offset`.
pub(crate) struct SyntheticSymbol {
    pub(crate) atom: AtomIndex,
    pub(crate) offset: u64,
}

pub(crate) struct AtomGraph<'data> {
    pub(crate) pool: AtomPool<'data>,
    pub(crate) synthetic_symbols: Vec<SyntheticSymbol>,

    /// Per file, per symbol index: the atom holding the symbol's definition
    /// and the symbol's offset within it.
    pub(crate) file_sym_atoms: Vec<Vec<Option<(AtomIndex, u64)>>>,
}

impl<'data> AtomGraph<'data> {
    pub(crate) fn new() -> AtomGraph<'data> {
        AtomGraph {
            pool: AtomPool::new(),
            synthetic_symbols: Vec::new(),
            file_sym_atoms: Vec::new(),
        }
    }

    pub(crate) fn add_synthetic_symbol(&mut self, atom: AtomIndex, offset: u64) -> SymbolRef {
        let index = self.synthetic_symbols.len() as u32;
        self.synthetic_symbols.push(SyntheticSymbol { atom, offset });
        SymbolRef::synthetic(index)
    }

    /// Adds a linker-generated atom and gives it a synthetic primary symbol.
    /// Generated atoms always carry local primaries.
    pub(crate) fn add_synthetic_atom(&mut self, mut atom: Atom<'data>) -> (AtomIndex, SymbolRef) {
        atom.file = None;
        let index = self.pool.add(atom);
        let symbol = self.add_synthetic_symbol(index, 0);
        debug_assert!(symbol.is_synthetic());
        self.pool.get_mut(index).primary = symbol;
        (index, symbol)
    }
}

#[tracing::instrument(skip_all, name = "Build atoms")]
pub(crate) fn build_atoms<'data>(
    objects: &[ObjectFile<'data>],
    output_sections: &mut OutputSections,
) -> Result<AtomGraph<'data>> {
    let mut graph = AtomGraph::new();
    let mut claimed_comdats: hashbrown::HashSet<&'data [u8]> = hashbrown::HashSet::new();

    debug_assert!(
        objects
            .windows(2)
            .all(|pair| pair[0].cpu_arch == pair[1].cpu_arch)
    );

    for (file_index, object) in objects.iter().enumerate() {
        let file = FileId(file_index as u32);
        let mut sym_atoms: Vec<Option<(AtomIndex, u64)>> = vec![None; object.symbols.len()];
        // Per input section: sorted (start offset, atom) pairs, for resolving
        // section-relative relocations.
        let mut section_atoms: Vec<SmallVec<[(u64, AtomIndex); 4]>> =
            vec![SmallVec::new(); object.sections.len()];

        for (section_index, section) in object.sections.iter().enumerate() {
            if !should_keep(section) {
                continue;
            }
            if let Some(signature) = section.comdat_signature {
                if !claimed_comdats.insert(signature) {
                    continue;
                }
            }
            let output_section = output_sections.section_for_input(section);

            let mut boundaries = symbol_boundaries(object, section_index);
            if !object.subsections_via_symbols {
                boundaries.clear();
            }

            build_section_atoms(
                &mut graph,
                file,
                object,
                section_index,
                output_section,
                &boundaries,
                &mut sym_atoms,
                &mut section_atoms[section_index],
            )?;
        }

        distribute_relocations(&mut graph, file, object, &section_atoms)?;
        graph.file_sym_atoms.push(sym_atoms);
    }

    Ok(graph)
}

fn should_keep(section: &InputSection) -> bool {
    !matches!(
        section.kind,
        SectionKind::Debug | SectionKind::Note
    )
}

/// Offsets at which a new atom starts, ascending and deduplicated. The
/// symbol index chosen as primary for each boundary rides along.
fn symbol_boundaries(object: &ObjectFile, section_index: usize) -> Vec<(u64, u32)> {
    let mut boundaries: Vec<(u64, u32)> = object
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, sym)| {
            sym.section == Some(section_index)
                && !sym.flags.contains(SymFlags::STAB)
                && !sym.name.is_empty()
        })
        .map(|(index, sym)| (sym.value, index as u32))
        .collect();
    boundaries.sort_by_key(|&(offset, index)| (offset, index));
    // At equal offsets, the first listed symbol is primary; the rest become
    // inner symbols of the same atom.
    boundaries.dedup_by_key(|&mut (offset, _)| offset);
    boundaries
}

#[allow(clippy::too_many_arguments)]
fn build_section_atoms<'data>(
    graph: &mut AtomGraph<'data>,
    file: FileId,
    object: &ObjectFile<'data>,
    section_index: usize,
    output_section: crate::output_section_id::OutputSectionId,
    boundaries: &[(u64, u32)],
    sym_atoms: &mut [Option<(AtomIndex, u64)>],
    section_atom_list: &mut SmallVec<[(u64, AtomIndex); 4]>,
) -> Result {
    let section = &object.sections[section_index];
    let section_size = section.data.len();

    // Atom extents: a headless region before the first symbol, then one atom
    // per boundary.
    let mut extents: SmallVec<[(u64, u64, Option<u32>); 4]> = SmallVec::new();
    match boundaries.first() {
        Some(&(first, _)) if first > 0 => extents.push((0, first, None)),
        None => extents.push((0, section_size, None)),
        _ => {}
    }
    for (i, &(start, sym_index)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(i + 1)
            .map_or(section_size, |&(next, _)| next);
        extents.push((start, end, Some(sym_index)));
    }

    for &(start, end, primary_sym) in &extents {
        if end < start {
            bail!(
                "`{object}`: symbol at offset {start:#x} lies beyond section `{}` (size {section_size:#x})",
                section.name,
            );
        }
        let data = match &section.data {
            SectionData::Bytes(bytes) => AtomData::Slice(&bytes[start as usize..end as usize]),
            SectionData::Zerofill(_) => AtomData::Zerofill,
        };
        let atom_index = graph.pool.add(Atom {
            file: Some(file),
            primary: SymbolRef::synthetic(u32::MAX), // patched below
            size: end - start,
            alignment: alignment_at_offset(section.alignment, start),
            data,
            relocs: Vec::new(),
            prev: NULL_ATOM,
            next: NULL_ATOM,
            inner: Vec::new(),
            input_range: Some((section_index as u32, start)),
            output_section,
            address: 0,
            alive: true,
        });
        let primary = match primary_sym {
            Some(sym_index) => SymbolRef::object(file, sym_index),
            None => graph.add_synthetic_symbol(atom_index, 0),
        };
        graph.pool.get_mut(atom_index).primary = primary;
        section_atom_list.push((start, atom_index));

        // Attach every symbol landing in this extent.
        for (sym_index, sym) in object.symbols.iter().enumerate() {
            if sym.section != Some(section_index) || sym.flags.contains(SymFlags::STAB) {
                continue;
            }
            if sym.value >= start && (sym.value < end || (sym.value == end && start == end)) {
                let offset = sym.value - start;
                sym_atoms[sym_index] = Some((atom_index, offset));
                if Some(sym_index as u32) != primary_sym {
                    graph.pool.get_mut(atom_index).inner.push(InnerSymbol {
                        sym_index: sym_index as u32,
                        offset,
                    });
                }
            }
        }
    }

    Ok(())
}

/// Atoms that start mid-section can't claim the whole section's alignment,
/// only what their offset guarantees.
fn alignment_at_offset(section_alignment: Alignment, offset: u64) -> Alignment {
    if offset == 0 {
        return section_alignment;
    }
    Alignment {
        exponent: section_alignment
            .exponent
            .min(offset.trailing_zeros() as u8),
    }
}

fn distribute_relocations<'data>(
    graph: &mut AtomGraph<'data>,
    file: FileId,
    object: &ObjectFile<'data>,
    section_atoms: &[SmallVec<[(u64, AtomIndex); 4]>],
) -> Result {
    for (section_index, section) in object.sections.iter().enumerate() {
        let atoms = &section_atoms[section_index];
        if atoms.is_empty() {
            continue;
        }
        for reloc in &section.relocs {
            let Some(&(atom_start, atom_index)) = atoms
                .iter()
                .take_while(|&&(start, _)| start <= reloc.offset)
                .last()
            else {
                bail!(
                    "`{object}`: relocation at {:#x} precedes first atom of `{}`",
                    reloc.offset,
                    section.name,
                );
            };

            let (target, addend) = match reloc.target {
                RelocTarget::Symbol(sym_index) => {
                    (SymbolRef::object(file, sym_index), reloc.addend)
                }
                RelocTarget::Section(target_section) => resolve_section_target(
                    graph,
                    object,
                    &section_atoms[target_section as usize],
                    target_section,
                    reloc.addend,
                )?,
            };
            let subtrahend = reloc.subtrahend.map(|index| SymbolRef::object(file, index));

            graph.pool.get_mut(atom_index).relocs.push(Relocation {
                offset: reloc.offset - atom_start,
                target,
                kind: reloc.kind,
                addend,
                length: reloc.length,
                pcrel: reloc.pcrel,
                subtrahend,
            });
        }
    }
    Ok(())
}

/// A section-relative reference becomes a reference to the atom covering the
/// addressed offset, with the addend rebased to that atom.
fn resolve_section_target<'data>(
    graph: &AtomGraph<'data>,
    object: &ObjectFile<'data>,
    atoms: &SmallVec<[(u64, AtomIndex); 4]>,
    target_section: u32,
    addend: i64,
) -> Result<(SymbolRef, i64)> {
    let offset = addend.max(0) as u64;
    let Some(&(atom_start, atom_index)) = atoms
        .iter()
        .take_while(|&&(start, _)| start <= offset)
        .last()
    else {
        bail!(
            "`{object}`: section-relative relocation against empty section {target_section}",
        );
    };
    Ok((
        graph.pool.get(atom_index).primary,
        addend - atom_start as i64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use crate::args::Backend;
    use crate::args::CpuArch;
    use crate::object_file::Binding;
    use crate::object_file::InputReloc;
    use crate::object_file::InputSymbol;
    use crate::object_file::RelocKind;
    use crate::object_file::SectionName;

    fn test_object<'d>(
        sections: Vec<InputSection<'d>>,
        symbols: Vec<InputSymbol<'d>>,
        subsections: bool,
    ) -> ObjectFile<'d> {
        ObjectFile {
            name: "test.o".to_owned(),
            cpu_arch: CpuArch::X86_64,
            sections,
            symbols,
            subsections_via_symbols: subsections,
            wasm: None,
            data_in_code: Vec::new(),
        }
    }

    fn code_section<'d>(bytes: &'d [u8], relocs: Vec<InputReloc>) -> InputSection<'d> {
        InputSection {
            name: SectionName::elf(b".text"),
            kind: SectionKind::Code,
            alignment: alignment::Alignment::new(16).unwrap(),
            data: SectionData::Bytes(bytes),
            relocs,
            comdat_signature: None,
        }
    }

    fn defined(name: &[u8], section: usize, value: u64) -> InputSymbol<'_> {
        InputSymbol {
            name,
            value,
            size: 0,
            section: Some(section),
            binding: Binding::Global,
            flags: SymFlags::empty(),
            common_alignment: None,
        }
    }

    #[test]
    fn test_subsection_splitting() {
        let bytes = [0u8; 32];
        let objects = vec![test_object(
            vec![code_section(&bytes, Vec::new())],
            vec![defined(b"_a", 0, 0), defined(b"_b", 0, 16)],
            true,
        )];
        let mut sections = OutputSections::new(Backend::MachO);
        let graph = build_atoms(&objects, &mut sections).unwrap();

        // Null atom + two split atoms.
        assert_eq!(graph.pool.len(), 3);
        let (_, a) = graph.pool.iter().next().unwrap();
        assert_eq!(a.size, 16);
        assert_eq!(a.alignment.value(), 16);
        let (_, b) = graph.pool.iter().nth(1).unwrap();
        assert_eq!(b.size, 16);
        // Mid-section atom alignment is limited by its offset.
        assert_eq!(b.alignment.value(), 16);
        assert_eq!(graph.file_sym_atoms[0][1], Some((AtomIndex(2), 0)));
    }

    #[test]
    fn test_unsplit_section_keeps_inner_symbols() {
        let bytes = [0u8; 32];
        let objects = vec![test_object(
            vec![code_section(&bytes, Vec::new())],
            vec![defined(b"_a", 0, 0), defined(b"_b", 0, 16)],
            false,
        )];
        let mut sections = OutputSections::new(Backend::MachO);
        let graph = build_atoms(&objects, &mut sections).unwrap();

        assert_eq!(graph.pool.len(), 2);
        let (index, atom) = graph.pool.iter().next().unwrap();
        assert_eq!(atom.size, 32);
        // One of the two symbols is primary, the other inner.
        assert_eq!(atom.inner.len(), 1);
        assert_eq!(graph.file_sym_atoms[0][0], Some((index, 0)));
        assert_eq!(graph.file_sym_atoms[0][1], Some((index, 16)));
    }

    #[test]
    fn test_headless_prefix_gets_synthetic_primary() {
        let bytes = [0u8; 24];
        let objects = vec![test_object(
            vec![code_section(&bytes, Vec::new())],
            vec![defined(b"_late", 0, 8)],
            true,
        )];
        let mut sections = OutputSections::new(Backend::MachO);
        let graph = build_atoms(&objects, &mut sections).unwrap();

        let (_, head) = graph.pool.iter().next().unwrap();
        assert_eq!(head.size, 8);
        assert!(head.primary.is_synthetic());
        assert_eq!(graph.synthetic_symbols.len(), 1);
    }

    #[test]
    fn test_reloc_rebased_to_atom() {
        let bytes = [0u8; 32];
        let reloc = InputReloc {
            offset: 20,
            target: RelocTarget::Symbol(0),
            kind: RelocKind::Branch,
            addend: 0,
            length: 4,
            pcrel: true,
            subtrahend: None,
        };
        let objects = vec![test_object(
            vec![code_section(&bytes, vec![reloc])],
            vec![defined(b"_a", 0, 0), defined(b"_b", 0, 16)],
            true,
        )];
        let mut sections = OutputSections::new(Backend::MachO);
        let graph = build_atoms(&objects, &mut sections).unwrap();

        let (_, second) = graph.pool.iter().nth(1).unwrap();
        assert_eq!(second.relocs.len(), 1);
        assert_eq!(second.relocs[0].offset, 4);
        assert_eq!(second.relocs[0].target, SymbolRef::object(FileId(0), 0));
    }

    #[test]
    fn test_comdat_dedup() {
        let bytes = [0u8; 8];
        let make = || {
            let mut section = code_section(&bytes, Vec::new());
            section.comdat_signature = Some(b"_inline_fn");
            test_object(vec![section], vec![defined(b"_inline_fn", 0, 0)], true)
        };
        let objects = vec![make(), make()];
        let mut sections = OutputSections::new(Backend::Elf);
        let graph = build_atoms(&objects, &mut sections).unwrap();
        // Only the first copy survives.
        assert_eq!(graph.pool.len(), 2);
        assert_eq!(graph.file_sym_atoms[1][0], None);
    }
}
