//! Post-layout invariant checks, run in debug builds before anything is
//! written. Failures here are linker bugs, not input problems, so the
//! messages name internal structures.

use crate::atom::AtomIndex;
use crate::error::Result;
use crate::layout::Layout;
use crate::output_section_id::OutputSections;
use crate::reloc_writer::LinkContext;
use anyhow::bail;

pub(crate) fn validate(ctx: &LinkContext, output_sections: &OutputSections) -> Result {
    check_chains(ctx)?;
    check_monotonic(ctx.layout)?;
    check_relocation_closure(ctx)?;
    let _ = output_sections;
    Ok(())
}

/// Walking each section's chain must visit every live atom of that section
/// exactly once, in ascending address order, with only alignment padding
/// between atoms.
fn check_chains(ctx: &LinkContext) -> Result {
    let mut visited = vec![false; ctx.graph.pool.len()];

    for section in &ctx.layout.sections {
        let mut previous_end = section.vmaddr;
        let mut total = 0u64;
        let mut last_seen = AtomIndex(0);
        for cursor in ctx.graph.pool.chain(section.first_atom) {
            let atom = ctx.graph.pool.get(cursor);
            if std::mem::replace(&mut visited[cursor.as_usize()], true) {
                bail!("Atom {} appears in more than one chain position", cursor.0);
            }
            if atom.output_section != section.id {
                bail!(
                    "Atom {} chained into {} but assigned to {}",
                    cursor.0,
                    section.id,
                    atom.output_section
                );
            }
            if atom.address < previous_end {
                bail!(
                    "Atom {} at {:#x} overlaps the previous atom ending at {previous_end:#x}",
                    cursor.0,
                    atom.address
                );
            }
            let padding = atom.address - previous_end;
            if padding >= atom.alignment.value() {
                bail!(
                    "Atom {} has {padding} bytes of padding, more than its alignment {}",
                    cursor.0,
                    atom.alignment
                );
            }
            total += padding + atom.size;
            previous_end = atom.address + atom.size;
            last_seen = cursor;
        }
        if section.last_atom != last_seen {
            bail!("Section {} last_atom doesn't terminate its chain", section.id);
        }
        if total != section.size {
            bail!(
                "Section {} size {:#x} doesn't match its atoms' extent {total:#x}",
                section.id,
                section.size
            );
        }
    }

    for (index, atom) in ctx.graph.pool.iter() {
        if atom.alive && !visited[index.as_usize()] {
            bail!("Live atom {} is not in any section chain", index.0);
        }
    }
    Ok(())
}

/// Segments and the sections within them must be sorted and non-overlapping.
fn check_monotonic(layout: &Layout) -> Result {
    for pair in layout.segments.windows(2) {
        if pair[1].vmaddr < pair[0].vmaddr + pair[0].vmsize {
            bail!(
                "Segment `{}` overlaps `{}` in the address space",
                pair[1].name,
                pair[0].name
            );
        }
        if pair[1].file_offset < pair[0].file_offset + pair[0].file_size {
            bail!(
                "Segment `{}` overlaps `{}` in the file",
                pair[1].name,
                pair[0].name
            );
        }
    }
    let mut previous_end = 0u64;
    for section in &layout.sections {
        if section.vmaddr < previous_end {
            bail!("Section {} out of address order", section.id);
        }
        previous_end = section.vmaddr + section.size;
    }
    Ok(())
}

/// After synthesis, every relocation must resolve: a defined symbol, or a
/// synthetic (stub, GOT slot, pointer) standing in for an external one.
fn check_relocation_closure(ctx: &LinkContext) -> Result {
    use crate::object_file::RelocKind;
    use crate::synthetic::TargetClass;
    use crate::synthetic::classify_target;
    use crate::synthetic::target_key;

    for (index, atom) in ctx.graph.pool.iter() {
        if !atom.alive {
            continue;
        }
        for reloc in &atom.relocs {
            let key = target_key(ctx.symbol_db, reloc.target);
            let external = matches!(
                classify_target(ctx.symbol_db, reloc.target),
                TargetClass::External { .. }
            );
            let indirection_ok = match reloc.kind {
                RelocKind::Branch if external => ctx.synthetics.stubs.get(key).is_some(),
                RelocKind::GotLoad
                | RelocKind::Got
                | RelocKind::PointerToGot
                | RelocKind::GotPage21
                | RelocKind::GotPageOff12 => {
                    // A missing GOT entry is only legal when the peephole
                    // will bypass it.
                    ctx.synthetics.got.get(key).is_some()
                        || (reloc.kind == RelocKind::GotLoad && !external)
                }
                RelocKind::TlvLoad | RelocKind::TlvPage21 | RelocKind::TlvPageOff12
                    if external =>
                {
                    ctx.synthetics.tlv_ptrs.get(key).is_some()
                }
                RelocKind::Absolute => true,
                _ if external => false,
                _ => true,
            };
            if !indirection_ok {
                bail!(
                    "Relocation in atom {} has no synthesized indirection for its target",
                    index.0
                );
            }
        }
    }
    Ok(())
}
