//! The atom pool. Atoms are the smallest relocatable units of output
//! content; they're identified by index into one contiguous pool (index 0 is
//! the reserved null atom) and chained into a doubly-linked list per output
//! section once layout order is decided. Indices stay valid as the pool grows
//! during thunk insertion, which is the reason for the arena-and-index shape.

use crate::alignment::Alignment;
use crate::object_file::RelocKind;
use crate::output_section_id::OutputSectionId;
use crate::symbol::FileId;
use crate::symbol::SymbolRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AtomIndex(pub(crate) u32);

pub(crate) const NULL_ATOM: AtomIndex = AtomIndex(0);

impl AtomIndex {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A relocation in its final, atom-relative form.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Relocation {
    pub(crate) offset: u64,
    pub(crate) target: SymbolRef,
    pub(crate) kind: RelocKind,
    pub(crate) addend: i64,
    pub(crate) length: u8,
    pub(crate) pcrel: bool,
    pub(crate) subtrahend: Option<SymbolRef>,
}

pub(crate) enum AtomData<'data> {
    Slice(&'data [u8]),
    Owned(Vec<u8>),
    Zerofill,
}

impl AtomData<'_> {
    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        match self {
            AtomData::Slice(bytes) => Some(bytes),
            AtomData::Owned(bytes) => Some(bytes),
            AtomData::Zerofill => None,
        }
    }

    pub(crate) fn is_zerofill(&self) -> bool {
        matches!(self, AtomData::Zerofill)
    }
}

/// Offsets of the extra symbols contained in an atom, for atoms covering a
/// whole unsplit section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InnerSymbol {
    pub(crate) sym_index: u32,
    pub(crate) offset: u64,
}

pub(crate) struct Atom<'data> {
    /// The input object this came from, or `None` for linker-generated atoms.
    pub(crate) file: Option<FileId>,
    pub(crate) primary: SymbolRef,
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,
    pub(crate) data: AtomData<'data>,
    pub(crate) relocs: Vec<Relocation>,
    pub(crate) prev: AtomIndex,
    pub(crate) next: AtomIndex,
    pub(crate) inner: Vec<InnerSymbol>,

    /// `(input section index, start offset)` within the owning object, for
    /// rebasing per-section input metadata (data-in-code) to atoms.
    pub(crate) input_range: Option<(u32, u64)>,
    pub(crate) output_section: OutputSectionId,

    /// Final virtual address. Zero until layout runs.
    pub(crate) address: u64,

    /// Cleared by the dead-strip sweep; dead atoms never enter a chain.
    pub(crate) alive: bool,
}

pub(crate) struct AtomPool<'data> {
    atoms: Vec<Atom<'data>>,
}

impl<'data> AtomPool<'data> {
    pub(crate) fn new() -> AtomPool<'data> {
        AtomPool {
            atoms: vec![Atom {
                file: None,
                primary: SymbolRef::synthetic(u32::MAX),
                size: 0,
                alignment: crate::alignment::MIN,
                data: AtomData::Zerofill,
                relocs: Vec::new(),
                prev: NULL_ATOM,
                next: NULL_ATOM,
                inner: Vec::new(),
                input_range: None,
                output_section: OutputSectionId(0),
                address: 0,
                alive: false,
            }],
        }
    }

    pub(crate) fn add(&mut self, atom: Atom<'data>) -> AtomIndex {
        let index = AtomIndex(self.atoms.len() as u32);
        self.atoms.push(atom);
        index
    }

    pub(crate) fn get(&self, index: AtomIndex) -> &Atom<'data> {
        &self.atoms[index.as_usize()]
    }

    pub(crate) fn get_mut(&mut self, index: AtomIndex) -> &mut Atom<'data> {
        &mut self.atoms[index.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Every real atom with its index, skipping the null slot.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (AtomIndex, &Atom<'data>)> {
        self.atoms
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, atom)| (AtomIndex(i as u32), atom))
    }

    /// Walks a section's chain from its first atom.
    pub(crate) fn chain(&self, first: AtomIndex) -> ChainIter<'_, 'data> {
        ChainIter {
            pool: self,
            next: first,
        }
    }

    /// Appends `atom` after `tail` in a chain, returning the new tail.
    pub(crate) fn link_after(&mut self, tail: AtomIndex, atom: AtomIndex) -> AtomIndex {
        debug_assert!(!atom.is_null());
        if !tail.is_null() {
            self.get_mut(tail).next = atom;
        }
        self.get_mut(atom).prev = tail;
        self.get_mut(atom).next = NULL_ATOM;
        atom
    }

    /// Inserts `atom` between `at` and its successor.
    pub(crate) fn insert_after(&mut self, at: AtomIndex, atom: AtomIndex) {
        let old_next = self.get(at).next;
        self.get_mut(at).next = atom;
        self.get_mut(atom).prev = at;
        self.get_mut(atom).next = old_next;
        if !old_next.is_null() {
            self.get_mut(old_next).prev = atom;
        }
    }
}

pub(crate) struct ChainIter<'pool, 'data> {
    pool: &'pool AtomPool<'data>,
    next: AtomIndex,
}

impl Iterator for ChainIter<'_, '_> {
    type Item = AtomIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let current = self.next;
        self.next = self.pool.get(current).next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;

    fn blank_atom<'data>() -> Atom<'data> {
        Atom {
            file: None,
            primary: SymbolRef::synthetic(0),
            size: 4,
            alignment: alignment::MIN,
            data: AtomData::Owned(vec![0; 4]),
            relocs: Vec::new(),
            prev: NULL_ATOM,
            next: NULL_ATOM,
            inner: Vec::new(),
            input_range: None,
            output_section: OutputSectionId(0),
            address: 0,
            alive: true,
        }
    }

    #[test]
    fn test_chain_links_and_inserts() {
        let mut pool = AtomPool::new();
        let a = pool.add(blank_atom());
        let b = pool.add(blank_atom());
        let c = pool.add(blank_atom());

        let mut tail = pool.link_after(NULL_ATOM, a);
        tail = pool.link_after(tail, b);
        pool.link_after(tail, c);

        let chain: Vec<AtomIndex> = pool.chain(a).collect();
        assert_eq!(chain, vec![a, b, c]);

        // Insert a thunk between a and b.
        let thunk = pool.add(blank_atom());
        pool.insert_after(a, thunk);
        let chain: Vec<AtomIndex> = pool.chain(a).collect();
        assert_eq!(chain, vec![a, thunk, b, c]);
        assert_eq!(pool.get(b).prev, thunk);
    }

    #[test]
    fn test_null_atom_reserved() {
        let pool = AtomPool::new();
        assert_eq!(pool.len(), 1);
        assert!(NULL_ATOM.is_null());
        assert!(!pool.get(NULL_ATOM).alive);
    }
}
