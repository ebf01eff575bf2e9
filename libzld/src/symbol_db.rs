//! The global symbol table. One `Global` exists per externally-visible name
//! across all inputs; every local reference reaches it through the per-file
//! side tables. The merge rules decide which definition wins when several
//! inputs provide one.

use crate::alignment::Alignment;
use crate::error::LinkError;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::object_file::InputSymbol;
use crate::symbol::FileId;
use crate::symbol::SymbolName;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GlobalIndex(pub(crate) u32);

impl GlobalIndex {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Where the chosen definition of a global lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Definition {
    Undefined,
    Object {
        file: FileId,
        sym_index: u32,
    },
    /// A surviving COMMON definition; becomes a zerofill atom.
    Tentative {
        size: u64,
        alignment: Alignment,
    },
    /// Bound to a dynamic library. Ordinals are one-based.
    Dylib {
        ordinal: u16,
        weak: bool,
    },
    /// Supplied by the linker itself (`__mh_execute_header`, section markers).
    Synthetic,
    Absolute(u64),
    /// Runtime flat-namespace lookup (`allow_undef`).
    FlatLookup,
}

pub(crate) struct Global<'data> {
    pub(crate) name: PreHashed<SymbolName<'data>>,
    pub(crate) definition: Definition,
    /// The winning definition is weak.
    pub(crate) weak: bool,
    /// Some undefined reference to this name exists (as opposed to the global
    /// existing only because something defined it).
    pub(crate) referenced: bool,
}

/// How a definition ranks for the merge rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strength {
    Strong,
    Weak,
    Tentative,
    Undefined,
}

pub(crate) struct SymbolDb<'data> {
    pub(crate) globals: Vec<Global<'data>>,
    name_to_global: PassThroughHashMap<SymbolName<'data>, GlobalIndex>,

    /// Per-file mapping `local sym index → global index`, populated for
    /// external symbols only.
    pub(crate) file_globals: Vec<Vec<Option<GlobalIndex>>>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new() -> SymbolDb<'data> {
        SymbolDb {
            globals: Vec::new(),
            name_to_global: PassThroughHashMap::default(),
            file_globals: Vec::new(),
        }
    }

    pub(crate) fn lookup(&self, name: &PreHashed<SymbolName<'data>>) -> Option<GlobalIndex> {
        self.name_to_global.get(name).copied()
    }

    pub(crate) fn global(&self, index: GlobalIndex) -> &Global<'data> {
        &self.globals[index.as_usize()]
    }

    pub(crate) fn global_mut(&mut self, index: GlobalIndex) -> &mut Global<'data> {
        &mut self.globals[index.as_usize()]
    }

    /// The global a file's external symbol resolved to.
    pub(crate) fn global_for(&self, file: FileId, sym_index: u32) -> Option<GlobalIndex> {
        self.file_globals
            .get(file.as_usize())?
            .get(sym_index as usize)
            .copied()
            .flatten()
    }

    /// Registers a linker-defined symbol. Does not override existing
    /// definitions; an input always wins over a synthetic.
    pub(crate) fn add_synthetic(&mut self, name: &'data [u8]) -> GlobalIndex {
        let key = SymbolName::prehashed(name);
        let index = self.intern(key);
        let global = &mut self.globals[index.as_usize()];
        if global.definition == Definition::Undefined {
            global.definition = Definition::Synthetic;
        }
        index
    }

    fn intern(&mut self, name: PreHashed<SymbolName<'data>>) -> GlobalIndex {
        *self.name_to_global.entry(name).or_insert_with(|| {
            let index = GlobalIndex(self.globals.len() as u32);
            self.globals.push(Global {
                name,
                definition: Definition::Undefined,
                weak: false,
                referenced: false,
            });
            index
        })
    }

    /// Walks every external symbol of a newly-added object and merges it into
    /// the global table. Must be called with files in load order; `file` must
    /// equal the number of files already added.
    pub(crate) fn add_object_symbols(
        &mut self,
        file: FileId,
        symbols: &[InputSymbol<'data>],
    ) -> Result {
        debug_assert_eq!(self.file_globals.len(), file.as_usize());
        let mut side_table = vec![None; symbols.len()];

        for (sym_index, sym) in symbols.iter().enumerate() {
            if !sym.is_external() || sym.flags.contains(crate::object_file::SymFlags::STAB) {
                continue;
            }
            let key = SymbolName::prehashed(sym.name);
            let global_index = self.intern(key);
            side_table[sym_index] = Some(global_index);
            self.merge(global_index, file, sym_index as u32, sym)?;
        }

        self.file_globals.push(side_table);
        Ok(())
    }

    /// The merge rules. Rows are the existing definition, columns the new
    /// one:
    ///
    /// |            | strong   | weak | tentative   | undef |
    /// |------------|----------|------|-------------|-------|
    /// | strong     | error    | keep | keep        | keep  |
    /// | weak       | replace  | keep | keep        | keep  |
    /// | tentative  | replace  | keep | keep larger | keep  |
    /// | undef      | replace  | repl | replace     | keep  |
    fn merge(
        &mut self,
        global_index: GlobalIndex,
        file: FileId,
        sym_index: u32,
        sym: &InputSymbol<'data>,
    ) -> Result {
        let new_strength = strength_of(sym);
        let global = &mut self.globals[global_index.as_usize()];
        let existing_strength = match (&global.definition, global.weak) {
            (Definition::Undefined | Definition::FlatLookup, _) => Strength::Undefined,
            (Definition::Tentative { .. }, _) => Strength::Tentative,
            (_, true) => Strength::Weak,
            // Synthetic and dylib definitions yield to any object definition,
            // which the weak row gives us.
            (Definition::Synthetic | Definition::Dylib { .. }, _) => Strength::Weak,
            (_, false) => Strength::Strong,
        };

        if new_strength == Strength::Undefined {
            global.referenced = true;
            return Ok(());
        }

        let take_new = match (existing_strength, new_strength) {
            (Strength::Strong, Strength::Strong) => {
                return Err(LinkError::MultipleSymbolDefinitions(
                    global.name.to_string(),
                )
                .into());
            }
            (Strength::Strong, _) => false,
            (Strength::Weak, Strength::Strong) => true,
            (Strength::Weak, _) => false,
            (Strength::Tentative, Strength::Strong) => true,
            (Strength::Tentative, Strength::Tentative) => {
                // Keep the larger of the two.
                let Definition::Tentative { size, alignment } = &mut global.definition else {
                    unreachable!();
                };
                let new_alignment = sym.common_alignment.unwrap_or(crate::alignment::MIN);
                *alignment = (*alignment).max(new_alignment);
                if sym.value > *size {
                    *size = sym.value;
                }
                false
            }
            (Strength::Tentative, Strength::Weak | Strength::Undefined) => false,
            (Strength::Undefined, _) => true,
        };

        if take_new {
            global.definition = if new_strength == Strength::Tentative {
                Definition::Tentative {
                    size: sym.value,
                    alignment: sym.common_alignment.unwrap_or(crate::alignment::MIN),
                }
            } else {
                Definition::Object { file, sym_index }
            };
            global.weak = new_strength == Strength::Weak;
        }
        Ok(())
    }

    /// Names that are still undefined, in insertion order.
    pub(crate) fn undefined_globals(&self) -> impl Iterator<Item = GlobalIndex> + '_ {
        self.globals
            .iter()
            .enumerate()
            .filter(|(_, g)| g.definition == Definition::Undefined)
            .map(|(i, _)| GlobalIndex(i as u32))
    }
}

fn strength_of(sym: &InputSymbol) -> Strength {
    if sym.is_undefined() {
        Strength::Undefined
    } else if sym.is_tentative() {
        Strength::Tentative
    } else if sym.is_strong() {
        Strength::Strong
    } else {
        Strength::Weak
    }
}

impl Display for GlobalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "global-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_file::Binding;
    use crate::object_file::SymFlags;

    fn sym<'d>(name: &'d [u8], binding: Binding, flags: SymFlags) -> InputSymbol<'d> {
        InputSymbol {
            name,
            value: 0,
            size: 0,
            section: if flags.contains(SymFlags::UNDEFINED) {
                None
            } else {
                Some(0)
            },
            binding,
            flags,
            common_alignment: None,
        }
    }

    fn tentative(name: &[u8], size: u64, align: u64) -> InputSymbol<'_> {
        InputSymbol {
            name,
            value: size,
            size,
            section: None,
            binding: Binding::Global,
            flags: SymFlags::TENTATIVE,
            common_alignment: Some(Alignment::new(align).unwrap()),
        }
    }

    #[test]
    fn test_weak_then_strong_replaces() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[sym(b"foo", Binding::Weak, SymFlags::empty())])
            .unwrap();
        db.add_object_symbols(FileId(1), &[sym(b"foo", Binding::Global, SymFlags::empty())])
            .unwrap();
        let global = db.global(db.lookup(&SymbolName::prehashed(b"foo")).unwrap());
        assert_eq!(
            global.definition,
            Definition::Object {
                file: FileId(1),
                sym_index: 0
            }
        );
        assert!(!global.weak);
    }

    #[test]
    fn test_strong_then_weak_keeps_strong() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[sym(b"foo", Binding::Global, SymFlags::empty())])
            .unwrap();
        db.add_object_symbols(FileId(1), &[sym(b"foo", Binding::Weak, SymFlags::empty())])
            .unwrap();
        let global = db.global(db.lookup(&SymbolName::prehashed(b"foo")).unwrap());
        assert_eq!(
            global.definition,
            Definition::Object {
                file: FileId(0),
                sym_index: 0
            }
        );
    }

    #[test]
    fn test_duplicate_strong_is_error() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[sym(b"foo", Binding::Global, SymFlags::empty())])
            .unwrap();
        let err = db
            .add_object_symbols(FileId(1), &[sym(b"foo", Binding::Global, SymFlags::empty())])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::MultipleSymbolDefinitions(_))
        ));
    }

    #[test]
    fn test_tentative_merge_keeps_larger() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[tentative(b"buf", 8, 8)])
            .unwrap();
        db.add_object_symbols(FileId(1), &[tentative(b"buf", 64, 16)])
            .unwrap();
        let global = db.global(db.lookup(&SymbolName::prehashed(b"buf")).unwrap());
        assert_eq!(
            global.definition,
            Definition::Tentative {
                size: 64,
                alignment: Alignment::new(16).unwrap()
            }
        );
    }

    #[test]
    fn test_strong_overrides_tentative() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[tentative(b"buf", 64, 8)])
            .unwrap();
        db.add_object_symbols(FileId(1), &[sym(b"buf", Binding::Global, SymFlags::empty())])
            .unwrap();
        assert!(matches!(
            db.global(db.lookup(&SymbolName::prehashed(b"buf")).unwrap())
                .definition,
            Definition::Object { .. }
        ));
    }

    #[test]
    fn test_undef_then_def_then_undef() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(FileId(0), &[sym(b"foo", Binding::Global, SymFlags::UNDEFINED)])
            .unwrap();
        assert!(matches!(
            db.global(db.lookup(&SymbolName::prehashed(b"foo")).unwrap())
                .definition,
            Definition::Undefined
        ));
        db.add_object_symbols(FileId(1), &[sym(b"foo", Binding::Global, SymFlags::empty())])
            .unwrap();
        db.add_object_symbols(FileId(2), &[sym(b"foo", Binding::Global, SymFlags::UNDEFINED)])
            .unwrap();
        let global = db.global(db.lookup(&SymbolName::prehashed(b"foo")).unwrap());
        assert!(matches!(global.definition, Definition::Object { .. }));
        assert!(global.referenced);
    }

    #[test]
    fn test_private_extern_is_not_strong() {
        let mut db = SymbolDb::new();
        db.add_object_symbols(
            FileId(0),
            &[sym(b"foo", Binding::Global, SymFlags::PRIVATE_EXTERN)],
        )
        .unwrap();
        // A second hidden definition must not be a duplicate error.
        db.add_object_symbols(
            FileId(1),
            &[sym(b"foo", Binding::Global, SymFlags::PRIVATE_EXTERN)],
        )
        .unwrap();
    }
}
