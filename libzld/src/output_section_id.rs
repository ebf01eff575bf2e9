//! Output section identity, the input→output section mapping, and the fixed
//! precedence order that layout sorts by. Built-in sections are declared per
//! backend in precedence order; custom input sections slot in between them
//! according to their kind.

use crate::args::Backend;
use crate::object_file::InputSection;
use crate::object_file::SectionKind;
use std::fmt::Display;

/// An ID for an output section, indexing `OutputSections::defs`. Independent
/// of output order; layout sorts by `sort_key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OutputSectionId(pub(crate) u32);

impl OutputSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Segment precedence, shared by ELF (where segments are synthesized from
/// protection) and Mach-O (where they're named).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum SegmentRank {
    Text,
    DataConst,
    Data,
    /// Non-loaded content (debug info, notes kept out of segments).
    NonAlloc,
}

pub(crate) struct SectionDef {
    pub(crate) segment_name: &'static str,
    pub(crate) name: Vec<u8>,
    pub(crate) kind: SectionKind,
    pub(crate) segment_rank: SegmentRank,
    /// Position within the segment; ties broken by definition order.
    pub(crate) rank: u32,
    /// Mach-O section type/attribute word for the writer.
    pub(crate) macho_flags: u32,
}

pub(crate) struct OutputSections {
    backend: Backend,
    pub(crate) defs: Vec<SectionDef>,
}

// Built-in Mach-O sections, in precedence order within their segments.
pub(crate) const TEXT: OutputSectionId = OutputSectionId(0);
pub(crate) const STUBS: OutputSectionId = OutputSectionId(1);
pub(crate) const STUB_HELPER: OutputSectionId = OutputSectionId(2);
pub(crate) const CONST_TEXT: OutputSectionId = OutputSectionId(3);
pub(crate) const CSTRING: OutputSectionId = OutputSectionId(4);
pub(crate) const GOT: OutputSectionId = OutputSectionId(5);
pub(crate) const CONST_DATA: OutputSectionId = OutputSectionId(6);
pub(crate) const INIT_POINTERS: OutputSectionId = OutputSectionId(7);
pub(crate) const FINI_POINTERS: OutputSectionId = OutputSectionId(8);
pub(crate) const LAZY_SYMBOL_PTR: OutputSectionId = OutputSectionId(9);
pub(crate) const TLV_PTRS: OutputSectionId = OutputSectionId(10);
pub(crate) const DATA: OutputSectionId = OutputSectionId(11);
pub(crate) const TLV_VARS: OutputSectionId = OutputSectionId(12);
pub(crate) const TLV_DATA: OutputSectionId = OutputSectionId(13);
pub(crate) const TLV_BSS: OutputSectionId = OutputSectionId(14);
pub(crate) const BSS: OutputSectionId = OutputSectionId(15);
pub(crate) const COMMON: OutputSectionId = OutputSectionId(16);

pub(crate) const NUM_BUILT_IN_SECTIONS: usize = 17;

struct BuiltIn {
    segment_name: &'static str,
    elf_name: &'static str,
    macho_name: &'static str,
    kind: SectionKind,
    segment_rank: SegmentRank,
    macho_flags: u32,
}

const BUILT_INS: [BuiltIn; NUM_BUILT_IN_SECTIONS] = {
    use object::macho;
    [
        BuiltIn {
            segment_name: "__TEXT",
            elf_name: ".text",
            macho_name: "__text",
            kind: SectionKind::Code,
            segment_rank: SegmentRank::Text,
            macho_flags: macho::S_REGULAR
                | macho::S_ATTR_PURE_INSTRUCTIONS
                | macho::S_ATTR_SOME_INSTRUCTIONS,
        },
        BuiltIn {
            segment_name: "__TEXT",
            elf_name: ".plt",
            macho_name: "__stubs",
            kind: SectionKind::Code,
            segment_rank: SegmentRank::Text,
            macho_flags: macho::S_SYMBOL_STUBS
                | macho::S_ATTR_PURE_INSTRUCTIONS
                | macho::S_ATTR_SOME_INSTRUCTIONS,
        },
        BuiltIn {
            segment_name: "__TEXT",
            elf_name: ".plt.helper",
            macho_name: "__stub_helper",
            kind: SectionKind::Code,
            segment_rank: SegmentRank::Text,
            macho_flags: macho::S_REGULAR
                | macho::S_ATTR_PURE_INSTRUCTIONS
                | macho::S_ATTR_SOME_INSTRUCTIONS,
        },
        BuiltIn {
            segment_name: "__TEXT",
            elf_name: ".rodata",
            macho_name: "__const",
            kind: SectionKind::ReadOnlyData,
            segment_rank: SegmentRank::Text,
            macho_flags: macho::S_REGULAR,
        },
        BuiltIn {
            segment_name: "__TEXT",
            elf_name: ".rodata.str",
            macho_name: "__cstring",
            kind: SectionKind::Cstring,
            segment_rank: SegmentRank::Text,
            macho_flags: macho::S_CSTRING_LITERALS,
        },
        BuiltIn {
            segment_name: "__DATA_CONST",
            elf_name: ".got",
            macho_name: "__got",
            kind: SectionKind::Data,
            segment_rank: SegmentRank::DataConst,
            macho_flags: macho::S_NON_LAZY_SYMBOL_POINTERS,
        },
        BuiltIn {
            segment_name: "__DATA_CONST",
            elf_name: ".data.rel.ro",
            macho_name: "__const",
            kind: SectionKind::ReadOnlyData,
            segment_rank: SegmentRank::DataConst,
            macho_flags: macho::S_REGULAR,
        },
        BuiltIn {
            segment_name: "__DATA_CONST",
            elf_name: ".init_array",
            macho_name: "__mod_init_func",
            kind: SectionKind::InitPointers,
            segment_rank: SegmentRank::DataConst,
            macho_flags: macho::S_MOD_INIT_FUNC_POINTERS,
        },
        BuiltIn {
            segment_name: "__DATA_CONST",
            elf_name: ".fini_array",
            macho_name: "__mod_term_func",
            kind: SectionKind::FiniPointers,
            segment_rank: SegmentRank::DataConst,
            macho_flags: macho::S_MOD_TERM_FUNC_POINTERS,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".plt.got",
            macho_name: "__la_symbol_ptr",
            kind: SectionKind::Data,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_LAZY_SYMBOL_POINTERS,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".got.tlv",
            macho_name: "__thread_ptrs",
            kind: SectionKind::Data,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_THREAD_LOCAL_VARIABLE_POINTERS,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".data",
            macho_name: "__data",
            kind: SectionKind::Data,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_REGULAR,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".tlv",
            macho_name: "__thread_vars",
            kind: SectionKind::TlsVariables,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_THREAD_LOCAL_VARIABLES,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".tdata",
            macho_name: "__thread_data",
            kind: SectionKind::TlsData,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_THREAD_LOCAL_REGULAR,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".tbss",
            macho_name: "__thread_bss",
            kind: SectionKind::TlsBss,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_THREAD_LOCAL_ZEROFILL,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".bss",
            macho_name: "__bss",
            kind: SectionKind::Zerofill,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_ZEROFILL,
        },
        BuiltIn {
            segment_name: "__DATA",
            elf_name: ".bss.common",
            macho_name: "__common",
            kind: SectionKind::Zerofill,
            segment_rank: SegmentRank::Data,
            macho_flags: macho::S_ZEROFILL,
        },
    ]
};

impl OutputSections {
    pub(crate) fn new(backend: Backend) -> OutputSections {
        let defs = BUILT_INS
            .iter()
            .enumerate()
            .map(|(rank, built_in)| SectionDef {
                segment_name: built_in.segment_name,
                name: match backend {
                    Backend::MachO => built_in.macho_name.as_bytes().to_vec(),
                    _ => built_in.elf_name.as_bytes().to_vec(),
                },
                kind: built_in.kind,
                segment_rank: built_in.segment_rank,
                rank: rank as u32,
                macho_flags: built_in.macho_flags,
            })
            .collect();
        OutputSections { backend, defs }
    }

    pub(crate) fn def(&self, id: OutputSectionId) -> &SectionDef {
        &self.defs[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.defs.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OutputSectionId> {
        (0..self.defs.len() as u32).map(OutputSectionId)
    }

    /// Total precedence order: `(segment precedence, rank within segment)`.
    pub(crate) fn sort_key(&self, id: OutputSectionId) -> (SegmentRank, u32, u32) {
        let def = self.def(id);
        (def.segment_rank, def.rank, id.0)
    }

    /// Maps an input section to its output section, collapsing synonyms and
    /// appending unknown sections verbatim.
    pub(crate) fn section_for_input(&mut self, input: &InputSection) -> OutputSectionId {
        if let Some(id) = self.match_built_in(input) {
            return id;
        }
        // Unknown section: append verbatim, keeping its own name (and
        // segment, for Mach-O inputs).
        let segment = input
            .name
            .segment
            .map(|s| String::from_utf8_lossy(s).into_owned());
        let name = input.name.name.to_vec();
        if let Some(existing) = self.defs.iter().position(|def| {
            def.name == name
                && segment
                    .as_deref()
                    .is_none_or(|s| def.segment_name == s)
        }) {
            return OutputSectionId(existing as u32);
        }
        let segment_rank = match input.kind {
            SectionKind::Code | SectionKind::ReadOnlyData | SectionKind::Cstring => {
                SegmentRank::Text
            }
            SectionKind::Debug | SectionKind::Note | SectionKind::Other => SegmentRank::NonAlloc,
            _ => SegmentRank::Data,
        };
        let id = OutputSectionId(self.defs.len() as u32);
        self.defs.push(SectionDef {
            segment_name: match (self.backend, segment) {
                (Backend::MachO, Some(segment)) => Box::leak(segment.into_boxed_str()),
                (Backend::MachO, None) => match segment_rank {
                    SegmentRank::Text => "__TEXT",
                    _ => "__DATA",
                },
                _ => "",
            },
            name,
            kind: input.kind,
            segment_rank,
            rank: NUM_BUILT_IN_SECTIONS as u32 + id.0,
            macho_flags: object::macho::S_REGULAR,
        });
        id
    }

    fn match_built_in(&self, input: &InputSection) -> Option<OutputSectionId> {
        let name = input.name.name;
        if let Some(segment) = input.name.segment {
            // Mach-O mapping, with the documented synonym collapses.
            let mapped = match (segment, name) {
                (b"__TEXT", b"__text") => TEXT,
                (b"__TEXT", b"__const" | b"__literal4" | b"__literal8" | b"__literal16") => {
                    CONST_TEXT
                }
                (b"__TEXT", b"__cstring" | b"__StaticString") => CSTRING,
                (b"__DATA" | b"__DATA_CONST", b"__const") => CONST_DATA,
                (b"__DATA" | b"__DATA_CONST", b"__got") => GOT,
                (b"__DATA" | b"__DATA_CONST", b"__mod_init_func") => INIT_POINTERS,
                (b"__DATA" | b"__DATA_CONST", b"__mod_term_func") => FINI_POINTERS,
                (b"__DATA", b"__la_symbol_ptr") => LAZY_SYMBOL_PTR,
                (b"__DATA", b"__data") => DATA,
                (b"__DATA", b"__thread_vars") => TLV_VARS,
                (b"__DATA", b"__thread_data") => TLV_DATA,
                (b"__DATA", b"__thread_bss") => TLV_BSS,
                (b"__DATA", b"__bss") => BSS,
                (b"__DATA", b"__common") => COMMON,
                _ => return self.match_by_kind(input),
            };
            return Some(mapped);
        }
        // ELF / wasm: prefix collapsing first, then kind.
        let mapped = if name == b".text" || name.starts_with(b".text.") {
            TEXT
        } else if name == b".rodata" || name.starts_with(b".rodata.") {
            if input.kind == SectionKind::Cstring {
                CSTRING
            } else {
                CONST_TEXT
            }
        } else if name == b".data.rel.ro" || name.starts_with(b".data.rel.ro.") {
            CONST_DATA
        } else if name == b".data" || name.starts_with(b".data.") {
            DATA
        } else if name == b".bss" || name.starts_with(b".bss.") {
            BSS
        } else if name == b".tdata" || name.starts_with(b".tdata.") {
            TLV_DATA
        } else if name == b".tbss" || name.starts_with(b".tbss.") {
            TLV_BSS
        } else if name == b".init_array" || name.starts_with(b".init_array.") {
            INIT_POINTERS
        } else if name == b".fini_array" || name.starts_with(b".fini_array.") {
            FINI_POINTERS
        } else {
            return self.match_by_kind(input);
        };
        Some(mapped)
    }

    fn match_by_kind(&self, input: &InputSection) -> Option<OutputSectionId> {
        match input.kind {
            SectionKind::Code => Some(TEXT),
            SectionKind::Cstring => Some(CSTRING),
            SectionKind::ReadOnlyData => Some(CONST_TEXT),
            SectionKind::Data => Some(DATA),
            SectionKind::Zerofill => Some(BSS),
            SectionKind::TlsData => Some(TLV_DATA),
            SectionKind::TlsBss => Some(TLV_BSS),
            SectionKind::TlsVariables => Some(TLV_VARS),
            SectionKind::InitPointers => Some(INIT_POINTERS),
            SectionKind::FiniPointers => Some(FINI_POINTERS),
            // Appended verbatim by the caller.
            SectionKind::Debug | SectionKind::Note | SectionKind::Other => None,
        }
    }
}

pub(crate) const VM_PROT_READ: u32 = 0x1;
pub(crate) const VM_PROT_WRITE: u32 = 0x2;
pub(crate) const VM_PROT_EXECUTE: u32 = 0x4;

/// Initial protection for a segment, derived from its name.
pub(crate) fn segment_protection(segment_name: &str) -> (u32, u32) {
    let (init, max) = match segment_name {
        "__PAGEZERO" => (0, 0),
        "__TEXT" => (
            VM_PROT_READ | VM_PROT_EXECUTE,
            VM_PROT_READ | VM_PROT_EXECUTE,
        ),
        "__LINKEDIT" => (VM_PROT_READ, VM_PROT_READ),
        // __DATA, __DATA_CONST (constant after dyld applies fixups) and any
        // custom segment default to read-write.
        _ => (VM_PROT_READ | VM_PROT_WRITE, VM_PROT_READ | VM_PROT_WRITE),
    };
    (init, max)
}

impl Display for OutputSectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "section-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use crate::object_file::SectionData;
    use crate::object_file::SectionName;

    fn input_section(
        segment: Option<&'static [u8]>,
        name: &'static [u8],
        kind: SectionKind,
    ) -> InputSection<'static> {
        InputSection {
            name: SectionName { segment, name },
            kind,
            alignment: alignment::MIN,
            data: SectionData::Bytes(&[]),
            relocs: Vec::new(),
            comdat_signature: None,
        }
    }

    #[test]
    fn test_macho_synonym_collapse() {
        let mut sections = OutputSections::new(Backend::MachO);
        let id = sections.section_for_input(&input_section(
            Some(b"__DATA"),
            b"__const",
            SectionKind::ReadOnlyData,
        ));
        assert_eq!(id, CONST_DATA);
        assert_eq!(sections.def(id).segment_name, "__DATA_CONST");
    }

    #[test]
    fn test_elf_prefix_collapse() {
        let mut sections = OutputSections::new(Backend::Elf);
        let id = sections.section_for_input(&input_section(
            None,
            b".text.hot.main",
            SectionKind::Code,
        ));
        assert_eq!(id, TEXT);
    }

    #[test]
    fn test_unknown_section_appended_once() {
        let mut sections = OutputSections::new(Backend::MachO);
        let custom = input_section(Some(b"__CUSTOM"), b"__stuff", SectionKind::Other);
        let a = sections.section_for_input(&custom);
        let b = sections.section_for_input(&custom);
        assert_eq!(a, b);
        assert!(a.as_usize() >= NUM_BUILT_IN_SECTIONS);
    }

    #[test]
    fn test_precedence_order() {
        let sections = OutputSections::new(Backend::MachO);
        assert!(sections.sort_key(TEXT) < sections.sort_key(STUBS));
        assert!(sections.sort_key(STUBS) < sections.sort_key(GOT));
        assert!(sections.sort_key(GOT) < sections.sort_key(DATA));
        assert!(sections.sort_key(DATA) < sections.sort_key(BSS));
    }
}
