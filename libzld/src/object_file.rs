//! The format-independent shape that every relocatable input is parsed into.
//! The resolver, atom builder and layout engine only ever see these records;
//! the per-format modules (`elf`, `macho`, `wasm`) are responsible for
//! translating their native headers, symbol tables and relocations into this
//! form at parse time.

use crate::alignment::Alignment;
use crate::args::CpuArch;
use bitflags::bitflags;
use std::fmt::Display;

/// A parsed relocatable object. Owns nothing: all byte slices borrow from the
/// file's mapped data, which outlives the link.
pub(crate) struct ObjectFile<'data> {
    pub(crate) name: String,
    pub(crate) cpu_arch: CpuArch,
    pub(crate) sections: Vec<InputSection<'data>>,
    pub(crate) symbols: Vec<InputSymbol<'data>>,

    /// Whether every externally-addressable symbol starts an independently
    /// relocatable block. Mach-O objects declare this via a header flag; ELF
    /// and wasm objects always subdivide.
    pub(crate) subsections_via_symbols: bool,

    /// Extra structure that only the wasm backend consumes.
    pub(crate) wasm: Option<crate::wasm::WasmModuleInfo<'data>>,

    /// Mach-O `LC_DATA_IN_CODE` entries, re-pointed at our section indexes.
    pub(crate) data_in_code: Vec<DataInCode>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DataInCode {
    pub(crate) section: usize,
    pub(crate) offset_in_section: u64,
    pub(crate) length: u16,
    pub(crate) kind: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionName<'data> {
    /// Mach-O segment name; `None` for ELF and wasm inputs.
    pub(crate) segment: Option<&'data [u8]>,
    pub(crate) name: &'data [u8],
}

impl<'data> SectionName<'data> {
    pub(crate) fn elf(name: &'data [u8]) -> Self {
        SectionName {
            segment: None,
            name,
        }
    }

    pub(crate) fn macho(segment: &'data [u8], name: &'data [u8]) -> Self {
        SectionName {
            segment: Some(segment),
            name,
        }
    }
}

impl Display for SectionName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(segment) = self.segment {
            write!(f, "{},", String::from_utf8_lossy(segment))?;
        }
        write!(f, "{}", String::from_utf8_lossy(self.name))
    }
}

/// What an input section holds, after collapsing per-format type/flag
/// combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Code,
    ReadOnlyData,
    Cstring,
    Data,
    Zerofill,
    TlsData,
    TlsBss,
    /// Mach-O `S_THREAD_LOCAL_VARIABLES` descriptors.
    TlsVariables,
    InitPointers,
    FiniPointers,
    Debug,
    Note,
    /// Unknown content; appended to the output verbatim.
    Other,
}

impl SectionKind {
    pub(crate) fn is_zerofill(self) -> bool {
        matches!(self, SectionKind::Zerofill | SectionKind::TlsBss)
    }
}

pub(crate) enum SectionData<'data> {
    Bytes(&'data [u8]),
    Zerofill(u64),
}

impl SectionData<'_> {
    pub(crate) fn len(&self) -> u64 {
        match self {
            SectionData::Bytes(bytes) => bytes.len() as u64,
            SectionData::Zerofill(size) => *size,
        }
    }
}

pub(crate) struct InputSection<'data> {
    pub(crate) name: SectionName<'data>,
    pub(crate) kind: SectionKind,
    pub(crate) alignment: Alignment,
    pub(crate) data: SectionData<'data>,
    pub(crate) relocs: Vec<InputReloc>,

    /// COMDAT group signature for ELF `SHF_GROUP` sections. Sections whose
    /// group lost deduplication are dropped by the atom builder.
    pub(crate) comdat_signature: Option<&'data [u8]>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SymFlags: u16 {
        const UNDEFINED = 1 << 0;
        const TENTATIVE = 1 << 1;
        const ABSOLUTE = 1 << 2;
        /// Mach-O private extern (`N_PEXT`) / ELF hidden visibility.
        const PRIVATE_EXTERN = 1 << 3;
        const NO_DEAD_STRIP = 1 << 4;
        const STAB = 1 << 5;
        /// Mach-O `N_INDR` re-export.
        const INDIRECT = 1 << 6;
        const TLS = 1 << 7;
        const FUNCTION = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Local,
    Global,
    Weak,
}

pub(crate) struct InputSymbol<'data> {
    pub(crate) name: &'data [u8],

    /// Offset within the owning section for defined symbols (parsers rebase
    /// Mach-O absolute values). Size for tentative definitions.
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) section: Option<usize>,
    pub(crate) binding: Binding,
    pub(crate) flags: SymFlags,
    pub(crate) common_alignment: Option<Alignment>,
}

impl InputSymbol<'_> {
    pub(crate) fn is_undefined(&self) -> bool {
        self.flags.contains(SymFlags::UNDEFINED)
    }

    pub(crate) fn is_tentative(&self) -> bool {
        self.flags.contains(SymFlags::TENTATIVE)
    }

    pub(crate) fn is_external(&self) -> bool {
        self.binding != Binding::Local
    }

    /// A strong definition for the purposes of the merge rules.
    pub(crate) fn is_strong(&self) -> bool {
        !self.is_undefined()
            && !self.is_tentative()
            && self.binding == Binding::Global
            && !self.flags.contains(SymFlags::PRIVATE_EXTERN)
    }
}

/// Relocation kinds after translation from the input format. The per-arch
/// writers interpret these; wasm relocations stay in their own namespace
/// because they patch LEB slots rather than machine instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RelocKind {
    None,
    Absolute,
    Relative,
    Branch,
    /// Load through the GOT (`GOTPCREL` family, `GOT_LOAD`). Eligible for the
    /// mov→lea peephole when the target is locally defined.
    GotLoad,
    /// PC-relative reference to the GOT entry's address without a load.
    Got,
    /// Absolute pointer to a GOT entry (`ARM64_RELOC_POINTER_TO_GOT`).
    PointerToGot,
    Page21,
    PageOff12,
    GotPage21,
    GotPageOff12,
    TlvPage21,
    TlvPageOff12,
    /// x86-64 Mach-O TLV load; ELF `GOTTPOFF` initial-exec load.
    TlvLoad,
    GotTpOff,
    TpOff,
    /// aarch64 local-exec `ADD` pair: bits 23:12 / 11:0 of the TP offset.
    TpOffHi12,
    TpOffLo12,
    DtpOff,
    Wasm(WasmRelocKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WasmRelocKind {
    FunctionIndexLeb,
    TableIndexSleb,
    TableIndexI32,
    MemoryAddrLeb,
    MemoryAddrSleb,
    MemoryAddrI32,
    TypeIndexLeb,
    GlobalIndexLeb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocTarget {
    /// Index into the owning object's symbol table.
    Symbol(u32),
    /// Section-relative reference (local Mach-O relocs, ELF section symbols
    /// are normalized to this at parse time).
    Section(u32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InputReloc {
    /// Offset within the owning input section. The atom builder rebases this
    /// to an offset within the owning atom.
    pub(crate) offset: u64,
    pub(crate) target: RelocTarget,
    pub(crate) kind: RelocKind,
    pub(crate) addend: i64,
    /// Fixup width in bytes.
    pub(crate) length: u8,
    pub(crate) pcrel: bool,
    /// Mach-O `SUBTRACTOR` pairs fold the subtrahend symbol in here.
    pub(crate) subtrahend: Option<u32>,
}

impl Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.name, f)
    }
}
