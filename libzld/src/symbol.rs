use crate::hash::PreHashed;
use std::fmt::Display;

/// Identifies a parsed input object (including archive members pulled in
/// during resolution). IDs index the linker's object list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(pub(crate) u32);

impl FileId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// The only way atoms and relocations refer to symbols. Packs either a
/// per-input symbol `(file, sym_index)` or a synthesized local. The file
/// component is stored plus-one so that zero can mean "synthesized".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolRef {
    file_plus_one: u32,
    index: u32,
}

impl SymbolRef {
    pub(crate) fn object(file: FileId, sym_index: u32) -> SymbolRef {
        SymbolRef {
            file_plus_one: file.0 + 1,
            index: sym_index,
        }
    }

    /// A synthesized local symbol, indexing the linker's synthetic symbol
    /// table.
    pub(crate) fn synthetic(index: u32) -> SymbolRef {
        SymbolRef {
            file_plus_one: 0,
            index,
        }
    }

    pub(crate) fn file(self) -> Option<FileId> {
        self.file_plus_one.checked_sub(1).map(FileId)
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn is_synthetic(self) -> bool {
        self.file_plus_one == 0
    }
}

/// A symbol name. Always prehashed before it goes anywhere near a map.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    bytes: &'data [u8],
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self { bytes }
    }

    pub(crate) fn prehashed(bytes: &'data [u8]) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(Self::new(bytes), crate::hash::hash_bytes(bytes))
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.bytes) {
            Display::fmt(s, f)
        } else {
            write!(f, "INVALID UTF-8({:?})", self.bytes)
        }
    }
}

impl std::fmt::Debug for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}
