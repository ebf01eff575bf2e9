//! The intern table backing every emitted string table. Offsets handed out are
//! final: the accumulated byte buffer is written to the output verbatim, so
//! interning the same bytes twice must return the same offset.

use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;

pub(crate) struct StringTable {
    buffer: Vec<u8>,
    offsets: PassThroughHashMap<Vec<u8>, u32>,
}

impl StringTable {
    /// String tables start with a NUL so that offset 0 always names the empty
    /// string.
    pub(crate) fn new() -> StringTable {
        StringTable {
            buffer: vec![0],
            offsets: PassThroughHashMap::default(),
        }
    }

    pub(crate) fn intern(&mut self, bytes: &[u8]) -> u32 {
        if bytes.is_empty() {
            return 0;
        }
        let key = PreHashed::new(bytes.to_vec(), hash_bytes(bytes));
        *self.offsets.entry(key).or_insert_with(|| {
            let offset = self.buffer.len() as u32;
            self.buffer.extend_from_slice(bytes);
            self.buffer.push(0);
            offset
        })
    }

    pub(crate) fn intern_str(&mut self, s: &str) -> u32 {
        self.intern(s.as_bytes())
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Pads the buffer to the given alignment. Called once just before the
    /// table is written; interning after that would be a bug.
    pub(crate) fn pad_to(&mut self, alignment: usize) {
        while self.buffer.len() % alignment != 0 {
            self.buffer.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let mut table = StringTable::new();
        let a = table.intern(b"printf");
        let b = table.intern(b"puts");
        let c = table.intern(b"printf");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(a, 1);
        assert_eq!(&table.as_bytes()[a as usize..a as usize + 6], b"printf");
    }

    #[test]
    fn test_empty_is_offset_zero() {
        let mut table = StringTable::new();
        assert_eq!(table.intern(b""), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_is_nul_separated() {
        let mut table = StringTable::new();
        table.intern(b"a");
        table.intern(b"bc");
        assert_eq!(table.as_bytes(), b"\0a\0bc\0");
    }
}
