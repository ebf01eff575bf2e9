use crate::error::Result;
use anyhow::bail;
use std::fmt::Debug;
use std::fmt::Display;

/// An alignment. Always a power of two, stored as the exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub(crate) struct Alignment {
    pub(crate) exponent: u8,
}

/// The minimum alignment that we support.
pub(crate) const MIN: Alignment = Alignment { exponent: 0 };

/// The maximum alignment that we support. 2^15 covers every section alignment
/// emitted by the compilers we accept input from.
pub(crate) const MAX: Alignment = Alignment { exponent: 15 };

/// Alignment of a GOT / lazy-pointer / TLV slot.
pub(crate) const POINTER: Alignment = Alignment { exponent: 3 };

/// Alignment of a stub or thunk body.
pub(crate) const CODE: Alignment = Alignment { exponent: 2 };

/// Alignment of a PLT entry.
pub(crate) const PLT_ENTRY: Alignment = Alignment { exponent: 4 };

/// Alignment of a loadable segment boundary.
pub(crate) const PAGE: Alignment = Alignment { exponent: 12 };

/// Mach-O `__TEXT` segments on aarch64 use 16 KiB pages.
pub(crate) const PAGE_16K: Alignment = Alignment { exponent: 14 };

impl Alignment {
    pub(crate) fn new(raw: u64) -> Result<Self> {
        if !raw.is_power_of_two() {
            bail!("Invalid alignment 0x{raw:x}");
        }
        let exponent = raw.trailing_zeros();
        if exponent > u32::from(MAX.exponent) {
            bail!("Unsupported alignment 0x{raw:x}");
        }
        Ok(Alignment {
            exponent: exponent as u8,
        })
    }

    /// Builds an alignment directly from a log2 exponent, as stored in Mach-O
    /// section headers and wasm symbol tables.
    pub(crate) fn from_log2(exponent: u8) -> Result<Self> {
        if exponent > MAX.exponent {
            bail!("Unsupported alignment 2^{exponent}");
        }
        Ok(Alignment { exponent })
    }

    pub(crate) fn value(self) -> u64 {
        1 << self.exponent
    }

    pub(crate) fn align_up(self, value: u64) -> u64 {
        value.next_multiple_of(self.value())
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.value(), f)
    }
}

#[test]
fn test_align_up() {
    assert_eq!(Alignment::new(16).unwrap().align_up(16), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(15), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(1), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(0), 0);
    assert_eq!(Alignment::new(16).unwrap().align_up(31), 32);
}

#[test]
fn test_rejects_non_power_of_two() {
    assert!(Alignment::new(24).is_err());
    assert!(Alignment::new(1 << 20).is_err());
    assert!(Alignment::from_log2(16).is_err());
}
