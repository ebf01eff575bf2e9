//! aarch64 instruction fixups: ADRP page pairs, 26-bit branches, and the
//! load/store scaled low-12 immediates. The relocation table is documented in
//! the AArch64 ELF ABI (aaelf64); Mach-O uses the same instruction encodings
//! with its own relocation names.

use crate::bits::BitExtraction as _;
use crate::bits::fits_signed;
use crate::error::Result;
use anyhow::bail;

pub(crate) const PAGE_SIZE: u64 = 0x1000;
pub(crate) const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Branches reach ±128 MiB; beyond that layout inserts a thunk.
pub(crate) const MAX_BRANCH_RANGE: i64 = 128 * 1024 * 1024;

fn read_insn(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn write_insn(bytes: &mut [u8], offset: usize, insn: u32) {
    bytes[offset..offset + 4].copy_from_slice(&insn.to_le_bytes());
}

/// Patches a `B`/`BL` with the displacement to `target_addr`. Errors when the
/// target is out of range, which after thunk insertion is a real overflow.
pub(crate) fn write_branch26(
    bytes: &mut [u8],
    offset: u64,
    source_addr: u64,
    target_addr: u64,
) -> Result {
    let displacement = target_addr.wrapping_sub(source_addr) as i64;
    if !fits_signed(displacement, 28) {
        bail!("Branch displacement {displacement:#x} exceeds ±128 MiB");
    }
    if displacement & 3 != 0 {
        bail!("Branch target is not instruction-aligned");
    }
    let offset = offset as usize;
    let insn = read_insn(bytes, offset);
    let imm26 = ((displacement >> 2) as u64).low_bits(26) as u32;
    write_insn(bytes, offset, (insn & 0xfc00_0000) | imm26);
    Ok(())
}

/// Patches an `ADRP` with `page(target) - page(source)`.
pub(crate) fn write_page21(
    bytes: &mut [u8],
    offset: u64,
    source_addr: u64,
    target_addr: u64,
) -> Result {
    let page_delta = ((target_addr & PAGE_MASK) as i64) - ((source_addr & PAGE_MASK) as i64);
    let pages = page_delta >> 12;
    if !fits_signed(pages, 21) {
        bail!("ADRP page delta {page_delta:#x} exceeds ±4 GiB");
    }
    let offset = offset as usize;
    let insn = read_insn(bytes, offset);
    let pages = pages as u64;
    let immlo = (pages.low_bits(2) as u32) << 29;
    let immhi = (pages.extract_bit_range(2..21) as u32) << 5;
    write_insn(
        bytes,
        offset,
        (insn & 0x9f00_001f) | immlo | immhi,
    );
    Ok(())
}

/// Patches the low-12 immediate of the instruction paired with an ADRP. The
/// scale is implied by the instruction: `ADD` takes the byte offset as-is,
/// loads and stores shift by their access size.
pub(crate) fn write_pageoff12(bytes: &mut [u8], offset: u64, target_addr: u64) -> Result {
    let offset = offset as usize;
    let insn = read_insn(bytes, offset);
    let low12 = target_addr.low_bits(12);

    let imm12 = if is_add_immediate(insn) {
        low12
    } else {
        let scale = load_store_scale(insn)?;
        if low12 & ((1 << scale) - 1) != 0 {
            bail!("Load/store target {target_addr:#x} is not aligned for its access size");
        }
        low12 >> scale
    };
    write_insn(
        bytes,
        offset,
        (insn & !(0xfff << 10)) | ((imm12 as u32) << 10),
    );
    Ok(())
}

fn is_add_immediate(insn: u32) -> bool {
    // ADD/SUB (immediate): op class 100010x.
    insn & 0x1f00_0000 == 0x1100_0000
}

/// The implicit shift of a load/store unsigned-immediate instruction.
fn load_store_scale(insn: u32) -> Result<u32> {
    // Load/store register (unsigned immediate): size in bits 31:30, with
    // V=1 opc=1x meaning a 128-bit SIMD access.
    if insn & 0x0a00_0000 != 0x0800_0000 {
        bail!("Unsupported instruction {insn:#010x} for low-12 fixup");
    }
    let size = insn >> 30;
    let is_simd_128 = insn & 0x0480_0000 == 0x0480_0000;
    Ok(if is_simd_128 { 4 } else { size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch26_forward_and_back() {
        // bl 0
        let mut bytes = 0x9400_0000u32.to_le_bytes();
        write_branch26(&mut bytes, 0, 0x1000, 0x2000).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0x9400_0400);

        let mut bytes = 0x9400_0000u32.to_le_bytes();
        write_branch26(&mut bytes, 0, 0x2000, 0x1000).unwrap();
        // -0x1000 >> 2 = -0x400, masked to 26 bits.
        assert_eq!(u32::from_le_bytes(bytes), 0x9400_0000 | 0x03ff_fc00);
    }

    #[test]
    fn test_branch26_range_check() {
        let mut bytes = 0x1400_0000u32.to_le_bytes();
        assert!(write_branch26(&mut bytes, 0, 0, 0x800_0000 - 4).is_ok());
        let mut bytes = 0x1400_0000u32.to_le_bytes();
        assert!(write_branch26(&mut bytes, 0, 0, 0x800_0000).is_err());
    }

    #[test]
    fn test_page21() {
        // adrp x16, 0
        let mut bytes = 0x9000_0010u32.to_le_bytes();
        write_page21(&mut bytes, 0, 0x1000, 0x3456).unwrap();
        let insn = u32::from_le_bytes(bytes);
        // Two pages forward: immlo = 2 & 3 = 2, immhi = 0.
        assert_eq!(insn, 0x9000_0010 | (2 << 29));
    }

    #[test]
    fn test_pageoff12_add() {
        // add x16, x16, #0
        let mut bytes = 0x9100_0210u32.to_le_bytes();
        write_pageoff12(&mut bytes, 0, 0x1abc).unwrap();
        let insn = u32::from_le_bytes(bytes);
        assert_eq!((insn >> 10) & 0xfff, 0xabc);
    }

    #[test]
    fn test_pageoff12_ldr_scaled() {
        // ldr x16, [x16] — 8-byte access, so the immediate is offset/8.
        let mut bytes = 0xf940_0210u32.to_le_bytes();
        write_pageoff12(&mut bytes, 0, 0x1ab8).unwrap();
        let insn = u32::from_le_bytes(bytes);
        assert_eq!((insn >> 10) & 0xfff, 0xab8 / 8);

        // Misaligned target must be rejected.
        let mut bytes = 0xf940_0210u32.to_le_bytes();
        assert!(write_pageoff12(&mut bytes, 0, 0x1ab9).is_err());
    }
}
