//! x86-64 fixup encoding and the ELF GOT-relaxation peepholes. The rewrites
//! are optional per the psABI but libc won't start without some of them
//! (GOT loads in `_start` run before dynamic relocations are applied), so
//! they're always on for locally-defined targets.

use crate::bits::fits_signed;
use crate::error::Result;
use anyhow::bail;

/// Computes the 32-bit PC-relative displacement for a fixup field at
/// `source_addr` whose instruction ends 4 bytes later.
pub(crate) fn calc_pc_rel_displacement(target_addr: u64, source_addr: u64) -> Result<i32> {
    let displacement = target_addr.wrapping_sub(source_addr + 4) as i64;
    i32::try_from(displacement).map_err(|_| {
        anyhow::anyhow!(
            "PC-relative displacement {displacement:#x} overflows 32 bits"
        )
    })
}

/// What a GOT-relaxation rewrite turned the instruction into, so the caller
/// can pick the matching value computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GotRewrite {
    /// `mov reg, [rip+got]` became `lea reg, [rip+target]`; value stays
    /// PC-relative to the target itself.
    Lea,
    /// The instruction now takes a 32-bit absolute immediate.
    Absolute,
    /// `mov reg, [rip+got@tpoff]` became `mov reg, imm32` carrying the
    /// TP-relative offset.
    TpOffImmediate,
}

/// Whether the GOTPCREL(X) load at `offset` is one of the forms we know how
/// to rewrite to bypass the GOT.
pub(crate) fn gotpcrelx_rewritable(bytes: &[u8], offset: u64) -> bool {
    let offset = offset as usize;
    if offset < 2 {
        return false;
    }
    match bytes[offset - 2] {
        // mov reg, [rip+disp] / cmp reg, [rip+disp]
        0x8b | 0x3b => {
            if offset >= 3 {
                let rex = bytes[offset - 3];
                // A REX prefix with X or B set addresses r8..r15 through the
                // modrm byte we'd be rewriting; leave those alone.
                if rex & 0xf0 == 0x40 && rex & 0x3 != 0 {
                    return false;
                }
            }
            true
        }
        _ => false,
    }
}

/// Whether the initial-exec TLS load at `offset` is the rewritable
/// `mov reg, [rip+x@gottpoff]` form.
pub(crate) fn gottpoff_rewritable(bytes: &[u8], offset: u64) -> bool {
    let offset = offset as usize;
    offset >= 3 && matches!(bytes[offset - 3], 0x48 | 0x4c) && bytes[offset - 2] == 0x8b
}

/// Applies the GOTPCRELX peephole:
/// `mov r64, [rip+got]` → `lea r64, [rip+target]`,
/// `cmp r64, [rip+got]` → `cmp r64, imm32`.
/// Returns how the fixup value must now be computed. The relocation's addend
/// is zeroed by the caller.
pub(crate) fn rewrite_gotpcrelx(bytes: &mut [u8], offset: u64) -> Result<GotRewrite> {
    let offset = offset as usize;
    match bytes[offset - 2] {
        0x8b => {
            bytes[offset - 2] = 0x8d;
            Ok(GotRewrite::Lea)
        }
        0x3b => {
            // cmp reg, [rip+disp] → cmp reg, imm32 (opcode 0x81 /7). The
            // register moves from modrm.reg to modrm.rm.
            let modrm = bytes[offset - 1];
            if offset >= 3 {
                let rex = bytes[offset - 3];
                if rex & 0xf0 == 0x40 {
                    bytes[offset - 3] = (rex & !0x4) | ((rex & 0x4) >> 2);
                }
            }
            bytes[offset - 2] = 0x81;
            bytes[offset - 1] = (modrm >> 3) & 0x7 | 0xf8;
            Ok(GotRewrite::Absolute)
        }
        other => bail!("Unrewritable GOT load opcode {other:#x}"),
    }
}

/// Applies the GOTTPOFF → TPOFF32 peephole:
/// `mov r64, [rip+x@gottpoff]` → `mov r64, imm32`.
pub(crate) fn rewrite_gottpoff(bytes: &mut [u8], offset: u64) -> Result<GotRewrite> {
    let offset = offset as usize;
    let rex = bytes[offset - 3];
    bytes[offset - 3] = (rex & !0x4) | ((rex & 0x4) >> 2);
    bytes[offset - 2] = 0xc7;
    let modrm = &mut bytes[offset - 1];
    *modrm = (*modrm >> 3) & 0x7 | 0xc0;
    Ok(GotRewrite::TpOffImmediate)
}

/// Writes a fixup field of `length` bytes at `offset`.
pub(crate) fn write_value(bytes: &mut [u8], offset: u64, length: u8, value: i64) -> Result {
    let at = offset as usize;
    match length {
        8 => bytes[at..at + 8].copy_from_slice(&value.to_le_bytes()),
        4 => {
            if !fits_signed(value, 32) && u64::try_from(value).map_or(true, |v| v > u32::MAX as u64)
            {
                bail!("Fixup value {value:#x} overflows 32 bits");
            }
            bytes[at..at + 4].copy_from_slice(&(value as i32).to_le_bytes());
        }
        2 => {
            if !fits_signed(value, 16) {
                bail!("Fixup value {value:#x} overflows 16 bits");
            }
            bytes[at..at + 2].copy_from_slice(&(value as i16).to_le_bytes());
        }
        1 => {
            if !fits_signed(value, 8) {
                bail!("Fixup value {value:#x} overflows 8 bits");
            }
            bytes[at] = value as u8;
        }
        0 => {}
        other => bail!("Unsupported fixup length {other}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pc_rel_displacement() {
        assert_eq!(calc_pc_rel_displacement(0x2000, 0x1000).unwrap(), 0xffc);
        assert_eq!(calc_pc_rel_displacement(0x1000, 0x2000).unwrap(), -0x1004);
        assert!(calc_pc_rel_displacement(0x2_0000_0000, 0).is_err());
    }

    #[test]
    fn test_mov_to_lea() {
        // mov 0x0(%rip), %rbp with a REX.W prefix; fixup at offset 3.
        let mut bytes = [0x48, 0x8b, 0x2d, 0, 0, 0, 0];
        assert!(gotpcrelx_rewritable(&bytes, 3));
        assert_eq!(rewrite_gotpcrelx(&mut bytes, 3).unwrap(), GotRewrite::Lea);
        assert_eq!(&bytes[..3], &[0x48, 0x8d, 0x2d]);
    }

    #[test]
    fn test_mov_to_lea_is_fixed_point() {
        // Rewriting produces a lea, which is no longer a GOT load; a second
        // pass over the rewritten bytes must not match.
        let mut bytes = [0x48, 0x8b, 0x2d, 0, 0, 0, 0];
        rewrite_gotpcrelx(&mut bytes, 3).unwrap();
        assert!(!gotpcrelx_rewritable(&bytes, 3));
    }

    #[test]
    fn test_cmp_to_immediate() {
        // cmp 0x0(%rip), %rax → cmp $imm, %rax
        let mut bytes = [0x48, 0x3b, 0x05, 0, 0, 0, 0];
        assert!(gotpcrelx_rewritable(&bytes, 3));
        assert_eq!(
            rewrite_gotpcrelx(&mut bytes, 3).unwrap(),
            GotRewrite::Absolute
        );
        assert_eq!(&bytes[..3], &[0x48, 0x81, 0xf8]);
    }

    #[test]
    fn test_gottpoff_rewrite() {
        // mov x@gottpoff(%rip), %rax → mov $imm, %rax
        let mut bytes = [0x48, 0x8b, 0x05, 0, 0, 0, 0];
        assert!(gottpoff_rewritable(&bytes, 3));
        rewrite_gottpoff(&mut bytes, 3).unwrap();
        assert_eq!(&bytes[..3], &[0x48, 0xc7, 0xc0]);
    }

    #[test]
    fn test_extended_register_not_rewritten() {
        // mov 0x0(%rip), %r13 uses REX.R; modrm rewriting is fine. REX.B/X
        // forms are not.
        let rex_b = [0x49, 0x8b, 0x2d, 0, 0, 0, 0];
        assert!(!gotpcrelx_rewritable(&rex_b, 3));
        let rex_r = [0x4c, 0x8b, 0x2d, 0, 0, 0, 0];
        assert!(gotpcrelx_rewritable(&rex_r, 3));
    }

    #[test]
    fn test_write_value_bounds() {
        let mut buf = [0u8; 8];
        write_value(&mut buf, 0, 4, -4).unwrap();
        assert_eq!(&buf[..4], &[0xfc, 0xff, 0xff, 0xff]);
        assert!(write_value(&mut buf, 0, 4, i64::MAX).is_err());
        write_value(&mut buf, 0, 8, i64::MAX).unwrap();
    }
}
