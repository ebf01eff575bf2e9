//! S6: applying relocations. The writers copy each atom's bytes into the
//! output buffer and hand the copy here; fixups (and the ELF x86-64 GOT
//! peepholes) are applied in place. All address arithmetic happens against
//! the final addresses layout assigned.

use crate::aarch64;
use crate::args::Backend;
use crate::args::CpuArch;
use crate::args::Options;
use crate::atom::AtomIndex;
use crate::atom::Relocation;
use crate::atom_builder::AtomGraph;
use crate::error::Result;
use crate::layout::Layout;
use crate::layout::atom_for_symbol;
use crate::object_file::ObjectFile;
use crate::object_file::RelocKind;
use crate::object_file::SymFlags;
use crate::output_section_id;
use crate::symbol::SymbolRef;
use crate::symbol_db::Definition;
use crate::symbol_db::SymbolDb;
use crate::synthetic::Synthetics;
use crate::synthetic::TargetClass;
use crate::synthetic::TargetKey;
use crate::synthetic::classify_target;
use crate::synthetic::target_key;
use crate::x86_64;
use crate::x86_64::GotRewrite;
use anyhow::bail;

/// The read-only view of everything S6 and S7 need to resolve addresses.
pub(crate) struct LinkContext<'a, 'data> {
    pub(crate) opts: &'a Options,
    pub(crate) objects: &'a [ObjectFile<'data>],
    pub(crate) dylibs: &'a [crate::dylib::Dylib],
    pub(crate) symbol_db: &'a SymbolDb<'data>,
    pub(crate) graph: &'a AtomGraph<'data>,
    pub(crate) synthetics: &'a Synthetics,
    pub(crate) layout: &'a Layout,
}

impl<'data> LinkContext<'_, 'data> {
    /// The final virtual address of a symbol. External (dylib-bound or
    /// flat-lookup) symbols have no address; indirection must have routed
    /// references through a stub or pointer slot before asking.
    pub(crate) fn symbol_address(&self, symbol: SymbolRef) -> Result<u64> {
        if let Some((atom, offset)) =
            atom_for_symbol(self.symbol_db, self.graph, self.synthetics, symbol)
        {
            return Ok(self.graph.pool.get(atom).address + offset);
        }
        match symbol.file() {
            None => bail!("Synthetic symbol {} has no atom", symbol.index()),
            Some(file) => {
                if let Some(global_index) = self.symbol_db.global_for(file, symbol.index()) {
                    let global = self.symbol_db.global(global_index);
                    match global.definition {
                        Definition::Dylib { .. } | Definition::FlatLookup => Ok(0),
                        Definition::Absolute(value) => Ok(value),
                        Definition::Synthetic => self.special_symbol_address(global.name.bytes()),
                        Definition::Undefined => {
                            bail!(
                                "Undefined symbol {} survived resolution",
                                String::from_utf8_lossy(global.name.bytes())
                            )
                        }
                        _ => bail!(
                            "Symbol {} has no address",
                            String::from_utf8_lossy(global.name.bytes())
                        ),
                    }
                } else {
                    let sym = &self.objects[file.as_usize()].symbols[symbol.index() as usize];
                    if sym.flags.contains(SymFlags::ABSOLUTE) {
                        Ok(sym.value)
                    } else {
                        bail!(
                            "Local symbol {} in `{}` has no atom",
                            String::from_utf8_lossy(sym.name),
                            self.objects[file.as_usize()],
                        )
                    }
                }
            }
        }
    }

    /// Addresses of the linker-defined symbols that don't own atoms.
    fn special_symbol_address(&self, name: &[u8]) -> Result<u64> {
        let (edata, bss_start, end) = self.layout_boundaries();
        let address = match name {
            b"__mh_execute_header" | b"__mh_dylib_header" | b"___dso_handle"
            | b"__executable_start" => self.layout.base_address,
            b"_GLOBAL_OFFSET_TABLE_" => self
                .layout
                .section_by_id(output_section_id::GOT)
                .map_or(self.layout.base_address, |section| section.vmaddr),
            b"_edata" => edata,
            b"__bss_start" => bss_start,
            b"_end" => end,
            // Placeholder when no dylib supplied the binder.
            b"dyld_stub_binder" => 0,
            other => bail!(
                "No address rule for synthetic symbol {}",
                String::from_utf8_lossy(other)
            ),
        };
        Ok(address)
    }

    fn layout_boundaries(&self) -> (u64, u64, u64) {
        let mut edata = self.layout.base_address;
        let mut bss_start = 0;
        let mut end = self.layout.base_address;
        for section in &self.layout.sections {
            if section.is_zerofill {
                if bss_start == 0 {
                    bss_start = section.vmaddr;
                }
            } else {
                edata = edata.max(section.vmaddr + section.size);
            }
            end = end.max(section.vmaddr + section.size);
        }
        if bss_start == 0 {
            bss_start = edata;
        }
        (edata, bss_start, end)
    }

    pub(crate) fn atom_address(&self, atom: AtomIndex) -> u64 {
        self.graph.pool.get(atom).address
    }

    fn unique_atom_address(
        &self,
        table: &crate::synthetic::UniqueAtoms,
        key: TargetKey,
        what: &str,
    ) -> Result<u64> {
        table
            .get(key)
            .map(|atom| self.atom_address(atom))
            .ok_or_else(|| anyhow::anyhow!("Missing {what} entry for relocation target"))
    }

    fn is_tls_symbol(&self, symbol: SymbolRef) -> bool {
        let resolved = match symbol.file() {
            None => return false,
            Some(file) => match self.symbol_db.global_for(file, symbol.index()) {
                Some(global) => match self.symbol_db.global(global).definition {
                    Definition::Object { file, sym_index } => (file, sym_index),
                    _ => return false,
                },
                None => (file, symbol.index()),
            },
        };
        self.objects[resolved.0.as_usize()]
            .symbols
            .get(resolved.1 as usize)
            .is_some_and(|sym| sym.flags.contains(SymFlags::TLS))
    }

    /// The thread-pointer-relative offset of a TLS address.
    fn tp_offset(&self, address: u64) -> Result<i64> {
        let Some(tls) = self.layout.tls else {
            bail!("TLS relocation but no TLS sections were laid out");
        };
        Ok(match self.opts.target.cpu_arch {
            // x86-64: the thread pointer sits at the end of the TLS block.
            CpuArch::X86_64 => address as i64 - tls.end_aligned as i64,
            // aarch64: TP points at the TCB; the block starts 16 bytes in.
            _ => address as i64 - tls.start as i64 + 16,
        })
    }

    fn dtp_offset(&self, address: u64) -> Result<i64> {
        let Some(tls) = self.layout.tls else {
            bail!("TLS relocation but no TLS sections were laid out");
        };
        Ok(address as i64 - tls.start as i64)
    }

    /// Applies every relocation of `atom_index` to `out`, the atom's bytes in
    /// the output buffer.
    pub(crate) fn apply_relocations(&self, atom_index: AtomIndex, out: &mut [u8]) -> Result {
        let atom = self.graph.pool.get(atom_index);
        for reloc in &atom.relocs {
            self.apply_one(atom.address, reloc, out)?;
        }
        Ok(())
    }

    fn pc_base(&self, source_addr: u64) -> u64 {
        // Mach-O x86-64 stores displacement addends relative to the end of a
        // 4-byte field; ELF bakes the adjustment into the addend.
        if self.opts.backend == Backend::MachO && self.opts.target.cpu_arch == CpuArch::X86_64 {
            source_addr + 4
        } else {
            source_addr
        }
    }

    fn apply_one(&self, atom_addr: u64, reloc: &Relocation, out: &mut [u8]) -> Result {
        let source_addr = atom_addr + reloc.offset;
        let key = target_key(self.symbol_db, reloc.target);
        let class = classify_target(self.symbol_db, reloc.target);
        let is_external = matches!(class, TargetClass::External { .. });

        match reloc.kind {
            RelocKind::None => Ok(()),
            RelocKind::Absolute => {
                if let Some(subtrahend) = reloc.subtrahend {
                    let value = self.symbol_address(reloc.target)? as i64 + reloc.addend
                        - self.symbol_address(subtrahend)? as i64;
                    return x86_64::write_value(out, reloc.offset, reloc.length, value);
                }
                if is_external {
                    // The loader binds this pointer; the slot stays zero.
                    return Ok(());
                }
                let address = self.symbol_address(reloc.target)?;
                let value = if self.opts.backend == Backend::Elf && self.is_tls_symbol(reloc.target)
                {
                    // GOT slots for initial-exec TLS hold TP offsets.
                    self.tp_offset(address)? + reloc.addend
                } else {
                    address as i64 + reloc.addend
                };
                x86_64::write_value(out, reloc.offset, reloc.length, value)
            }
            RelocKind::Relative => {
                let target = self.symbol_address(reloc.target)?;
                let value =
                    target as i64 + reloc.addend - self.pc_base(source_addr) as i64;
                x86_64::write_value(out, reloc.offset, reloc.length, value)
            }
            RelocKind::Branch => {
                let target = if is_external {
                    self.unique_atom_address(&self.synthetics.stubs, key, "stub")?
                } else {
                    self.symbol_address(reloc.target)?
                };
                match self.opts.target.cpu_arch {
                    CpuArch::Aarch64 => {
                        let target = (target as i64 + reloc.addend) as u64;
                        aarch64::write_branch26(out, reloc.offset, source_addr, target)
                    }
                    CpuArch::X86_64 => {
                        let value =
                            target as i64 + reloc.addend - self.pc_base(source_addr) as i64;
                        x86_64::write_value(out, reloc.offset, 4, value)
                    }
                    CpuArch::Wasm32 => bail!("Native branch relocation in a wasm link"),
                }
            }
            RelocKind::GotLoad => self.apply_got_load(source_addr, reloc, out, key, class),
            RelocKind::Got => {
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                let value = got as i64 + reloc.addend - self.pc_base(source_addr) as i64;
                x86_64::write_value(out, reloc.offset, 4, value)
            }
            RelocKind::PointerToGot => {
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                if reloc.pcrel {
                    let value = got as i64 + reloc.addend - source_addr as i64;
                    x86_64::write_value(out, reloc.offset, 4, value)
                } else {
                    x86_64::write_value(out, reloc.offset, 8, got as i64 + reloc.addend)
                }
            }
            RelocKind::Page21 => {
                let target =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                aarch64::write_page21(out, reloc.offset, source_addr, target)
            }
            RelocKind::PageOff12 => {
                let target =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                aarch64::write_pageoff12(out, reloc.offset, target)
            }
            RelocKind::GotPage21 => {
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                aarch64::write_page21(out, reloc.offset, source_addr, got)
            }
            RelocKind::GotPageOff12 => {
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                aarch64::write_pageoff12(out, reloc.offset, got)
            }
            RelocKind::TlvPage21 | RelocKind::TlvPageOff12 => {
                let target = if is_external {
                    self.unique_atom_address(&self.synthetics.tlv_ptrs, key, "TLV pointer")?
                } else {
                    self.symbol_address(reloc.target)?
                };
                if reloc.kind == RelocKind::TlvPage21 {
                    aarch64::write_page21(out, reloc.offset, source_addr, target)
                } else {
                    aarch64::write_pageoff12(out, reloc.offset, target)
                }
            }
            RelocKind::TlvLoad => {
                let target = if is_external {
                    self.unique_atom_address(&self.synthetics.tlv_ptrs, key, "TLV pointer")?
                } else {
                    self.symbol_address(reloc.target)?
                };
                let value = target as i64 + reloc.addend - self.pc_base(source_addr) as i64;
                x86_64::write_value(out, reloc.offset, 4, value)
            }
            RelocKind::GotTpOff => {
                let bytes_ok = x86_64::gottpoff_rewritable(out, reloc.offset);
                if self.opts.backend == Backend::Elf
                    && self.opts.target.cpu_arch == CpuArch::X86_64
                    && !is_external
                    && bytes_ok
                {
                    // mov from the GOT becomes mov-immediate of the TP
                    // offset; the addend is consumed by the rewrite.
                    x86_64::rewrite_gottpoff(out, reloc.offset)?;
                    let address = self.symbol_address(reloc.target)?;
                    let value = self.tp_offset(address)?;
                    return x86_64::write_value(out, reloc.offset, 4, value);
                }
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                let value = got as i64 + reloc.addend - source_addr as i64;
                x86_64::write_value(out, reloc.offset, 4, value)
            }
            RelocKind::TpOff => {
                let address =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                let value = self.tp_offset(address)?;
                x86_64::write_value(out, reloc.offset, reloc.length, value)
            }
            RelocKind::TpOffHi12 => {
                let address =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                let value = (self.tp_offset(address)? >> 12) & 0xfff;
                write_aarch64_imm12(out, reloc.offset, value as u64)
            }
            RelocKind::TpOffLo12 => {
                let address =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                let value = self.tp_offset(address)? & 0xfff;
                write_aarch64_imm12(out, reloc.offset, value as u64)
            }
            RelocKind::DtpOff => {
                let address =
                    (self.symbol_address(reloc.target)? as i64 + reloc.addend) as u64;
                // Locally-resolved DTPOFF collapses to a TP offset, matching
                // the module-local fast path the rewrites produce.
                let value = if is_external {
                    self.dtp_offset(address)?
                } else {
                    self.tp_offset(address)?
                };
                x86_64::write_value(out, reloc.offset, reloc.length, value)
            }
            RelocKind::Wasm(_) => bail!("Wasm relocation reached the native fixup writer"),
        }
    }

    fn apply_got_load(
        &self,
        source_addr: u64,
        reloc: &Relocation,
        out: &mut [u8],
        key: TargetKey,
        class: TargetClass,
    ) -> Result {
        match self.opts.target.cpu_arch {
            CpuArch::X86_64 => {
                let relaxable = self.opts.backend == Backend::Elf
                    && class == TargetClass::Local
                    && x86_64::gotpcrelx_rewritable(out, reloc.offset);
                if relaxable {
                    // The addend is consumed by the rewrite; the displacement
                    // is measured from the end of the 4-byte field.
                    let rewrite = x86_64::rewrite_gotpcrelx(out, reloc.offset)?;
                    let target = self.symbol_address(reloc.target)?;
                    let value = match rewrite {
                        GotRewrite::Lea => target as i64 - (source_addr + 4) as i64,
                        GotRewrite::Absolute => target as i64,
                        GotRewrite::TpOffImmediate => self.tp_offset(target)?,
                    };
                    return x86_64::write_value(out, reloc.offset, 4, value);
                }
                let got = self.unique_atom_address(&self.synthetics.got, key, "GOT")?;
                let value = got as i64 + reloc.addend - self.pc_base(source_addr) as i64;
                x86_64::write_value(out, reloc.offset, 4, value)
            }
            CpuArch::Aarch64 => bail!("GotLoad is an x86-64 relocation"),
            CpuArch::Wasm32 => bail!("GotLoad in a wasm link"),
        }
    }
}

fn write_aarch64_imm12(out: &mut [u8], offset: u64, value: u64) -> Result {
    let at = offset as usize;
    let insn = u32::from_le_bytes(out[at..at + 4].try_into().unwrap());
    let patched = (insn & !(0xfff << 10)) | (((value & 0xfff) as u32) << 10);
    out[at..at + 4].copy_from_slice(&patched.to_le_bytes());
    Ok(())
}
