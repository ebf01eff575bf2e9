//! Code for identifying what sort of file we're dealing with based on the
//! bytes of the file. Identification is purely magic-based; the per-format
//! parsers do the real validation afterwards.

use crate::args::CpuArch;
use crate::error::LinkError;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;
use object::macho;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    MachOObject,
    MachODylib,
    /// A fat/universal container. The caller selects the matching slice and
    /// re-identifies.
    FatMachO,
    TextStub,
    WasmObject,
    Archive,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            const HEADER_LEN: usize = size_of::<object::elf::FileHeader64<LittleEndian>>();
            if bytes.len() < HEADER_LEN {
                bail!("Invalid ELF file");
            }
            let header: &object::elf::FileHeader64<LittleEndian> =
                object::from_bytes(&bytes[..HEADER_LEN]).map_err(|()| LinkError::NotObject)?.0;
            if header.e_ident.class != object::elf::ELFCLASS64 {
                bail!("Only 64 bit ELF is currently supported");
            }
            if header.e_ident.data != object::elf::ELFDATA2LSB {
                bail!("Only little endian is currently supported");
            }
            match header.e_type.get(LittleEndian) {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            }
        } else if bytes.len() >= 4 {
            let magic = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            let magic_be = u32::from_be_bytes(bytes[..4].try_into().unwrap());
            if magic == macho::MH_MAGIC_64 {
                identify_macho(bytes)
            } else if magic_be == macho::FAT_MAGIC || magic_be == macho::FAT_MAGIC_64 {
                Ok(FileKind::FatMachO)
            } else if bytes.starts_with(b"\0asm") {
                Ok(FileKind::WasmObject)
            } else if bytes.starts_with(b"---") {
                Ok(FileKind::TextStub)
            } else {
                bail!("Couldn't identify file type");
            }
        } else {
            bail!("Couldn't identify file type");
        }
    }
}

fn identify_macho(bytes: &[u8]) -> Result<FileKind> {
    const HEADER_LEN: usize = size_of::<macho::MachHeader64<LittleEndian>>();
    if bytes.len() < HEADER_LEN {
        bail!("Invalid Mach-O file");
    }
    let header: &macho::MachHeader64<LittleEndian> =
        object::from_bytes(&bytes[..HEADER_LEN]).map_err(|()| LinkError::NotObject)?.0;
    match header.filetype.get(LittleEndian) {
        macho::MH_OBJECT => Ok(FileKind::MachOObject),
        macho::MH_DYLIB | macho::MH_DYLIB_STUB => Ok(FileKind::MachODylib),
        t => bail!("Unsupported Mach-O file type {t}"),
    }
}

/// Fat/universal containers hold one slice per architecture. Returns the byte
/// range of the slice matching `arch`, or `MismatchedCpuArchitecture` if the
/// container has no such slice.
pub(crate) fn fat_slice_for_arch(bytes: &[u8], arch: CpuArch) -> Result<&[u8]> {
    use object::BigEndian;

    let wanted_cpu_type = match arch {
        CpuArch::X86_64 => macho::CPU_TYPE_X86_64,
        CpuArch::Aarch64 => macho::CPU_TYPE_ARM64,
        CpuArch::Wasm32 => return Err(LinkError::MismatchedCpuArchitecture.into()),
    };

    let header: &macho::FatHeader = object::from_bytes(
        bytes
            .get(..size_of::<macho::FatHeader>())
            .ok_or(LinkError::NotObject)?,
    )
    .map_err(|()| LinkError::NotObject)?
    .0;

    let nfat = header.nfat_arch.get(BigEndian) as usize;
    let is_64 = header.magic.get(BigEndian) == macho::FAT_MAGIC_64;
    let arch_bytes = &bytes[size_of::<macho::FatHeader>()..];

    for i in 0..nfat {
        let (cpu_type, offset, size) = if is_64 {
            let entry: &macho::FatArch64 = object::from_bytes(
                arch_bytes
                    .get(i * size_of::<macho::FatArch64>()..)
                    .and_then(|b| b.get(..size_of::<macho::FatArch64>()))
                    .ok_or(LinkError::NotObject)?,
            )
            .map_err(|()| LinkError::NotObject)?
            .0;
            (
                entry.cputype.get(BigEndian),
                entry.offset.get(BigEndian),
                entry.size.get(BigEndian),
            )
        } else {
            let entry: &macho::FatArch32 = object::from_bytes(
                arch_bytes
                    .get(i * size_of::<macho::FatArch32>()..)
                    .and_then(|b| b.get(..size_of::<macho::FatArch32>()))
                    .ok_or(LinkError::NotObject)?,
            )
            .map_err(|()| LinkError::NotObject)?
            .0;
            (
                entry.cputype.get(BigEndian),
                u64::from(entry.offset.get(BigEndian)),
                u64::from(entry.size.get(BigEndian)),
            )
        };
        if cpu_type == wanted_cpu_type {
            return bytes
                .get(offset as usize..(offset + size) as usize)
                .ok_or_else(|| LinkError::NotObject.into());
        }
    }

    Err(LinkError::MismatchedCpuArchitecture.into())
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF dynamic",
            FileKind::MachOObject => "Mach-O object",
            FileKind::MachODylib => "Mach-O dylib",
            FileKind::FatMachO => "fat Mach-O",
            FileKind::TextStub => "text stub",
            FileKind::WasmObject => "wasm object",
            FileKind::Archive => "archive",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_archive() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
    }

    #[test]
    fn test_identify_wasm() {
        assert_eq!(
            FileKind::identify_bytes(b"\0asm\x01\0\0\0").unwrap(),
            FileKind::WasmObject
        );
    }

    #[test]
    fn test_identify_text_stub() {
        assert_eq!(
            FileKind::identify_bytes(b"--- !tapi-tbd\ntbd-version: 4\n").unwrap(),
            FileKind::TextStub
        );
    }

    #[test]
    fn test_unknown_is_fatal() {
        assert!(FileKind::identify_bytes(b"\x01\x02\x03\x04garbage").is_err());
    }
}
