//! Reading of `ar` archives, including their symbol tables. The resolver
//! pulls members in on demand, so unlike the entry data (which we only slice),
//! the table of contents is parsed eagerly into a `symbol name → member
//! offset` map. Both the GNU (`/`) and BSD (`__.SYMDEF`) ranlib formats are
//! handled, the latter in its 32- and 64-bit variants.

use crate::error::LinkError;
use crate::error::Result;
use anyhow::Context as _;
use bytemuck::Pod;
use bytemuck::Zeroable;

#[derive(Debug)]
pub(crate) struct Archive<'data> {
    data: &'data [u8],

    /// `symbol name → offset of the defining member's entry header`.
    /// A name may be defined by more than one member; the first wins, which
    /// matches the search order every other linker uses.
    toc: Vec<(&'data [u8], usize)>,

    extended_filenames: Option<&'data [u8]>,
}

pub(crate) struct ArchiveMember<'data> {
    pub(crate) name: Vec<u8>,
    pub(crate) data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = size_of::<EntryHeader>();

impl<'data> Archive<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<Archive<'data>> {
        let body = data
            .strip_prefix(&object::archive::MAGIC)
            .ok_or(LinkError::NotArchive)?;

        let mut archive = Archive {
            data,
            toc: Vec::new(),
            extended_filenames: None,
        };

        let mut remaining: &'data [u8] = body;
        while !remaining.is_empty() {
            if remaining.len() < HEADER_SIZE {
                // Trailing padding.
                if remaining.iter().all(|&b| b == b'\n' || b == b' ') {
                    break;
                }
                return Err(LinkError::MalformedArchive.into());
            }
            let (header_bytes, rest) = remaining.split_at(HEADER_SIZE);
            let header: &'data EntryHeader = bytemuck::from_bytes(header_bytes);
            let size = parse_decimal(&header.size).ok_or(LinkError::MalformedArchive)?;
            if rest.len() < size {
                return Err(LinkError::MalformedArchive.into());
            }
            let entry_data: &'data [u8] = &rest[..size];
            let ident: &'data str = std::str::from_utf8(&header.ident)
                .map_err(|_| LinkError::MalformedArchive)?
                .trim_end();

            match ident {
                "/" => archive.parse_gnu_symtab(entry_data)?,
                "//" => archive.extended_filenames = Some(entry_data),
                _ => {
                    let (name, member_data) = resolve_bsd_name(ident, entry_data)?;
                    if name == b"__.SYMDEF" || name == b"__.SYMDEF SORTED" {
                        archive.parse_bsd_symdef(member_data, false)?;
                    } else if name == b"__.SYMDEF_64" || name == b"__.SYMDEF_64 SORTED" {
                        archive.parse_bsd_symdef(member_data, true)?;
                    }
                }
            }

            let padded = size.next_multiple_of(2).min(rest.len());
            remaining = &rest[padded..];
        }

        Ok(archive)
    }

    /// GNU format: u32be count, count u32be header offsets, NUL-terminated
    /// names in the same order.
    fn parse_gnu_symtab(&mut self, data: &'data [u8]) -> Result {
        if data.len() < 4 {
            return Err(LinkError::MalformedArchive.into());
        }
        let count = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        let offsets_end = 4 + count * 4;
        if data.len() < offsets_end {
            return Err(LinkError::MalformedArchive.into());
        }
        let mut names = &data[offsets_end..];
        for i in 0..count {
            let at = 4 + i * 4;
            let member = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
            let end = memchr::memchr(0, names).ok_or(LinkError::MalformedArchive)?;
            self.toc.push((&names[..end], member));
            names = &names[end + 1..];
        }
        Ok(())
    }

    /// BSD format: ranlib array of (string offset, member offset) pairs
    /// followed by the string table, each prefixed with its byte length.
    fn parse_bsd_symdef(&mut self, data: &'data [u8], is_64: bool) -> Result {
        let word = if is_64 { 8 } else { 4 };
        let read_word = |bytes: &[u8]| -> Option<usize> {
            if is_64 {
                Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?) as usize)
            } else {
                Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?) as usize)
            }
        };
        let ranlib_size = read_word(data).ok_or(LinkError::MalformedArchive)?;
        let ranlibs = data
            .get(word..word + ranlib_size)
            .ok_or(LinkError::MalformedArchive)?;
        let strtab_at = word + ranlib_size;
        let strtab_size = read_word(&data[strtab_at..]).ok_or(LinkError::MalformedArchive)?;
        let strtab = data
            .get(strtab_at + word..strtab_at + word + strtab_size)
            .ok_or(LinkError::MalformedArchive)?;

        for pair in ranlibs.chunks_exact(word * 2) {
            let str_off = read_word(pair).ok_or(LinkError::MalformedArchive)?;
            let member = read_word(&pair[word..]).ok_or(LinkError::MalformedArchive)?;
            let rest = strtab.get(str_off..).ok_or(LinkError::MalformedArchive)?;
            let end = memchr::memchr(0, rest).unwrap_or(rest.len());
            self.toc.push((&rest[..end], member));
        }
        Ok(())
    }

    pub(crate) fn toc(&self) -> &[(&'data [u8], usize)] {
        &self.toc
    }

    pub(crate) fn has_symbols(&self) -> bool {
        !self.toc.is_empty()
    }

    /// Slices the member whose entry header is at `offset` out of the archive.
    pub(crate) fn member_at(&self, offset: usize) -> Result<ArchiveMember<'data>> {
        let header_bytes = self
            .data
            .get(offset..offset + HEADER_SIZE)
            .ok_or(LinkError::MalformedArchive)?;
        let header: &EntryHeader = bytemuck::from_bytes(header_bytes);
        if header.end != *b"`\n" {
            return Err(LinkError::MalformedArchive.into());
        }
        let size = parse_decimal(&header.size).ok_or(LinkError::MalformedArchive)?;
        let entry_data = self
            .data
            .get(offset + HEADER_SIZE..offset + HEADER_SIZE + size)
            .ok_or(LinkError::MalformedArchive)?;
        let ident = std::str::from_utf8(&header.ident)
            .map_err(|_| LinkError::MalformedArchive)?
            .trim_end();

        if let Some(rest) = ident.strip_prefix('/') {
            // GNU long name: index into the extended filenames member.
            if let Ok(name_offset) = rest.parse::<usize>() {
                let filenames = self
                    .extended_filenames
                    .context("archive long name without `//` member")?;
                let rest = filenames
                    .get(name_offset..)
                    .ok_or(LinkError::MalformedArchive)?;
                let end = memchr::memchr(b'\n', rest).unwrap_or(rest.len());
                let name = rest[..end].strip_suffix(b"/").unwrap_or(&rest[..end]);
                return Ok(ArchiveMember {
                    name: name.to_vec(),
                    data: entry_data,
                });
            }
        }

        let (name, data) = resolve_bsd_name(ident, entry_data)?;
        Ok(ArchiveMember {
            name: name.to_vec(),
            data,
        })
    }

    /// Every member in archive order, for `must_link` archives.
    pub(crate) fn all_member_offsets(&self) -> Result<Vec<usize>> {
        let mut offsets = Vec::new();
        let mut offset = object::archive::MAGIC.len();
        while offset + HEADER_SIZE <= self.data.len() {
            let header: &EntryHeader =
                bytemuck::from_bytes(&self.data[offset..offset + HEADER_SIZE]);
            if header.end != *b"`\n" {
                break;
            }
            let size = parse_decimal(&header.size).ok_or(LinkError::MalformedArchive)?;
            let ident = std::str::from_utf8(&header.ident)
                .map_err(|_| LinkError::MalformedArchive)?
                .trim_end();
            let is_meta = matches!(ident, "/" | "//")
                || self
                    .member_at(offset)
                    .map(|m| m.name.starts_with(b"__.SYMDEF"))
                    .unwrap_or(false);
            if !is_meta {
                offsets.push(offset);
            }
            offset += HEADER_SIZE + size.next_multiple_of(2);
        }
        Ok(offsets)
    }
}

/// BSD archives store long names inline: ident `#1/<len>` means the first
/// `<len>` bytes of the entry data are the (NUL-padded) name.
fn resolve_bsd_name<'data>(
    ident: &'data str,
    entry_data: &'data [u8],
) -> Result<(&'data [u8], &'data [u8])> {
    if let Some(len) = ident.strip_prefix("#1/") {
        let len: usize = len.trim().parse().map_err(|_| LinkError::MalformedArchive)?;
        if entry_data.len() < len {
            return Err(LinkError::MalformedArchive.into());
        }
        let (name, data) = entry_data.split_at(len);
        let end = memchr::memchr(0, name).unwrap_or(name.len());
        Ok((&name[..end], data))
    } else {
        // Short names may carry a trailing '/' in GNU archives.
        let name = ident.strip_suffix('/').unwrap_or(ident);
        Ok((name.as_bytes(), entry_data))
    }
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(bytes).ok()?.trim_end();
    if text.is_empty() {
        return Some(0);
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ident: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    fn gnu_archive_with_symtab() -> Vec<u8> {
        // One member `m.o` at a known offset, with one symbol `foo`.
        let mut symtab = Vec::new();
        symtab.extend_from_slice(&1u32.to_be_bytes());
        // Offset of the member header gets patched below.
        symtab.extend_from_slice(&0u32.to_be_bytes());
        symtab.extend_from_slice(b"foo\0");

        let mut data = Vec::new();
        data.extend_from_slice(&object::archive::MAGIC);
        data.extend_from_slice(&entry("/", &symtab));
        let member_offset = data.len() as u32;
        data.extend_from_slice(&entry("m.o/", b"OBJECTBYTES"));

        // Patch the member offset into the symtab.
        let patch_at = object::archive::MAGIC.len() + HEADER_SIZE + 4;
        data[patch_at..patch_at + 4].copy_from_slice(&member_offset.to_be_bytes());
        data
    }

    #[test]
    fn test_gnu_toc_and_member_extraction() {
        let bytes = gnu_archive_with_symtab();
        let archive = Archive::parse(&bytes).unwrap();
        assert!(archive.has_symbols());
        assert_eq!(archive.toc().len(), 1);
        let (name, offset) = archive.toc()[0];
        assert_eq!(name, b"foo");
        let member = archive.member_at(offset).unwrap();
        assert_eq!(member.name, b"m.o");
        assert_eq!(member.data, b"OBJECTBYTES");
    }

    #[test]
    fn test_bsd_inline_name() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"longname.o\0\0");
        payload.extend_from_slice(b"DATA");
        let (name, data) = resolve_bsd_name("#1/12", &payload).unwrap();
        assert_eq!(name, b"longname.o");
        assert_eq!(data, b"DATA");
    }

    #[test]
    fn test_not_an_archive() {
        let err = Archive::parse(b"\x7fELF...").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::NotArchive)
        ));
    }

    #[test]
    fn test_truncated_member_is_malformed() {
        let mut bytes = gnu_archive_with_symtab();
        bytes.truncate(bytes.len() - 6);
        assert!(Archive::parse(&bytes).is_err());
    }
}
