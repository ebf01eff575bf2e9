//! Ad-hoc code signature: a SuperBlob holding one CodeDirectory with SHA-256
//! page hashes over everything before the signature itself. No certificates
//! or CMS involved; this is the form the aarch64 kernel requires of every
//! binary, which the toolchain normally leaves to `codesign --sign -`.
//! Blob fields are big-endian; constants are defined locally because the
//! `object` crate doesn't model signature blobs.

use sha2::Digest as _;
use sha2::Sha256;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;
const CS_ADHOC: u32 = 0x0000_0002;
const CS_HASHTYPE_SHA256: u8 = 2;
const CS_SHA256_LEN: usize = 32;
const CS_PAGE_SIZE_LOG2: u8 = 12;
const CS_PAGE_SIZE: usize = 1 << CS_PAGE_SIZE_LOG2;
/// execSegFlags bit marking the main executable.
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x2_0400;

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// The size the signature blob will occupy, needed to size the output file
/// before its content exists.
pub(crate) fn signature_size(code_limit: u64, identifier: &str) -> u64 {
    let n_slots = code_limit.div_ceil(CS_PAGE_SIZE as u64) as usize;
    let cd_size = 88 + identifier.len() + 1 + n_slots * CS_SHA256_LEN;
    (12 + 8 + cd_size) as u64
}

/// Builds the complete signature over `signed_data` (the file up to the
/// signature's own offset).
pub(crate) fn build_signature(
    signed_data: &[u8],
    identifier: &str,
    text_segment_size: u64,
    is_exe: bool,
) -> Vec<u8> {
    let code_limit = signed_data.len();
    let n_slots = code_limit.div_ceil(CS_PAGE_SIZE);
    let ident_bytes = identifier.as_bytes();

    // CodeDirectory layout: fixed header (88 bytes at this version), then
    // the identifier, then the hash array.
    let ident_offset = 88u32;
    let hash_offset = ident_offset + ident_bytes.len() as u32 + 1;
    let cd_length = hash_offset as usize + n_slots * CS_SHA256_LEN;

    let mut cd = Vec::with_capacity(cd_length);
    push_u32(&mut cd, CSMAGIC_CODEDIRECTORY);
    push_u32(&mut cd, cd_length as u32);
    push_u32(&mut cd, CODEDIRECTORY_VERSION_EXECSEG);
    push_u32(&mut cd, CS_ADHOC);
    push_u32(&mut cd, hash_offset);
    push_u32(&mut cd, ident_offset);
    push_u32(&mut cd, 0); // nSpecialSlots
    push_u32(&mut cd, n_slots as u32);
    push_u32(&mut cd, code_limit as u32);
    cd.push(CS_SHA256_LEN as u8);
    cd.push(CS_HASHTYPE_SHA256);
    cd.push(0); // platform
    cd.push(CS_PAGE_SIZE_LOG2);
    push_u32(&mut cd, 0); // spare2
    push_u32(&mut cd, 0); // scatterOffset
    push_u32(&mut cd, 0); // teamOffset
    push_u32(&mut cd, 0); // spare3
    push_u64(&mut cd, 0); // codeLimit64
    push_u64(&mut cd, 0); // execSegBase
    push_u64(&mut cd, text_segment_size);
    push_u64(&mut cd, if is_exe { CS_EXECSEG_MAIN_BINARY } else { 0 });
    debug_assert_eq!(cd.len(), ident_offset as usize);

    cd.extend_from_slice(ident_bytes);
    cd.push(0);
    for page in signed_data.chunks(CS_PAGE_SIZE) {
        cd.extend_from_slice(&Sha256::digest(page));
    }
    debug_assert_eq!(cd.len(), cd_length);

    let total = 12 + 8 + cd.len();
    let mut out = Vec::with_capacity(total);
    push_u32(&mut out, CSMAGIC_EMBEDDED_SIGNATURE);
    push_u32(&mut out, total as u32);
    push_u32(&mut out, 1); // one blob
    push_u32(&mut out, CSSLOT_CODEDIRECTORY);
    push_u32(&mut out, 20); // blob offset: superblob header + one index
    out.extend_from_slice(&cd);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_shape() {
        let data = vec![0xABu8; CS_PAGE_SIZE + 100];
        let sig = build_signature(&data, "a.out", 0x4000, true);

        assert_eq!(&sig[0..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        let declared_len = u32::from_be_bytes(sig[4..8].try_into().unwrap());
        assert_eq!(declared_len as usize, sig.len());
        assert_eq!(sig.len() as u64, signature_size(data.len() as u64, "a.out"));

        // Two pages hashed.
        let cd = &sig[20..];
        assert_eq!(&cd[0..4], &CSMAGIC_CODEDIRECTORY.to_be_bytes());
        let n_slots = u32::from_be_bytes(cd[28..32].try_into().unwrap());
        assert_eq!(n_slots, 2);

        // The first page hash matches a direct digest.
        let hash_offset = u32::from_be_bytes(cd[16..20].try_into().unwrap()) as usize;
        let first_hash = &cd[hash_offset..hash_offset + CS_SHA256_LEN];
        assert_eq!(first_hash, Sha256::digest(&data[..CS_PAGE_SIZE]).as_slice());
    }

    #[test]
    fn test_identifier_embedded() {
        let sig = build_signature(&[0u8; 64], "libfoo.dylib", 0x4000, false);
        assert!(sig.windows(12).any(|w| w == b"libfoo.dylib"));
    }
}
