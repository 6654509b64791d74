//! `{class}.idx` files.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! magic "PSVX" | version u32 | dim u32 | count u64
//! count × (id i64 | dim × f32)
//! sha256 of everything above (32 bytes)
//! ```
//!
//! A dimension of 0 means the index has never seen a vector.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use super::flat::FlatIndex;
use super::IndexError;

const MAGIC: &[u8; 4] = b"PSVX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const CHECKSUM_LEN: usize = 32;

pub fn encode(index: &FlatIndex) -> Vec<u8> {
    let dim = index.dim().unwrap_or(0);
    let mut buf = Vec::with_capacity(HEADER_LEN + index.len() * (8 + dim * 4) + CHECKSUM_LEN);

    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(dim as u32).to_le_bytes());
    buf.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for (id, vector) in index.entries() {
        buf.extend_from_slice(&id.to_le_bytes());
        for value in vector {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    let checksum = Sha256::digest(&buf);
    buf.extend_from_slice(&checksum);
    buf
}

pub fn decode(bytes: &[u8], path: &Path) -> Result<FlatIndex, IndexError> {
    let corrupt = |reason: &str| IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(corrupt("file is truncated"));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(corrupt("checksum mismatch"));
    }
    if &body[..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }

    let read_u32 = |at: usize| u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
    let version = read_u32(4);
    if version != VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let dim = read_u32(8) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&body[12..20]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    let entry_len = 8 + dim * 4;
    let expected = count
        .checked_mul(entry_len)
        .and_then(|n| n.checked_add(HEADER_LEN));
    if expected != Some(body.len()) {
        return Err(corrupt("entry count does not match file size"));
    }
    if dim == 0 && count > 0 {
        return Err(corrupt("entries without a dimension"));
    }

    let mut entries = BTreeMap::new();
    for chunk in body[HEADER_LEN..].chunks_exact(entry_len) {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&chunk[..8]);
        let vector = chunk[8..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        entries.insert(i64::from_le_bytes(id_bytes), vector);
    }
    if entries.len() != count {
        return Err(corrupt("duplicate entry ids"));
    }

    Ok(FlatIndex::from_parts((dim > 0).then_some(dim), entries))
}

/// Load an index file. A missing file is an empty index.
pub fn read(path: &Path) -> Result<FlatIndex, IndexError> {
    match fs::read(path) {
        Ok(bytes) => decode(&bytes, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FlatIndex::new()),
        Err(source) => Err(IndexError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write through a temp file and rename, so readers never see a partial file
pub fn write(path: &Path, index: &FlatIndex) -> Result<(), IndexError> {
    let io_err = |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = path.with_extension("idx.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&encode(index)).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatIndex {
        let mut index = FlatIndex::new();
        index.insert(4, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(-2, vec![0.0, 3.0, 4.0]).unwrap();
        index
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.idx");
        write(&path, &sample()).unwrap();

        assert_eq!(read(&path).unwrap(), sample());
        assert!(!path.with_extension("idx.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = read(&dir.path().join("pet.idx")).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dim(), None);
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut bytes = encode(&sample());
        bytes[HEADER_LEN + 3] ^= 0x40;
        let err = decode(&bytes, Path::new("face.idx")).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let bytes = encode(&sample());
        assert!(decode(&bytes[..10], Path::new("x.idx")).is_err());
        assert!(decode(&bytes[..bytes.len() - 1], Path::new("x.idx")).is_err());
    }

    #[test]
    fn test_empty_index_keeps_no_dimension() {
        let decoded = decode(&encode(&FlatIndex::new()), Path::new("x.idx")).unwrap();
        assert_eq!(decoded.dim(), None);
    }
}
