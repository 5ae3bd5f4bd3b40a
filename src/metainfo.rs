//! # Metainfo Loader
//!
//! Parses a `.torrent` descriptor into an immutable [`Metainfo`] value and
//! computes the info digest that identifies the swarm.
//!
//! ## Layout
//!
//! A metainfo file is a bencoded dictionary:
//!
//! - **announce**: tracker URL (optionally extended by **announce-list** tiers)
//! - **info**: dictionary describing the content
//!   - **piece length**: bytes per piece
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!   - **name**: suggested file or directory name
//!   - **length** (single-file) or **files** (multi-file: `length` + `path`
//!     component list per file)
//!
//! The info digest is the SHA-1 of the canonical bencoding of the `info`
//! value. Decoding into [`bencode::Value`] and re-encoding reproduces that
//! canonical form exactly, including keys this loader does not otherwise
//! interpret.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::{Error, Result};

const SHA1_HASH_SIZE: usize = 20;

/// One file of the described content, with its length in bytes.
///
/// In single-file mode there is exactly one entry whose path is the torrent
/// name. In multi-file mode paths are relative to the `name` directory.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable description of the content to download.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker URLs in announce order (announce-list tiers flattened).
    trackers: Vec<String>,
    /// SHA-1 of the canonical bencoding of the info dictionary.
    info_hash: [u8; 20],
    /// One 20-byte SHA-1 digest per piece.
    piece_hashes: Vec<[u8; 20]>,
    /// Bytes per piece, except possibly the last.
    piece_length: u64,
    /// Total content length across all files.
    total_length: u64,
    /// Suggested file name (single-file) or root directory name (multi-file).
    name: String,
    /// Ordered file list forming a contiguous logical byte stream.
    files: Vec<FileEntry>,
    /// Whether the descriptor used the `files` key.
    multi_file: bool,
}

impl Metainfo {
    /// Load and parse a metainfo file from disk.
    pub fn load(path: &Path) -> Result<Metainfo> {
        let data = fs::read(path)
            .map_err(|e| Error::Metainfo(format!("could not read {}: {e}", path.display())))?;
        Metainfo::from_bytes(&data)
    }

    /// Parse a metainfo descriptor from its raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Metainfo> {
        let root = bencode::decode(data)?;
        let root = root
            .as_dict()
            .ok_or_else(|| Error::Metainfo("descriptor is not a dictionary".into()))?;

        let trackers = parse_trackers(root)?;

        let info = root
            .get(b"info".as_slice())
            .ok_or_else(|| missing("info"))?;
        let info_dict = info
            .as_dict()
            .ok_or_else(|| Error::Metainfo("info is not a dictionary".into()))?;

        // The digest covers the canonical bencoding of the whole info value,
        // unknown keys included.
        let mut hasher = Sha1::new();
        hasher.update(info.encode());
        let info_hash: [u8; 20] = hasher.finalize().into();

        let piece_length = require_int(info_dict, "piece length")?;
        if piece_length == 0 {
            return Err(Error::Metainfo("piece length is zero".into()));
        }

        let name = String::from_utf8(require_bytes(info_dict, "name")?.to_vec())
            .map_err(|_| Error::Metainfo("name is not valid UTF-8".into()))?;
        if name.is_empty() {
            return Err(Error::Metainfo("name is empty".into()));
        }

        let (files, multi_file) = parse_files(info_dict, &name)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            return Err(Error::Metainfo("declared content is empty".into()));
        }

        let piece_hashes = split_piece_hashes(require_bytes(info_dict, "pieces")?)?;
        let expected_pieces = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(Error::Metainfo(format!(
                "pieces key holds {} digests, content length implies {}",
                piece_hashes.len(),
                expected_pieces
            )));
        }

        Ok(Metainfo {
            trackers,
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            name,
            files,
            multi_file,
        })
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_hash(&self, index: u32) -> &[u8; 20] {
        &self.piece_hashes[index as usize]
    }

    /// Logical length of piece `index`; only the last piece may be short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (end - begin) as u32
    }

    /// Byte offset of piece `index` within the logical content stream.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }
}

fn missing(key: &str) -> Error {
    Error::Metainfo(format!("missing required key '{key}'"))
}

fn require_bytes<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &str) -> Result<&'a [u8]> {
    dict.get(key.as_bytes())
        .ok_or_else(|| missing(key))?
        .as_bytes()
        .ok_or_else(|| Error::Metainfo(format!("'{key}' is not a byte string")))
}

fn require_int(dict: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<u64> {
    let n = dict
        .get(key.as_bytes())
        .ok_or_else(|| missing(key))?
        .as_int()
        .ok_or_else(|| Error::Metainfo(format!("'{key}' is not an integer")))?;
    u64::try_from(n).map_err(|_| Error::Metainfo(format!("'{key}' is negative")))
}

fn parse_trackers(root: &BTreeMap<Vec<u8>, Value>) -> Result<Vec<String>> {
    let mut trackers = Vec::new();

    // announce-list tiers take precedence, flattened in declared order
    if let Some(tiers) = root.get(b"announce-list".as_slice()).and_then(Value::as_list) {
        for tier in tiers {
            for url in tier.as_list().unwrap_or(&[]) {
                if let Some(bytes) = url.as_bytes() {
                    if let Ok(url) = String::from_utf8(bytes.to_vec()) {
                        if !trackers.contains(&url) {
                            trackers.push(url);
                        }
                    }
                }
            }
        }
    }

    if trackers.is_empty() {
        let announce = require_bytes(root, "announce")?;
        let url = String::from_utf8(announce.to_vec())
            .map_err(|_| Error::Metainfo("announce is not valid UTF-8".into()))?;
        trackers.push(url);
    }

    Ok(trackers)
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces.is_empty() || pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(Error::Metainfo(format!(
            "pieces key length {} is not a positive multiple of {SHA1_HASH_SIZE}",
            pieces.len()
        )));
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_files(
    info: &BTreeMap<Vec<u8>, Value>,
    name: &str,
) -> Result<(Vec<FileEntry>, bool)> {
    match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
        (Some(_), None) => {
            let length = require_int(info, "length")?;
            let entry = FileEntry {
                path: PathBuf::from(sanitize_component(name)?),
                length,
            };
            Ok((vec![entry], false))
        }
        (None, Some(files)) => {
            let files = files
                .as_list()
                .ok_or_else(|| Error::Metainfo("'files' is not a list".into()))?;
            if files.is_empty() {
                return Err(Error::Metainfo("'files' list is empty".into()));
            }

            let mut entries = Vec::with_capacity(files.len());
            for file in files {
                let dict = file
                    .as_dict()
                    .ok_or_else(|| Error::Metainfo("file entry is not a dictionary".into()))?;
                let length = require_int(dict, "length")?;
                let components = dict
                    .get(b"path".as_slice())
                    .ok_or_else(|| missing("path"))?
                    .as_list()
                    .ok_or_else(|| Error::Metainfo("file path is not a list".into()))?;
                if components.is_empty() {
                    return Err(Error::Metainfo("file path is empty".into()));
                }

                let mut path = PathBuf::new();
                for component in components {
                    let bytes = component
                        .as_bytes()
                        .ok_or_else(|| Error::Metainfo("path component is not a string".into()))?;
                    let text = std::str::from_utf8(bytes)
                        .map_err(|_| Error::Metainfo("path component is not UTF-8".into()))?;
                    path.push(sanitize_component(text)?);
                }
                entries.push(FileEntry { path, length });
            }
            Ok((entries, true))
        }
        (Some(_), Some(_)) => Err(Error::Metainfo(
            "info holds both 'length' and 'files'".into(),
        )),
        (None, None) => Err(Error::Metainfo(
            "info holds neither 'length' nor 'files'".into(),
        )),
    }
}

/// Reject path components that would escape the output directory.
fn sanitize_component(text: &str) -> Result<&str> {
    let path = Path::new(text);
    let is_plain = path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)));
    if text.is_empty() || !is_plain {
        return Err(Error::Metainfo(format!(
            "unsafe path component {text:?}"
        )));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bencoded single-file descriptor: two 4-byte "pieces" digests are fake,
    /// but structurally valid.
    fn single_file_torrent() -> Vec<u8> {
        let hashes: Vec<u8> = (0u8..40).collect();
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce16:http://tracker/a");
        data.extend_from_slice(b"4:infod6:lengthi40000e4:name8:demo.bin12:piece lengthi32768e6:pieces40:");
        data.extend_from_slice(&hashes);
        data.extend_from_slice(b"ee");
        data
    }

    fn multi_file_torrent() -> Vec<u8> {
        let hashes: Vec<u8> = (0u8..80).collect();
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce16:http://tracker/a");
        data.extend_from_slice(b"4:infod5:filesl");
        data.extend_from_slice(b"d6:lengthi10000e4:pathl5:a.bineed6:lengthi5000e4:pathl3:sub5:b.bineee");
        data.extend_from_slice(b"4:name4:demo12:piece lengthi4096e6:pieces80:");
        data.extend_from_slice(&hashes);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn parses_single_file_descriptor() {
        let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(meta.trackers(), ["http://tracker/a".to_string()]);
        assert_eq!(meta.name(), "demo.bin");
        assert_eq!(meta.total_length(), 40000);
        assert_eq!(meta.piece_length(), 32768);
        assert_eq!(meta.num_pieces(), 2);
        assert!(!meta.is_multi_file());
        assert_eq!(meta.files().len(), 1);
        assert_eq!(meta.files()[0].length, 40000);
    }

    #[test]
    fn last_piece_is_short() {
        let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(meta.piece_len(0), 32768);
        assert_eq!(meta.piece_len(1), 40000 - 32768);
        assert_eq!(meta.piece_offset(1), 32768);
    }

    #[test]
    fn parses_multi_file_descriptor() {
        let meta = Metainfo::from_bytes(&multi_file_torrent()).unwrap();
        assert!(meta.is_multi_file());
        assert_eq!(meta.total_length(), 15000);
        assert_eq!(meta.num_pieces(), 4);
        assert_eq!(meta.files()[0].path, PathBuf::from("a.bin"));
        assert_eq!(meta.files()[1].path, PathBuf::from("sub").join("b.bin"));
    }

    #[test]
    fn info_digest_covers_canonical_info_bytes() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        // recompute independently from the raw info slice of the fixture
        let start = data.windows(7).position(|w| w == b"4:infod").unwrap() + 6;
        let end = data.len() - 1; // trailing 'e' of the root dict
        let mut hasher = Sha1::new();
        hasher.update(&data[start..end]);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(meta.info_hash(), &expected);
    }

    #[test]
    fn rejects_inconsistent_piece_digests() {
        // 40000 bytes at 32768 per piece needs 2 digests, give it 3
        let hashes: Vec<u8> = (0u8..60).collect();
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce16:http://tracker/a");
        data.extend_from_slice(b"4:infod6:lengthi40000e4:name8:demo.bin12:piece lengthi32768e6:pieces60:");
        data.extend_from_slice(&hashes);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&data).is_err());
    }

    #[test]
    fn rejects_missing_keys_and_traversal() {
        assert!(Metainfo::from_bytes(b"d4:infodee").is_err());
        // path component ".." must be refused
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce16:http://tracker/a");
        data.extend_from_slice(b"4:infod5:filesl");
        data.extend_from_slice(b"d6:lengthi100e4:pathl2:..5:a.bineee");
        data.extend_from_slice(b"4:name4:demo12:piece lengthi4096e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&data).is_err());
    }
}
