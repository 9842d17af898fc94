//! Bencode parsing, info hash calculation and canonical re-encoding.

use std::collections::BTreeMap;
use std::ops::Range;

use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentMetadata};
use crate::torrent::{InfoHash, TorrentError};

pub(super) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;
pub(super) type BytesResult<'a> = Result<&'a [u8], TorrentError>;
pub(super) type FilesResult = ParseResult<(Vec<TorrentFile>, u64)>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parses bencoded torrent bytes into metadata.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - malformed bencode, missing fields or
    ///   a piece count that does not cover the total length
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_metadata_from_dict(dict, torrent_bytes)
        } else {
            Err(invalid("Root element must be dictionary"))
        }
    }

    fn extract_metadata_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentMetadata> {
        let info_dict = dict
            .get(b"info".as_slice())
            .ok_or_else(|| invalid("Missing 'info' field"))?;

        let bencode_rs::Value::Dictionary(info_dict_map) = info_dict else {
            return Err(invalid("Info field must be dictionary"));
        };

        let info_hash = Self::calculate_info_hash(original_data)?;

        let name = Self::extract_bytes_as_string(info_dict_map, b"name")?;
        let piece_length = Self::extract_integer(info_dict_map, b"piece length")?;
        if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
            return Err(invalid(format!("Invalid piece length {piece_length}")));
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = Self::extract_bytes(info_dict_map, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = if let Ok(length) =
            Self::extract_integer(info_dict_map, b"length")
        {
            if length < 0 {
                return Err(invalid("Negative file length"));
            }
            let files = vec![TorrentFile {
                path: vec![name.clone()],
                length: length as u64,
            }];
            (files, length as u64)
        } else {
            match info_dict_map.get(b"files".as_slice()) {
                Some(bencode_rs::Value::List(files_list)) => Self::extract_files_info(files_list)?,
                Some(_) => return Err(invalid("Invalid files structure")),
                None => return Err(invalid("Missing 'files' or 'length' field")),
            }
        };

        let piece_count = piece_hashes.len() as u64;
        let piece_length_u64 = u64::from(piece_length);
        if piece_count == 0
            || piece_count * piece_length_u64 < total_length
            || total_length <= (piece_count - 1) * piece_length_u64
        {
            return Err(invalid(format!(
                "{piece_count} pieces of {piece_length} bytes do not cover {total_length} bytes"
            )));
        }

        let private = matches!(
            info_dict_map.get(b"private".as_slice()),
            Some(bencode_rs::Value::Integer(1))
        );
        let announce_urls = Self::extract_announce_urls(dict);

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_urls,
            private,
        })
    }

    /// SHA-1 over the exact bytes of the top-level `info` value.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - no `info` key or malformed bencode
    pub fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
        let info_bytes = Self::info_bytes(original_data)?;
        let digest = Sha1::digest(info_bytes);
        InfoHash::from_slice(&digest)
    }

    /// Raw bytes of the top-level `info` dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - no `info` key or malformed bencode
    pub fn info_bytes(data: &[u8]) -> Result<&[u8], TorrentError> {
        let span = Self::dictionary_value_span(data, b"info")?
            .ok_or_else(|| invalid("Could not find info dictionary in data"))?;
        Ok(&data[span])
    }

    /// Byte range of the value stored under `key` in the root dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - root is not a well-formed dictionary
    pub fn dictionary_value_span(
        data: &[u8],
        key: &[u8],
    ) -> Result<Option<Range<usize>>, TorrentError> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }
        let mut pos = 1;
        loop {
            match data.get(pos) {
                None => return Err(invalid("Incomplete bencode dictionary")),
                Some(b'e') => return Ok(None),
                Some(b'0'..=b'9') => {}
                Some(_) => return Err(invalid("Dictionary key must be a string")),
            }
            let key_len = Self::find_element_end(&data[pos..])?;
            let colon = data[pos..pos + key_len]
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| invalid("Invalid string format"))?;
            let current_key = &data[pos + colon + 1..pos + key_len];
            pos += key_len;

            let value_len = Self::find_element_end(&data[pos..])?;
            if current_key == key {
                return Ok(Some(pos..pos + value_len));
            }
            pos += value_len;
        }
    }

    /// Length of the dictionary starting at `data[0]`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - not a dictionary or malformed
    pub fn find_bencode_dictionary_end(data: &[u8]) -> Result<usize, TorrentError> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }
        Self::find_element_end(data)
    }

    /// Length of the single bencode element starting at `data[0]`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - malformed or truncated element
    pub fn find_element_end(data: &[u8]) -> Result<usize, TorrentError> {
        let mut pos = 0;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(invalid("Incomplete bencode element"));
            };
            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' => {
                    if depth == 0 {
                        return Err(invalid("Unexpected end marker"));
                    }
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|&b| b == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or_else(|| invalid("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|digits| digits.parse().ok())
                        .ok_or_else(|| invalid("Invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(invalid("String exceeds input"));
                    }
                }
                _ => return Err(invalid("Invalid bencode character")),
            }
            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    /// Re-encodes a torrent as `{announce, announce-list, info}` keeping the
    /// `info` bytes verbatim, so the info hash is unchanged.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - `data` has no `info` dictionary
    pub fn canonical_torrent(data: &[u8], trackers: &[String]) -> Result<Vec<u8>, TorrentError> {
        let info = Self::info_bytes(data)?;
        let mut root = BTreeMap::new();
        if let Some(first) = trackers.first() {
            root.insert(b"announce".to_vec(), Bencode::string(first));
            let tiers = trackers
                .iter()
                .map(|tracker| Bencode::List(vec![Bencode::string(tracker)]))
                .collect();
            root.insert(b"announce-list".to_vec(), Bencode::List(tiers));
        }
        root.insert(b"info".to_vec(), Bencode::Raw(info.to_vec()));
        Ok(Bencode::Dictionary(root).encode())
    }

    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> BytesResult<'a> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_files_info(files_list: &[bencode_rs::Value<'_>]) -> FilesResult {
        let mut files = Vec::with_capacity(files_list.len());
        let mut total_length = 0u64;

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(invalid("Invalid file entry type"));
            };
            let length = Self::extract_integer(file_dict, b"length")?;
            if length < 0 {
                return Err(invalid("Negative file length"));
            }
            total_length += length as u64;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice())
            else {
                return Err(invalid("Missing or invalid path in file"));
            };

            let mut path = Vec::with_capacity(path_list.len());
            for path_component in path_list {
                let bencode_rs::Value::Bytes(component) = path_component else {
                    return Err(invalid("Invalid path component type"));
                };
                let component = String::from_utf8(component.to_vec())
                    .map_err(|_| invalid("Invalid UTF-8 in file path"))?;
                if component == ".." || component.contains('/') || component.contains('\\') {
                    return Err(invalid(format!("Unsafe path component {component:?}")));
                }
                path.push(component);
            }
            if path.is_empty() {
                return Err(invalid("Empty file path"));
            }

            files.push(TorrentFile {
                path,
                length: length as u64,
            });
        }

        if files.is_empty() {
            return Err(invalid("Torrent lists no files"));
        }
        Ok((files, total_length))
    }

    /// Primary announce URL, then every announce-list tier, deduplicated.
    /// Trackerless torrents yield an empty list.
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut announce_urls: Vec<String> = Vec::new();
        let mut push = |url: String| {
            if !url.is_empty() && !announce_urls.contains(&url) {
                announce_urls.push(url);
            }
        };

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value
                            && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                        {
                            push(url);
                        }
                    }
                }
            }
        }

        announce_urls
    }
}

/// Owned bencode value used for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Bencode {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    /// Keys are kept sorted as the format requires.
    Dictionary(BTreeMap<Vec<u8>, Bencode>),
    /// Already encoded element copied verbatim.
    Raw(Vec<u8>),
}

impl Bencode {
    pub fn string(value: &str) -> Self {
        Bencode::Bytes(value.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Integer(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dictionary(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Raw(bytes) => out.extend_from_slice(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const PIECES: &str = "\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01";

    fn minimal_torrent() -> Vec<u8> {
        format!(
            "d8:announce9:test.com:4:infod6:lengthi1000e4:name9:test.file12:piece lengthi32768e6:pieces20:{PIECES}ee"
        )
        .into_bytes()
    }

    #[test]
    fn test_find_bencode_dictionary_end_simple() {
        let bencode_data = b"d3:keyi42ee";
        let end = BencodeParser::find_bencode_dictionary_end(bencode_data).unwrap();
        assert_eq!(end, bencode_data.len());
    }

    #[test]
    fn test_find_bencode_dictionary_end_nested() {
        let bencode_data = b"d3:keyd4:namei42eee";
        let end = BencodeParser::find_bencode_dictionary_end(bencode_data).unwrap();
        assert_eq!(end, bencode_data.len());
    }

    #[test]
    fn test_find_bencode_dictionary_end_with_list() {
        let bencode_data = b"d4:listl4:testi42eeetrailing";
        let end = BencodeParser::find_bencode_dictionary_end(bencode_data).unwrap();
        assert_eq!(end, b"d4:listl4:testi42eee".len());
    }

    #[test]
    fn test_find_bencode_dictionary_end_rejects_list() {
        assert!(BencodeParser::find_bencode_dictionary_end(b"l4:teste").is_err());
    }

    #[test]
    fn test_find_bencode_dictionary_end_incomplete() {
        assert!(BencodeParser::find_bencode_dictionary_end(b"d3:key").is_err());
        assert!(BencodeParser::find_bencode_dictionary_end(b"d3:key999:").is_err());
    }

    #[test]
    fn test_info_span_ignores_info_text_inside_other_values() {
        // A string value that contains "4:info" must not confuse the lookup.
        let data = format!(
            "d7:comment6:4:info4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:{PIECES}ee"
        );
        let span = BencodeParser::dictionary_value_span(data.as_bytes(), b"info")
            .unwrap()
            .unwrap();
        assert!(data.as_bytes()[span.clone()].starts_with(b"d6:length"));
        assert_eq!(span.end, data.len() - 1);
    }

    #[test]
    fn test_extract_bytes_and_integers() {
        let mut dict = HashMap::new();
        dict.insert(b"text".as_slice(), bencode_rs::Value::Bytes(b"value"));
        dict.insert(b"number".as_slice(), bencode_rs::Value::Integer(42));
        dict.insert(b"bad".as_slice(), bencode_rs::Value::Bytes(&[0xFF, 0xFE]));

        assert_eq!(BencodeParser::extract_bytes(&dict, b"text").unwrap(), b"value");
        assert_eq!(BencodeParser::extract_integer(&dict, b"number").unwrap(), 42);
        assert!(BencodeParser::extract_integer(&dict, b"missing").is_err());
        assert!(BencodeParser::extract_bytes_as_string(&dict, b"bad").is_err());
    }

    #[test]
    fn test_parse_minimal_valid() {
        let metadata = BencodeParser::parse_bencode_data(&minimal_torrent()).unwrap();

        assert_eq!(metadata.name, "test.file");
        assert_eq!(metadata.piece_length, 32768);
        assert_eq!(metadata.total_length, 1000);
        assert_eq!(metadata.piece_hashes.len(), 1);
        assert_eq!(metadata.announce_urls, vec!["test.com:"]);
        assert!(!metadata.private);
    }

    #[test]
    fn test_parse_rejects_structural_errors() {
        assert!(BencodeParser::parse_bencode_data(b"").is_err());
        assert!(BencodeParser::parse_bencode_data(b"l4:teste").is_err());
        assert!(BencodeParser::parse_bencode_data(b"d8:announce9:test.com:e").is_err());

        let short_pieces = format!(
            "d4:infod6:lengthi1000e4:name1:a12:piece lengthi32768e6:pieces19:{}ee",
            &PIECES[..19]
        );
        assert!(BencodeParser::parse_bencode_data(short_pieces.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_rejects_uncovered_length() {
        // One 16 byte piece cannot hold 1000 bytes.
        let data = format!(
            "d4:infod6:lengthi1000e4:name1:a12:piece lengthi16e6:pieces20:{PIECES}ee"
        );
        let err = BencodeParser::parse_bencode_data(data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("do not cover"));
    }

    #[test]
    fn test_trackerless_private_torrent() {
        let data = format!(
            "d4:infod6:lengthi10e4:name1:a12:piece lengthi16e6:pieces20:{PIECES}7:privatei1eee"
        );
        let metadata = BencodeParser::parse_bencode_data(data.as_bytes()).unwrap();
        assert!(metadata.announce_urls.is_empty());
        assert!(metadata.private);
    }

    #[test]
    fn test_multifile_and_announce_list_dedup() {
        let data = format!(
            "d8:announce9:test.com:13:announce-listll9:test.com:el11:backup.com:ee\
             4:infod5:filesld6:lengthi500e4:pathl4:file1eed6:lengthi300e4:pathl3:sub5:file2eee\
             4:name3:dir12:piece lengthi1024e6:pieces20:{PIECES}ee"
        );
        let metadata = BencodeParser::parse_bencode_data(data.as_bytes()).unwrap();

        assert_eq!(metadata.total_length, 800);
        assert_eq!(metadata.files.len(), 2);
        assert_eq!(metadata.files[1].path, vec!["sub", "file2"]);
        assert_eq!(metadata.announce_urls, vec!["test.com:", "backup.com:"]);
    }

    #[test]
    fn test_rejects_parent_directory_components() {
        let data = format!(
            "d4:infod5:filesld6:lengthi5e4:pathl2:..3:badeee4:name3:dir12:piece lengthi1024e6:pieces20:{PIECES}ee"
        );
        assert!(BencodeParser::parse_bencode_data(data.as_bytes()).is_err());
    }

    #[test]
    fn test_info_hash_depends_only_on_info() {
        let with_tracker = minimal_torrent();
        let without_tracker = format!(
            "d4:infod6:lengthi1000e4:name9:test.file12:piece lengthi32768e6:pieces20:{PIECES}ee"
        );
        let a = BencodeParser::calculate_info_hash(&with_tracker).unwrap();
        let b = BencodeParser::calculate_info_hash(without_tracker.as_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_torrent_preserves_info_hash() {
        let original = minimal_torrent();
        let trackers = vec!["udp://a:1".to_string(), "udp://b:2".to_string()];
        let canonical = BencodeParser::canonical_torrent(&original, &trackers).unwrap();

        let metadata = BencodeParser::parse_bencode_data(&canonical).unwrap();
        assert_eq!(
            metadata.info_hash,
            BencodeParser::calculate_info_hash(&original).unwrap()
        );
        assert_eq!(metadata.announce_urls, trackers);
    }

    #[test]
    fn test_encode_sorts_dictionary_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(b"zeta".to_vec(), Bencode::Integer(-3));
        entries.insert(b"alpha".to_vec(), Bencode::List(vec![Bencode::string("x")]));
        let encoded = Bencode::Dictionary(entries).encode();
        assert_eq!(encoded, b"d5:alphal1:xe4:zetai-3ee");
    }
}
