//! Streaming tar introspection: a canonical content digest (tarsum) and a
//! per-file inventory, produced in a single walk over a raw or gzip-wrapped
//! tar stream.

use std::fmt::Write as _;
use std::io::{Read, SeekFrom};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::digest::to_hex;
use crate::storage::ReadSeek;

pub const TAR_FILES_INFO_SIZE: usize = 8;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const WHITEOUT_PREFIX: &str = "/.wh.";

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TarError(pub String);

/// One walk, two products. A tar read error disables both and is recorded on
/// `error`; it never fails the surrounding upload.
pub struct TarInfo {
    pub tarsum: TarSum,
    pub files: TarFilesInfo,
    pub error: Option<TarError>,
}

impl Default for TarInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl TarInfo {
    pub fn new() -> Self {
        Self {
            tarsum: TarSum::new(),
            files: TarFilesInfo::new(),
            error: None,
        }
    }

    pub fn load(&mut self, file: &mut dyn ReadSeek) {
        match sniff_gzip(file) {
            Ok(true) => {
                let decoder = flate2::read::GzDecoder::new(file);
                self.walk(decoder);
            }
            Ok(false) => self.walk(file),
            Err(err) => self.error = Some(TarError(err.to_string())),
        }
    }

    fn walk(&mut self, reader: impl Read) {
        let mut archive = tar::Archive::new(reader);
        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("error opening tar stream, disabling tarsum and file info: {err}");
                self.error = Some(TarError(err.to_string()));
                return;
            }
        };
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::debug!("error reading tar stream, disabling tarsum and file info: {err}");
                    self.error = Some(TarError(err.to_string()));
                    return;
                }
            };
            let fields = EntryFields::from_entry(&entry);
            self.tarsum.append(&fields, &mut entry);
            self.files.append(fields);
        }
    }
}

/// Detect a gzip stream by its magic bytes; leaves the reader at offset 0.
fn sniff_gzip(file: &mut dyn ReadSeek) -> std::io::Result<bool> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(read == magic.len() && magic == GZIP_MAGIC)
}

/// Header fields shared by the tarsum and the inventory.
#[derive(Debug, Clone)]
pub struct EntryFields {
    pub name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
    pub typeflag: u8,
    pub linkname: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
}

impl EntryFields {
    fn from_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Self {
        let header = entry.header();
        Self {
            name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
            mode: header.mode().unwrap_or(0),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            size: header.size().unwrap_or(0),
            mtime: header.mtime().unwrap_or(0) as i64,
            typeflag: header.entry_type().as_byte(),
            linkname: entry
                .link_name_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
            uname: header
                .username_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            gname: header
                .groupname_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            devmajor: header.device_major().ok().flatten().unwrap_or(0),
            devminor: header.device_minor().ok().flatten().unwrap_or(0),
        }
    }

    /// Canonical header string hashed into the per-entry digest. Field order
    /// is fixed and part of the format.
    fn header_string(&self) -> String {
        let mut s = String::new();
        s.push_str("name");
        s.push_str(&self.name);
        let _ = write!(s, "mode{}", self.mode);
        let _ = write!(s, "uid{}", self.uid);
        let _ = write!(s, "gid{}", self.gid);
        let _ = write!(s, "size{}", self.size);
        let _ = write!(s, "mtime{}", self.mtime);
        s.push_str("typeflag");
        s.push(self.typeflag as char);
        s.push_str("linkname");
        s.push_str(&self.linkname);
        s.push_str("uname");
        s.push_str(&self.uname);
        s.push_str("gname");
        s.push_str(&self.gname);
        let _ = write!(s, "devmajor{}", self.devmajor);
        let _ = write!(s, "devminor{}", self.devminor);
        s
    }
}

/// Order-independent digest over a tar: per-entry sha256 of header+content,
/// sorted, then hashed again with the image JSON as seed.
pub struct TarSum {
    hashes: Vec<String>,
}

impl Default for TarSum {
    fn default() -> Self {
        Self::new()
    }
}

impl TarSum {
    pub fn new() -> Self {
        Self { hashes: Vec::new() }
    }

    pub fn append(&mut self, fields: &EntryFields, content: &mut impl Read) {
        let header = fields.header_string();
        let mut sha = Sha256::new();
        sha.update(header.as_bytes());
        if fields.size > 0 {
            if let Err(err) = std::io::copy(content, &mut sha) {
                log::debug!("error hashing tar entry content: {err}");
                sha = Sha256::new();
                sha.update(header.as_bytes());
            }
        }
        self.hashes.push(to_hex(&sha.finalize()));
    }

    pub fn compute(&mut self, seed: &[u8]) -> String {
        self.hashes.sort();
        let mut sha = Sha256::new();
        sha.update(seed);
        for hash in &self.hashes {
            sha.update(hash.as_bytes());
        }
        format!("tarsum+sha256:{}", to_hex(&sha.finalize()))
    }
}

/// Per-file inventory of a layer, serialized as the historical 8-tuple:
/// `[name, type, deleted, size, mtime, mode, uid, gid]`.
pub struct TarFilesInfo {
    entries: Vec<EntryFields>,
}

impl Default for TarFilesInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl TarFilesInfo {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, fields: EntryFields) {
        self.entries.push(fields);
    }

    /// Walk a seekable raw-or-gzipped tar collecting the inventory only.
    /// Unlike [`TarInfo::load`], a read error here is reported to the caller.
    pub fn load_seekable(&mut self, file: &mut dyn ReadSeek) -> Result<(), TarError> {
        let gzipped = sniff_gzip(file).map_err(|e| TarError(e.to_string()))?;
        if gzipped {
            self.walk(flate2::read::GzDecoder::new(file))
        } else {
            self.walk(file)
        }
    }

    fn walk(&mut self, reader: impl Read) -> Result<(), TarError> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().map_err(|e| TarError(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| TarError(e.to_string()))?;
            self.append(EntryFields::from_entry(&entry));
        }
        Ok(())
    }

    pub fn json(&self) -> serde_json::Result<Vec<u8>> {
        let mut rows: Vec<serde_json::Value> = Vec::with_capacity(self.entries.len());
        for fields in &self.entries {
            let mut filename = fields.name.clone();
            let mut is_deleted = false;
            if filename == "." {
                filename = "/".to_string();
            }
            if let Some(rest) = filename.strip_prefix("./") {
                filename = format!("/{rest}");
            }
            if let Some(rest) = filename.strip_prefix(WHITEOUT_PREFIX) {
                filename = format!("/{rest}");
                is_deleted = true;
            }
            // a whiteout of a whiteout tombstones nothing; drop it
            if filename.starts_with(WHITEOUT_PREFIX) {
                continue;
            }

            let filetype = match fields.typeflag {
                0 | b'0' => "f".to_string(),
                b'1' => "l".to_string(),
                b'2' => "s".to_string(),
                b'3' => "c".to_string(),
                b'4' => "b".to_string(),
                b'5' => "d".to_string(),
                b'6' => "i".to_string(),
                b'7' => "t".to_string(),
                b'L' | b'K' | b'S' => (fields.typeflag as char).to_string(),
                _ => "u".to_string(),
            };

            rows.push(serde_json::json!([
                filename,
                filetype,
                is_deleted,
                fields.size,
                fields.mtime,
                fields.mode,
                fields.uid,
                fields.gid,
            ]));
        }
        serde_json::to_vec(&rows)
    }
}
