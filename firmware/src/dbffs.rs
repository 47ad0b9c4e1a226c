//! DBFFS: the read-only packed filesystem serving the web UI (§4.D, §6).
//!
//! The image opens with a 4-byte filesystem signature, immediately followed
//! by a flat sequence of entries back to back: a 4-byte entry signature, a
//! `next` offset relative to the entry's own start (0 marks the final
//! entry), a name length and name, then either file payload (`size` +
//! inline bytes) or a symlink target (length-prefixed path). `find` walks
//! entries linearly from the first entry, following `next` until a name
//! match or the end of the image; a symlink entry recurses into a fresh
//! walk from the first entry using its target path. The linear
//! next-offset chain is the same shape a sequential FAT/ISO9660 directory
//! walk uses.

use crate::error::{FwError, FwResult};

/// §6: "4-byte fs signature `0xDBFF5000`".
const FS_SIGNATURE: u32 = 0xDBFF_5000;
/// §6: "entry signatures `0xDBFF500F` (file), `0xDBFF500D` (directory —
/// reserved), `0xDBFF5001` (link)".
const SIG_FILE: u32 = 0xDBFF_500F;
const SIG_DIR: u32 = 0xDBFF_500D;
const SIG_LINK: u32 = 0xDBFF_5001;

/// A located file's size and payload slice within the image.
pub struct DbffsFile<'a> {
    pub size: u32,
    pub data: &'a [u8],
}

/// Maximum symlink recursion depth before treating it as a cycle.
const MAX_LINK_DEPTH: u8 = 8;

/// Read-only view over a DBFFS image held entirely in memory (mapped flash
/// on real hardware; an owned `Vec<u8>` in tests).
pub struct Dbffs<'a> {
    image: &'a [u8],
    /// Byte offset of the first entry, just past the fs signature.
    first_entry: usize,
}

impl<'a> Dbffs<'a> {
    /// Scan for the 4-byte filesystem signature at the start of `image`
    /// (§4.D "Initialization"). A mismatch is fatal per §7: "corrupt
    /// filesystem signature ... abort the subsystem".
    pub fn new(image: &'a [u8]) -> FwResult<Self> {
        if image.len() < 4 {
            return Err(FwError::Storage("image too small for fs signature"));
        }
        let sig = u32::from_le_bytes(image[0..4].try_into().unwrap());
        if sig != FS_SIGNATURE {
            return Err(FwError::Storage("bad dbffs signature"));
        }
        Ok(Dbffs { image, first_entry: 4 })
    }

    /// Resolve `path` (leading `/` required, same convention as the HTTP
    /// pipeline's URI) to a file, following symlinks.
    pub fn find(&self, path: &str) -> FwResult<DbffsFile<'a>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        self.find_inner(path, 0)
    }

    fn find_inner(&self, path: &str, depth: u8) -> FwResult<DbffsFile<'a>> {
        if depth >= MAX_LINK_DEPTH {
            return Err(FwError::Storage("symlink depth exceeded"));
        }
        let mut offset = self.first_entry;
        loop {
            if offset >= self.image.len() {
                return Err(FwError::Storage("not found"));
            }
            let entry = self.parse_entry(offset)?;
            if entry.name == path {
                return match entry.kind {
                    EntryKind::File { size, data_offset } => Ok(DbffsFile {
                        size,
                        data: &self.image[data_offset..data_offset + size as usize],
                    }),
                    EntryKind::Link { target } => self.find_inner(target, depth + 1),
                    // §4.D step 2: "other -> warn; treat as miss."
                    EntryKind::Other => {
                        log::warn!("dbffs: {path} matched a reserved entry kind, treating as miss");
                        Err(FwError::Storage("not found"))
                    }
                };
            }
            match entry.next {
                0 => return Err(FwError::Storage("not found")),
                // §3 invariant: "next-entry offsets are forward-only" and
                // relative to the entry's own start.
                next => offset += next as usize,
            }
        }
    }

    fn parse_entry(&self, offset: usize) -> FwResult<Entry<'a>> {
        let img = self.image;
        if offset + 9 > img.len() {
            return Err(FwError::Storage("truncated entry header"));
        }
        let sig = u32::from_le_bytes(img[offset..offset + 4].try_into().unwrap());
        let next = u32::from_le_bytes(img[offset + 4..offset + 8].try_into().unwrap());
        let name_len = img[offset + 8] as usize;
        let name_start = offset + 9;
        let name_end = name_start + name_len;
        if name_end > img.len() {
            return Err(FwError::Storage("truncated entry name"));
        }
        let name = std::str::from_utf8(&img[name_start..name_end])
            .map_err(|_| FwError::Storage("non-utf8 entry name"))?;

        match sig {
            SIG_FILE => {
                if name_end + 4 > img.len() {
                    return Err(FwError::Storage("truncated file size"));
                }
                let size = u32::from_le_bytes(img[name_end..name_end + 4].try_into().unwrap());
                let data_offset = name_end + 4;
                if data_offset + size as usize > img.len() {
                    return Err(FwError::Storage("truncated file data"));
                }
                Ok(Entry { name, next, kind: EntryKind::File { size, data_offset } })
            }
            SIG_LINK => {
                if name_end >= img.len() {
                    return Err(FwError::Storage("truncated link target length"));
                }
                let target_len = img[name_end] as usize;
                let target_start = name_end + 1;
                let target_end = target_start + target_len;
                if target_end > img.len() {
                    return Err(FwError::Storage("truncated link target"));
                }
                let target = std::str::from_utf8(&img[target_start..target_end])
                    .map_err(|_| FwError::Storage("non-utf8 link target"))?;
                Ok(Entry { name, next, kind: EntryKind::Link { target } })
            }
            SIG_DIR => Ok(Entry { name, next, kind: EntryKind::Other }),
            _ => Err(FwError::Storage("unknown entry signature")),
        }
    }
}

struct Entry<'a> {
    name: &'a str,
    next: u32,
    kind: EntryKind<'a>,
}

enum EntryKind<'a> {
    File { size: u32, data_offset: usize },
    Link { target: &'a str },
    /// Directory entries are reserved (§6) and never resolved by `find`.
    Other,
}

/// Assembles an in-memory DBFFS image from `(path, bytes)` pairs, for
/// round-trip tests. Never used by the running firmware; not `#[cfg(test)]`
/// since `tests/` integration tests link against the library without test
/// cfg active and need this to build fixture images.
pub struct DbffsBuilder {
    entries: Vec<BuilderEntry>,
}

enum BuilderEntry {
    File { name: String, data: Vec<u8> },
    Link { name: String, target: String },
    Dir { name: String },
}

impl DbffsBuilder {
    pub fn new() -> Self {
        DbffsBuilder { entries: Vec::new() }
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(BuilderEntry::File { name: name.to_string(), data: data.to_vec() });
        self
    }

    pub fn link(mut self, name: &str, target: &str) -> Self {
        self.entries.push(BuilderEntry::Link { name: name.to_string(), target: target.to_string() });
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push(BuilderEntry::Dir { name: name.to_string() });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = FS_SIGNATURE.to_le_bytes().to_vec();
        let n = self.entries.len();

        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(n);
        for entry in &self.entries {
            let mut body = Vec::new();
            match entry {
                BuilderEntry::File { name, data } => {
                    body.extend_from_slice(&SIG_FILE.to_le_bytes());
                    body.extend_from_slice(&0u32.to_le_bytes()); // next, patched below
                    body.push(name.len() as u8);
                    body.extend_from_slice(name.as_bytes());
                    body.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    body.extend_from_slice(data);
                }
                BuilderEntry::Link { name, target } => {
                    body.extend_from_slice(&SIG_LINK.to_le_bytes());
                    body.extend_from_slice(&0u32.to_le_bytes());
                    body.push(name.len() as u8);
                    body.extend_from_slice(name.as_bytes());
                    body.push(target.len() as u8);
                    body.extend_from_slice(target.as_bytes());
                }
                BuilderEntry::Dir { name } => {
                    body.extend_from_slice(&SIG_DIR.to_le_bytes());
                    body.extend_from_slice(&0u32.to_le_bytes());
                    body.push(name.len() as u8);
                    body.extend_from_slice(name.as_bytes());
                }
            }
            bodies.push(body);
        }

        let mut offsets = Vec::with_capacity(n);
        let mut running = 0u32;
        for body in &bodies {
            offsets.push(running);
            running += body.len() as u32;
        }

        for (i, mut body) in bodies.into_iter().enumerate() {
            // `next` is relative to this entry's own start (§3 invariant).
            let next = if i + 1 < n { offsets[i + 1] - offsets[i] } else { 0 };
            body[4..8].copy_from_slice(&next.to_le_bytes());
            out.extend_from_slice(&body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_file_by_exact_path() {
        let image = DbffsBuilder::new()
            .file("index.html", b"<html></html>")
            .file("style.css", b"body{}")
            .build();
        let fs = Dbffs::new(&image).unwrap();
        let f = fs.find("/index.html").unwrap();
        assert_eq!(f.data, b"<html></html>");
        assert_eq!(f.size, 13);
    }

    #[test]
    fn walks_past_earlier_entries_to_later_ones() {
        let image = DbffsBuilder::new()
            .file("a.txt", b"a")
            .file("b.txt", b"b")
            .file("c.txt", b"c")
            .build();
        let fs = Dbffs::new(&image).unwrap();
        assert_eq!(fs.find("/c.txt").unwrap().data, b"c");
    }

    #[test]
    fn missing_path_is_not_found() {
        let image = DbffsBuilder::new().file("a.txt", b"a").build();
        let fs = Dbffs::new(&image).unwrap();
        assert!(fs.find("/missing").is_err());
    }

    #[test]
    fn symlink_resolves_to_its_target_file() {
        let image = DbffsBuilder::new()
            .file("real.html", b"hello")
            .link("index.html", "real.html")
            .build();
        let fs = Dbffs::new(&image).unwrap();
        assert_eq!(fs.find("/index.html").unwrap().data, b"hello");
    }

    #[test]
    fn self_referential_link_hits_depth_limit_instead_of_looping() {
        let image = DbffsBuilder::new().link("loop.html", "loop.html").build();
        let fs = Dbffs::new(&image).unwrap();
        assert!(fs.find("/loop.html").is_err());
    }

    #[test]
    fn reserved_directory_entry_is_treated_as_a_miss() {
        let image = DbffsBuilder::new().dir("sub").build();
        let fs = Dbffs::new(&image).unwrap();
        assert!(fs.find("/sub").is_err());
    }

    #[test]
    fn bad_fs_signature_is_rejected_at_init() {
        let mut image = DbffsBuilder::new().file("a.txt", b"a").build();
        image[0] = 0;
        assert!(Dbffs::new(&image).is_err());
    }

    #[test]
    fn round_trip_streamed_contents_match_input_bytes() {
        // Testable property 3: a successful find's header supports a
        // successful stream read of exactly `size` bytes.
        let payload = b"the quick brown fox jumps over the lazy dog";
        let image = DbffsBuilder::new().file("f.bin", payload).build();
        let fs = Dbffs::new(&image).unwrap();
        let f = fs.find("/f.bin").unwrap();
        assert_eq!(f.size as usize, payload.len());
        assert_eq!(f.data, payload);
    }
}
