//! MIME determination for diff output.
//!
//! Device and FIFO entries never exist on disk, so their MIME is synthesized
//! from the recorded attribute kind. Everything else is sniffed from content:
//! magic bytes first, then a UTF-8 check to separate text from binary.

use std::fs;
use std::io::Read;
use std::path::Path;

use crate::extractor::{EntryKind, FileAttrs};

const SNIFF_LEN: usize = 8192;

/// MIME string for entries whose kind alone decides it. `None` for entries
/// that need content sniffing.
pub fn from_attrs(attrs: &FileAttrs) -> Option<&'static str> {
    match attrs.kind {
        EntryKind::BlockDevice => Some("inode/blockdevice; charset=binary"),
        EntryKind::CharDevice => Some("inode/chardevice; charset=binary"),
        EntryKind::Fifo => Some("inode/fifo; charset=binary"),
        _ => None,
    }
}

/// Content-derived MIME of a path inside an extracted tree.
pub fn from_path(path: &Path) -> String {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(_) => return "application/octet-stream; charset=binary".to_string(),
    };

    if meta.is_symlink() {
        return "inode/symlink; charset=binary".to_string();
    }
    if meta.is_dir() {
        return "inode/directory; charset=binary".to_string();
    }

    let mut buf = Vec::with_capacity(SNIFF_LEN);
    match fs::File::open(path) {
        Ok(file) => {
            if file.take(SNIFF_LEN as u64).read_to_end(&mut buf).is_err() {
                return "application/octet-stream; charset=binary".to_string();
            }
        }
        Err(_) => return "application/octet-stream; charset=binary".to_string(),
    }

    if buf.is_empty() {
        return "inode/x-empty; charset=binary".to_string();
    }
    if let Some(kind) = infer::get(&buf) {
        return format!("{}; charset=binary", kind.mime_type());
    }
    if is_probably_utf8(&buf) {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream; charset=binary".to_string()
    }
}

/// Valid UTF-8, allowing one multibyte sequence cut off by the sniff window.
fn is_probably_utf8(buf: &[u8]) -> bool {
    match std::str::from_utf8(buf) {
        Ok(s) => !s.contains('\0'),
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > buf.len(),
    }
}
