use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_bytes(p: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, data).map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())))
}

/// Write through a sibling temp file so readers never see a partial file.
pub fn write_atomic(p: &Path, data: &[u8]) -> Result<()> {
    let dir = parent_dir(p);
    ensure_dir(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to create temp file in {}: {e}", dir.display())))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())))?;
    tmp.persist(p)
        .map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())))?;
    Ok(())
}

/// Parent of `p`, with `.` standing in for a bare file name.
pub fn parent_dir(p: &Path) -> &Path {
    p.parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::io(format!("json encode error: {e}")))?;
    write_atomic(p, s.as_bytes())
}

/// Create `p` as an empty file if missing, and bump its mtime either way.
pub fn touch(p: &Path) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(p)
        .map_err(|e| Error::io(format!("failed to touch {}: {e}", p.display())))?;
    filetime::set_file_mtime(p, FileTime::now())
        .map_err(|e| Error::io(format!("failed to touch {}: {e}", p.display())))
}

pub fn gzip_path(p: &Path) -> PathBuf {
    let mut name = p.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Compress `src` into `src.gz` and remove `src`, like `gzip FILE`.
pub fn gzip_in_place(src: &Path) -> Result<PathBuf> {
    let dest = gzip_path(src);
    let dir = parent_dir(src);

    let input = File::open(src)
        .map_err(|e| Error::io(format!("failed to open {}: {e}", src.display())))?;
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to create temp file in {}: {e}", dir.display())))?;

    let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)
        .map_err(|e| Error::io(format!("failed to compress {}: {e}", src.display())))?;
    let mut out = encoder
        .finish()
        .map_err(|e| Error::io(format!("failed to compress {}: {e}", src.display())))?;
    out.flush()
        .map_err(|e| Error::io(format!("failed to compress {}: {e}", src.display())))?;
    drop(out);

    tmp.persist(&dest)
        .map_err(|e| Error::io(format!("failed to write {}: {e}", dest.display())))?;
    fs::remove_file(src)
        .map_err(|e| Error::io(format!("failed to remove {}: {e}", src.display())))?;
    Ok(dest)
}

/// Fold `.` and `..` lexically so equal locations compare equal.
pub fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
