//! Zip bundles of the files referenced by a result column.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// One archive member: the name inside the zip and the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub path: PathBuf,
}

impl ArchiveEntry {
    /// Entries are named after the path as stored in the result, without a
    /// leading `/`.
    pub fn new(stored_path: &str, resolved: PathBuf) -> Self {
        Self {
            name: stored_path.trim_start_matches('/').to_string(),
            path: resolved,
        }
    }
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Write `entries` into a zip at `target`. The archive is built next to the
/// target and renamed into place, so readers never see a partial file.
pub fn write_archive(target: &Path, entries: &[ArchiveEntry]) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = target.with_extension("zip.part");

    let result = (|| -> io::Result<()> {
        let mut zip = ZipWriter::new(File::create(&partial)?);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for entry in entries {
            zip.start_file(entry.name.as_str(), options).map_err(zip_error)?;
            let mut source = File::open(&entry.path)?;
            io::copy(&mut source, &mut zip)?;
        }
        zip.finish().map_err(zip_error)?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    fs::rename(&partial, target)?;
    let size = fs::metadata(target)?.len();
    debug!(path = %target.display(), files = entries.len(), size, "Wrote archive");
    Ok(size)
}
