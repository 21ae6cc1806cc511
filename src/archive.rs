use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} is not a valid tar.gz archive")]
    InvalidFormat(String),
}

/// Pack every regular file directly under `src` into a flat tar.gz at `dest`.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = Builder::new(encoder);
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        builder.append_path_with_name(entry.path(), entry.file_name())?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Extract the regular files of a tar.gz archive flat into `dest`, dropping
/// any directory structure. Returns the number of files written.
pub fn unpack_flat(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = match entry.path()?.file_name() {
            Some(name) => name.to_os_string(),
            None => continue,
        };
        entry.unpack(dest.join(name))?;
        count += 1;
    }
    Ok(count)
}

/// Number of regular-file entries in a tar.gz archive.
pub fn entry_count(archive: &Path) -> Result<usize, ArchiveError> {
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut count = 0;
    for entry in tar.entries()? {
        if entry?.header().entry_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// Cheap format check: gzip magic bytes plus a readable first tar entry.
pub fn is_tar_gz(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    let readable = File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok();
    if !readable || magic != [0x1f, 0x8b] {
        return false;
    }
    match File::open(path) {
        Ok(file) => Archive::new(GzDecoder::new(file))
            .entries()
            .and_then(|mut entries| entries.next().transpose())
            .is_ok(),
        Err(_) => false,
    }
}
