//! Archive expansion
//!
//! Handles tar, tar.gz, tar.zst and zip. Anything else is copied as-is.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(String),
}

/// Archive formats recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarZst,
    Zip,
    /// Not an archive; copied into the source directory unchanged.
    Plain,
}

/// Detect archive format from file extension
pub fn detect_format(path: &Path) -> ArchiveFormat {
    let name = path.to_string_lossy().to_lowercase();

    if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        ArchiveFormat::TarZst
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveFormat::TarGz
    } else if name.ends_with(".tar") {
        ArchiveFormat::Tar
    } else if name.ends_with(".zip") {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Plain
    }
}

/// Unpack `archive` into `scratch`, then move the result to `dest`.
///
/// A single top-level directory is hoisted so `dest` holds its contents.
/// `scratch` must live on the same filesystem as `dest`.
pub fn expand_into(archive: &Path, scratch: &Path, dest: &Path) -> Result<(), ExtractError> {
    let unpacked = scratch.join("unpacked");
    fs::create_dir_all(&unpacked)?;

    let entries = match detect_format(archive) {
        ArchiveFormat::TarZst => {
            let decoder = ZstdDecoder::new(BufReader::new(File::open(archive)?))?;
            extract_tar(decoder, &unpacked)?
        }
        ArchiveFormat::TarGz => {
            let decoder = flate2::read::GzDecoder::new(BufReader::new(File::open(archive)?));
            extract_tar(decoder, &unpacked)?
        }
        ArchiveFormat::Tar => extract_tar(BufReader::new(File::open(archive)?), &unpacked)?,
        ArchiveFormat::Zip => extract_zip(archive, &unpacked)?,
        ArchiveFormat::Plain => {
            let filename = archive
                .file_name()
                .ok_or_else(|| ExtractError::Archive("Invalid filename".to_string()))?;
            fs::copy(archive, unpacked.join(filename))?;
            return move_into_place(&unpacked, dest);
        }
    };
    tracing::debug!("Expanded {} entries from {}", entries, archive.display());

    let root = single_top_level_dir(&unpacked)?.unwrap_or(unpacked);
    move_into_place(&root, dest)
}

fn single_top_level_dir(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?;
    let (Some(first), None) = (entries.next().transpose()?, entries.next()) else {
        return Ok(None);
    };
    Ok(first.file_type()?.is_dir().then(|| first.path()))
}

fn move_into_place(from: &Path, dest: &Path) -> Result<(), ExtractError> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, dest)?;
    Ok(())
}

/// Extract a tar archive from a reader
fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<usize, ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative_path = entry.path()?.into_owned();

        // Sanitize path to prevent Zip Slip
        if !entry.unpack_in(dest_dir)? {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                relative_path.display()
            )));
        }
        count += 1;
    }

    Ok(count)
}

/// Extract a zip archive
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<usize, ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ExtractError::Archive(e.to_string()))?;
    let mut count = 0;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let Some(relative_path) = file.enclosed_name() else {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                file.name()
            )));
        };

        let absolute_path = dest_dir.join(&relative_path);
        if file.is_dir() {
            fs::create_dir_all(&absolute_path)?;
            continue;
        }
        if let Some(p) = absolute_path.parent() {
            fs::create_dir_all(p)?;
        }

        let mut outfile = File::create(&absolute_path)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&absolute_path, fs::Permissions::from_mode(mode))?;
        }
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a gzipped tarball of `files` (path, contents) to `path`.
    pub(crate) fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let out = File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(out, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn formats() {
        assert_eq!(detect_format(Path::new("a.tar.gz")), ArchiveFormat::TarGz);
        assert_eq!(detect_format(Path::new("a.TGZ")), ArchiveFormat::TarGz);
        assert_eq!(detect_format(Path::new("a.tar.zst")), ArchiveFormat::TarZst);
        assert_eq!(detect_format(Path::new("a.tar")), ArchiveFormat::Tar);
        assert_eq!(detect_format(Path::new("a.zip")), ArchiveFormat::Zip);
        assert_eq!(detect_format(Path::new("patch.diff")), ArchiveFormat::Plain);
    }

    #[test]
    fn single_top_level_directory_is_hoisted() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("zlib-1.3.tar.gz");
        write_tar_gz(&archive, &[("zlib-1.3/configure", "#!/bin/sh\n"), ("zlib-1.3/src/z.c", "int z;\n")]);

        let scratch = tempfile::tempdir_in(dir.path()).unwrap();
        let dest = dir.path().join("src");
        expand_into(&archive, scratch.path(), &dest).unwrap();
        assert!(dest.join("configure").is_file());
        assert!(dest.join("src/z.c").is_file());
    }

    #[test]
    fn flat_archive_is_kept_whole() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.tar.gz");
        write_tar_gz(&archive, &[("a.txt", "a"), ("b.txt", "b")]);

        let scratch = tempfile::tempdir_in(dir.path()).unwrap();
        let dest = dir.path().join("src");
        expand_into(&archive, scratch.path(), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn uncompressed_tar_and_zip_are_expanded() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bzip2-1.0.8.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "bzip2-1.0.8/Makefile", &b"all:"[..]).unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let scratch = tempfile::tempdir_in(dir.path()).unwrap();
        let dest = dir.path().join("from-tar");
        expand_into(&tar_path, scratch.path(), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("Makefile")).unwrap(), "all:");

        let zip_path = dir.path().join("lua-5.4.zip");
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        zip.start_file("lua-5.4/src/lua.c", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"int main;").unwrap();
        zip.finish().unwrap();

        let scratch = tempfile::tempdir_in(dir.path()).unwrap();
        let dest = dir.path().join("from-zip");
        expand_into(&zip_path, scratch.path(), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("src/lua.c")).unwrap(), "int main;");
    }

    #[test]
    fn plain_files_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("fix.patch");
        fs::write(&file, "diff").unwrap();

        let scratch = tempfile::tempdir_in(dir.path()).unwrap();
        let dest = dir.path().join("src");
        expand_into(&file, scratch.path(), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("fix.patch")).unwrap(), "diff");
    }
}
