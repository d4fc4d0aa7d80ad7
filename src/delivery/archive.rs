//! Zip packaging of the files an execution left in its task directory.

use std::fs::File;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use super::DeliveryError;

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__"];

fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_DIRS.contains(&name)
}

/// Every regular file under `root`, as paths relative to it, sorted.
pub fn collect_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        for entry in std::fs::read_dir(root.join(&relative))? {
            let entry = entry?;
            let name = entry.file_name();
            let file_type = entry.file_type()?;
            let path = relative.join(&name);
            if file_type.is_dir() {
                if !skip_dir(&name.to_string_lossy()) {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Deflated zip of [`collect_files`], or `None` when there is nothing to pack.
pub fn build_archive(root: &Path) -> Result<Option<Vec<u8>>, DeliveryError> {
    let files = collect_files(root)?;
    if files.is_empty() {
        return Ok(None);
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for relative in &files {
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options)?;
        let mut source = File::open(root.join(relative))?;
        io::copy(&mut source, &mut zip)?;
    }
    Ok(Some(zip.finish()?.into_inner()))
}
