// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tar::Builder;
use walkdir::WalkDir;
use zstd::stream::{Decoder, Encoder};

use super::StagingError;

fn archive_error(message: impl Into<String>) -> StagingError {
    StagingError::Archive(message.into())
}

/// Pack a local directory into a tar.zst archive. Entries are relative to
/// `source_root` (extraction lands the contents directly in the target
/// workspace); `.git` directories and symlinks are skipped.
pub fn create_archive(source_root: &Path, archive_path: &Path) -> Result<(), StagingError> {
    if !source_root.is_dir() {
        return Err(archive_error(format!(
            "staging source '{}' is not a directory",
            source_root.display()
        )));
    }
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            archive_error(format!(
                "failed to create archive directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    let file = File::create(archive_path).map_err(|err| {
        archive_error(format!(
            "failed to create archive {}: {err}",
            archive_path.display()
        ))
    })?;
    let encoder =
        Encoder::new(file, 0).map_err(|err| archive_error(format!("encoder start: {err}")))?;
    let mut builder = Builder::new(encoder);

    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(source_root).follow_links(false) {
        let entry = entry.map_err(|err| archive_error(format!("walk failed: {err}")))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(source_root)
            .map_err(|_| archive_error("failed to compute archive relative path"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        if rel.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        if entry.file_type().is_symlink() {
            continue;
        }
        if entry.file_type().is_dir() || entry.file_type().is_file() {
            entries.push((rel.to_path_buf(), entry.file_type().is_dir()));
        }
    }

    entries.sort_by_key(|(rel, _)| rel.to_string_lossy().to_string());

    for (rel, is_dir) in entries {
        let src = source_root.join(&rel);
        if is_dir {
            builder
                .append_dir(&rel, &src)
                .map_err(|err| archive_error(format!("failed to add directory: {err}")))?;
        } else {
            builder
                .append_path_with_name(&src, &rel)
                .map_err(|err| archive_error(format!("failed to add file: {err}")))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| archive_error(format!("failed to finalize archive: {err}")))?;
    encoder
        .finish()
        .map_err(|err| archive_error(format!("failed to finish archive: {err}")))?;
    Ok(())
}

/// Unpack a tar.zst archive into `dest_dir`. The remote side normally does
/// this with `tar`; the local variant exists for verification and tooling.
pub fn unpack_archive(archive_path: &Path, dest_dir: &Path) -> Result<(), StagingError> {
    let file = File::open(archive_path).map_err(|err| {
        archive_error(format!(
            "failed to open archive {}: {err}",
            archive_path.display()
        ))
    })?;
    let decoder =
        Decoder::new(file).map_err(|err| archive_error(format!("archive decode failed: {err}")))?;
    fs::create_dir_all(dest_dir).map_err(|err| {
        archive_error(format!(
            "failed to create extraction directory {}: {err}",
            dest_dir.display()
        ))
    })?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive
        .entries()
        .map_err(|err| archive_error(format!("failed to read archive entries: {err}")))?
    {
        let mut entry = entry.map_err(|err| archive_error(format!("archive entry failed: {err}")))?;
        entry.unpack_in(dest_dir).map_err(|err| {
            archive_error(format!(
                "failed to extract entry into {}: {err}",
                dest_dir.display()
            ))
        })?;
    }
    Ok(())
}
