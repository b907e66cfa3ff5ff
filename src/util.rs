//! Filesystem helpers for the per-run directory bookkeeping.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};

/// Removes `dir` and everything below it, ignoring a missing directory.
pub fn remove_dir_best_effort(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("Failed to remove {:?}: {}", dir, err),
    }
}

/// Removes `dir` and recreates it empty, including missing parents.
pub fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir_best_effort(dir);
    fs::create_dir_all(dir).at(dir)
}

/// Copies `file` into `dir`, keeping its file name.
pub fn copy_into(file: &Path, dir: &Path) -> Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| Error::MissingArtifact(file.to_owned()))?;
    fs::copy(file, dir.join(name)).at(file)?;
    Ok(())
}

/// Recursively copies the directory `src` to `dst`. Symbolic links are
/// not followed; links to files are copied as files, others are skipped.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).at(dst)?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(src)
            .map_err(|_| Error::MissingArtifact(path.to_owned()))?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else if file_type.is_file() || path.is_file() {
            fs::copy(path, &target).at(path)?;
        } else {
            log::warn!("Skipping {:?} while copying {:?}", path, src);
        }
    }
    Ok(())
}

/// Moves `src` to `dst`, copying when a rename crosses filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_dir_all(src, dst)?;
    fs::remove_dir_all(src).at(src)
}

/// Every regular file below `dir` for which `keep` holds, in walk order
/// with siblings sorted by name. Symbolic links are not followed.
pub fn walk_files(dir: &Path, keep: &dyn Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && keep(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reset_dir_empties_existing_content() {
        let root = tempdir().unwrap();
        let dir = root.path().join("a").join("b");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.txt"), "x").unwrap();

        reset_dir(&dir).unwrap();

        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn removing_missing_dir_is_silent() {
        let root = tempdir().unwrap();
        remove_dir_best_effort(&root.path().join("missing"));
    }

    #[test]
    fn move_dir_keeps_nested_files() {
        let root = tempdir().unwrap();
        let src = root.path().join("droidMate");
        fs::create_dir_all(src.join("model")).unwrap();
        fs::write(src.join("model").join("states.txt"), "s1").unwrap();
        let dst = root.path().join("input").join("droidMate");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();

        move_dir(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(
            fs::read_to_string(dst.join("model").join("states.txt")).unwrap(),
            "s1"
        );
    }

    #[test]
    fn walk_files_filters_recursively() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("x").join("y")).unwrap();
        fs::write(root.path().join("x").join("y").join("keep.txt"), "").unwrap();
        fs::write(root.path().join("x").join("skip.log"), "").unwrap();

        let found = walk_files(root.path(), &|p: &Path| {
            p.extension().map_or(false, |ext| ext == "txt")
        })
        .unwrap();

        assert_eq!(found, vec![root.path().join("x").join("y").join("keep.txt")]);
    }

    #[test]
    fn walk_files_skips_symlink_cycles() {
        let root = tempdir().unwrap();
        let model = root.path().join("droidMate");
        let coverage = model.join("coverage");
        fs::create_dir_all(&coverage).unwrap();
        fs::write(coverage.join("app-statements-1"), "1;x\n").unwrap();
        std::os::unix::fs::symlink(&model, coverage.join("loop")).unwrap();

        let found = walk_files(root.path(), &|_: &Path| true).unwrap();

        assert_eq!(found, vec![coverage.join("app-statements-1")]);
    }

    #[test]
    fn copy_dir_all_keeps_tree_and_survives_cycles() {
        let root = tempdir().unwrap();
        let src = root.path().join("droidMate");
        fs::create_dir_all(src.join("model").join("states")).unwrap();
        fs::write(src.join("model").join("states").join("s1.csv"), "s1").unwrap();
        fs::write(src.join("top.txt"), "top").unwrap();
        std::os::unix::fs::symlink(&src, src.join("model").join("loop")).unwrap();
        let dst = root.path().join("seed0").join("droidMate");

        copy_dir_all(&src, &dst).unwrap();

        assert_eq!(
            fs::read_to_string(dst.join("model").join("states").join("s1.csv")).unwrap(),
            "s1"
        );
        assert_eq!(fs::read_to_string(dst.join("top.txt")).unwrap(), "top");
        assert!(!dst.join("model").join("loop").exists());
    }
}
