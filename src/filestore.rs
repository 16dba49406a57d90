//! Content-addressed file store (component B).
//!
//! Objects live under `<base>/<bucket>/<xx>/<key>`, sharded by the first
//! byte of MD5(key) (see [`crate::path`]). Every write follows the
//! crash-only temp-fsync-rename discipline from the local storage backend
//! this was generalized from.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{CoreError, CoreResult};
use crate::path::{self, resolve_multipart_dir, resolve_object_path, resolve_part_path};

const TEMP_DIR: &str = ".tmp";

/// Filesystem-backed object store rooted at `base`.
pub struct FileStore {
    base: PathBuf,
}

/// Outcome of a streamed write: the confined path written to and the
/// object's ETag (hex MD5, unquoted).
#[derive(Debug, Clone)]
pub struct WrittenObject {
    pub path: PathBuf,
    pub etag: String,
    pub size: u64,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>) -> io::Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        std::fs::create_dir_all(base.join(TEMP_DIR))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn temp_path(&self) -> PathBuf {
        self.base.join(TEMP_DIR).join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Stream `reader` into a temp file while tee-ing into an MD5 hasher,
    /// fsync, and return the hasher's hex digest plus byte count. The temp
    /// file is left in place for the caller to rename.
    fn write_temp(&self, mut reader: impl Read) -> CoreResult<(PathBuf, String, u64)> {
        let tmp_path = self.temp_path();
        let mut file = File::create(&tmp_path)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(CoreError::from(e));
                }
            };
            if let Err(e) = file.write_all(&buf[..n]) {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(CoreError::from(e));
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        if let Err(e) = file.sync_all() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(CoreError::from(e));
        }
        Ok((tmp_path, hex::encode(hasher.finalize()), total))
    }

    /// Write `reader`'s bytes to the object's sharded path, fsync, rename
    /// into place. Removes the partial file on any error.
    pub fn put_object(&self, bucket: &str, key: &str, reader: impl Read) -> CoreResult<WrittenObject> {
        let final_path = resolve_object_path(&self.base, bucket, key)?;
        let (tmp_path, etag, size) = self.write_temp(reader)?;

        if let Some(parent) = final_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(CoreError::from(e));
            }
        }
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(CoreError::from(e));
        }
        Ok(WrittenObject { path: final_path, etag, size })
    }

    /// Open the object at `path` for reading. `path` may be relative to
    /// the current working directory (historical compatibility).
    pub fn get_object(&self, stored_path: &str) -> CoreResult<File> {
        let path = path::confine_legacy(&self.base, Path::new(stored_path))?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CoreError::NotFound(format!("object file missing: {}", path.display()))
            } else {
                CoreError::from(e)
            }
        })
    }

    pub fn delete_object(&self, stored_path: &str) -> CoreResult<()> {
        let path = path::confine_legacy(&self.base, Path::new(stored_path))?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    /// Server-side copy: stream+hash+fsync from `src_stored_path` to the
    /// sharded path for `(dest_bucket, dest_key)`.
    pub fn copy_object(
        &self,
        src_stored_path: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> CoreResult<WrittenObject> {
        let src_path = path::confine_legacy(&self.base, Path::new(src_stored_path))?;
        let src_file = File::open(&src_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CoreError::NotFound(format!("source object missing: {}", src_path.display()))
            } else {
                CoreError::from(e)
            }
        })?;
        self.put_object(dest_bucket, dest_key, src_file)
    }

    pub fn put_part(&self, upload_id: &str, part_number: u32, reader: impl Read) -> CoreResult<(String, u64)> {
        let final_path = resolve_part_path(&self.base, upload_id, part_number)?;
        let (tmp_path, etag, size) = self.write_temp(reader)?;

        if let Some(parent) = final_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(CoreError::from(e));
            }
        }
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(CoreError::from(e));
        }
        Ok((etag, size))
    }

    /// Concatenate the named parts in order into the object path, computing
    /// MD5 of the concatenation as the ETag, then remove the whole
    /// multipart subtree for `upload_id`.
    pub fn merge_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> CoreResult<(String, u64)> {
        let final_path = resolve_object_path(&self.base, bucket, key)?;
        let tmp_path = self.temp_path();

        let result: CoreResult<(String, u64)> = (|| {
            let mut out = File::create(&tmp_path)?;
            let mut hasher = Md5::new();
            let mut total = 0u64;

            for &part_number in part_numbers {
                let part_path = resolve_part_path(&self.base, upload_id, part_number)?;
                let mut part_file = File::open(&part_path)?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = part_file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n])?;
                    hasher.update(&buf[..n]);
                    total += n as u64;
                }
            }
            out.sync_all()?;
            Ok((hex::encode(hasher.finalize()), total))
        })();

        let (etag, total) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        self.abort_multipart_upload(upload_id)?;
        Ok((etag, total))
    }

    /// Remove the entire `.multipart/<uploadId>` subtree. Idempotent.
    pub fn abort_multipart_upload(&self, upload_id: &str) -> CoreResult<()> {
        let dir = resolve_multipart_dir(&self.base, upload_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    /// Walk the tree (skipping `.multipart` and `.tmp`), returning every
    /// regular file whose absolute path is not in `known_paths`.
    pub fn scan_orphan_files(&self, known_paths: &std::collections::HashSet<String>) -> CoreResult<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        self.walk_skip_reserved(&self.base.clone(), &mut |path| {
            let key = path.to_string_lossy().to_string();
            if !known_paths.contains(&key) {
                orphans.push(path.to_path_buf());
            }
        })?;
        Ok(orphans)
    }

    /// Walk `.multipart`, returning every file under an uploadId
    /// subdirectory not present in `active_upload_ids`.
    pub fn scan_multipart_orphans(
        &self,
        active_upload_ids: &std::collections::HashSet<String>,
    ) -> CoreResult<Vec<PathBuf>> {
        let multipart_root = self.base.join(".multipart");
        if !multipart_root.exists() {
            return Ok(Vec::new());
        }
        let mut orphans = Vec::new();
        for entry in std::fs::read_dir(&multipart_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let upload_id = entry.file_name().to_string_lossy().to_string();
            if active_upload_ids.contains(&upload_id) {
                continue;
            }
            for part in std::fs::read_dir(entry.path())? {
                let part = part?;
                if part.file_type()?.is_file() {
                    orphans.push(part.path());
                }
            }
        }
        Ok(orphans)
    }

    fn walk_skip_reserved(
        &self,
        dir: &Path,
        visit: &mut impl FnMut(&Path),
    ) -> CoreResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let name = entry.file_name();
                if dir == self.base && (name == ".multipart" || name == TEMP_DIR) {
                    continue;
                }
                self.walk_skip_reserved(&path, visit)?;
            } else if file_type.is_file() {
                visit(&path);
            }
        }
        Ok(())
    }

    /// After a successful delete, remove empty ancestor directories up to
    /// but not including `base`. Best-effort: failures are ignored.
    pub fn clean_empty_dirs(&self, dir: &Path) {
        let mut current = dir.to_path_buf();
        while current != self.base && current.starts_with(&self.base) {
            match std::fs::read_dir(&current) {
                Ok(mut entries) if entries.next().is_none() => {
                    if std::fs::remove_dir(&current).is_err() {
                        break;
                    }
                }
                _ => break,
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_and_get_round_trip_matches_s1() {
        let (_dir, store) = store();
        let written = store
            .put_object("b1", "hello.txt", Cursor::new(b"Hello, World!"))
            .unwrap();
        assert_eq!(written.etag, "65a8e27d8879283831b664bd8b7f0ad4");
        assert_eq!(written.size, 13);
        assert!(written.path.ends_with("b1/2b/hello.txt"));

        let mut file = store.get_object(&written.path.to_string_lossy()).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"Hello, World!");
    }

    #[test]
    fn merge_parts_matches_s3() {
        let (_dir, store) = store();
        store.put_part("a".repeat(32).as_str(), 1, Cursor::new(b"AAAAA")).unwrap();
        store.put_part("a".repeat(32).as_str(), 2, Cursor::new(b"BBBBB")).unwrap();
        store.put_part("a".repeat(32).as_str(), 3, Cursor::new(b"CCCCC")).unwrap();

        let (etag, size) = store
            .merge_parts("b1", "merged.bin", &"a".repeat(32), &[1, 2, 3])
            .unwrap();
        assert_eq!(size, 15);
        assert_eq!(etag, "f5ef5069d4a64ef15a5a81beed89efe1");

        let upload_dir = store.base().join(".multipart").join("a".repeat(32));
        assert!(!upload_dir.exists());
    }

    #[test]
    fn scan_orphan_files_finds_unknown_file() {
        let (_dir, store) = store();
        let written = store.put_object("b1", "k.txt", Cursor::new(b"x")).unwrap();
        let orphans = store.scan_orphan_files(&HashSet::new()).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0], written.path);

        let mut known = HashSet::new();
        known.insert(written.path.to_string_lossy().to_string());
        assert!(store.scan_orphan_files(&known).unwrap().is_empty());
    }

    #[test]
    fn scan_multipart_orphans_ignores_active_uploads() {
        let (_dir, store) = store();
        let id_a = "a".repeat(32);
        let id_b = "b".repeat(32);
        store.put_part(&id_a, 1, Cursor::new(b"x")).unwrap();
        store.put_part(&id_b, 1, Cursor::new(b"y")).unwrap();

        let mut active = HashSet::new();
        active.insert(id_a.clone());
        let orphans = store.scan_multipart_orphans(&active).unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].to_string_lossy().contains(&id_b));
    }

    #[test]
    fn put_object_rejects_traversal_without_touching_disk() {
        let (_dir, store) = store();
        let err = store
            .put_object("b1", "../escape.txt", Cursor::new(b"x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey(_)));
    }
}
