//! Path validator.
//!
//! Vets bucket/key/uploadId strings and synthesizes safe filesystem paths
//! confined to a base directory. Nothing here touches the filesystem except
//! the final canonicalize-and-check, so a rejected input never causes I/O.

use md5::{Digest, Md5};
use std::path::{Component, Path, PathBuf};

use crate::errors::{CoreError, CoreResult};

/// Name of the directory under the base path that holds multipart state.
const MULTIPART_DIR: &str = ".multipart";

/// Validate a bucket name: nonempty, no `/`, `\`, `..`, or NUL.
pub fn validate_bucket_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidKey("bucket name is empty".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(CoreError::InvalidKey(format!(
            "bucket name contains illegal characters: {name}"
        )));
    }
    Ok(())
}

/// Validate an object key: nonempty, no `..` segment, no leading `/` or `\`,
/// no NUL.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::InvalidKey("key is empty".into()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(CoreError::InvalidKey(format!(
            "key has a leading separator: {key}"
        )));
    }
    if key.contains('\0') {
        return Err(CoreError::InvalidKey(format!("key contains NUL: {key}")));
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(CoreError::InvalidKey(format!(
            "key contains a '..' segment: {key}"
        )));
    }
    Ok(())
}

/// Validate an uploadId: exactly 32 lowercase hex characters.
pub fn validate_upload_id(upload_id: &str) -> CoreResult<()> {
    let ok = upload_id.len() == 32
        && upload_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !ok {
        return Err(CoreError::InvalidKey(format!(
            "malformed uploadId: {upload_id}"
        )));
    }
    Ok(())
}

/// Validate a part number: must be in `[1, 10000]`.
pub fn validate_part_number(part_number: u32) -> CoreResult<()> {
    if part_number < 1 || part_number > 10000 {
        return Err(CoreError::InvalidKey(format!(
            "part number out of range: {part_number}"
        )));
    }
    Ok(())
}

/// The first byte of MD5(key) as two lowercase hex characters, used to
/// shard a bucket's objects over 256 directories.
fn shard_for_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());
    hex::encode(&digest[..1])
}

/// Resolve `<base>/<bucket>/<xx>/<key>` and confine it to `base`.
pub fn resolve_object_path(base: &Path, bucket: &str, key: &str) -> CoreResult<PathBuf> {
    validate_bucket_name(bucket)?;
    validate_key(key)?;
    let shard = shard_for_key(key);
    let candidate = base.join(bucket).join(shard).join(key);
    confine(base, &candidate)
}

/// Resolve `<base>/.multipart/<uploadId>/<NNNNN>` and confine it to `base`.
pub fn resolve_part_path(base: &Path, upload_id: &str, part_number: u32) -> CoreResult<PathBuf> {
    validate_upload_id(upload_id)?;
    validate_part_number(part_number)?;
    let candidate = base
        .join(MULTIPART_DIR)
        .join(upload_id)
        .join(format!("{part_number:05}"));
    confine(base, &candidate)
}

/// Resolve `<base>/.multipart/<uploadId>`, confined to `base`.
pub fn resolve_multipart_dir(base: &Path, upload_id: &str) -> CoreResult<PathBuf> {
    validate_upload_id(upload_id)?;
    let candidate = base.join(MULTIPART_DIR).join(upload_id);
    confine(base, &candidate)
}

/// Lexically normalize a joined path (rejecting any `..` component that
/// survived validation, e.g. via a symlink or odd separator) and verify it
/// is confined to `base`. Both steps are required: validation rejects
/// obvious abuse before any path is built; this catches anything that
/// slipped through.
pub fn confine(base: &Path, candidate: &Path) -> CoreResult<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(CoreError::InvalidPath(format!(
                    "path escapes base: {}",
                    candidate.display()
                )));
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let canonical_base = base
        .canonicalize()
        .unwrap_or_else(|_| base.to_path_buf());

    if normalized.exists() {
        let canonical = normalized.canonicalize()?;
        if !canonical.starts_with(&canonical_base) {
            return Err(CoreError::InvalidPath(format!(
                "resolved path escapes base: {}",
                canonical.display()
            )));
        }
        Ok(canonical)
    } else if normalized.starts_with(&canonical_base) || normalized.starts_with(base) {
        Ok(normalized)
    } else {
        Err(CoreError::InvalidPath(format!(
            "resolved path escapes base: {}",
            normalized.display()
        )))
    }
}

/// Resolve an arbitrary (possibly relative) path used by `getObject`,
/// `deleteObject`, and `copyObject` for historical compatibility: these
/// accept paths outside the shard layout and canonicalize against the
/// current working directory.
pub fn confine_legacy(base: &Path, candidate: &Path) -> CoreResult<PathBuf> {
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        std::env::current_dir()?.join(candidate)
    };
    confine(base, &absolute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_bucket() {
        assert!(validate_bucket_name("").is_err());
    }

    #[test]
    fn rejects_traversal_in_bucket() {
        assert!(validate_bucket_name("../etc").is_err());
        assert!(validate_bucket_name("a/b").is_err());
        assert!(validate_bucket_name("a\\b").is_err());
    }

    #[test]
    fn rejects_traversal_in_key() {
        assert!(validate_key("../../etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("/leading").is_err());
        assert!(validate_key("key\0withnull").is_err());
    }

    #[test]
    fn accepts_normal_key() {
        assert!(validate_key("hello.txt").is_ok());
        assert!(validate_key("a/b/c.bin").is_ok());
    }

    #[test]
    fn shard_matches_first_md5_byte() {
        // md5("hello.txt") = 2b00042f7481c7b056c4b410d28f33cf
        assert_eq!(shard_for_key("hello.txt"), "2b");
    }

    #[test]
    fn resolve_object_path_lands_in_shard() {
        let tmp = std::env::temp_dir().join("objectstore-core-path-test");
        let path = resolve_object_path(&tmp, "b1", "hello.txt").unwrap();
        assert!(path.ends_with("b1/2b/hello.txt"));
    }

    #[test]
    fn rejects_malformed_upload_id() {
        assert!(validate_upload_id("not-hex").is_err());
        assert!(validate_upload_id("abc123").is_err());
        assert!(validate_upload_id(&"a".repeat(32)).is_ok());
    }

    #[test]
    fn rejects_out_of_range_part_number() {
        assert!(validate_part_number(0).is_err());
        assert!(validate_part_number(10001).is_err());
        assert!(validate_part_number(1).is_ok());
        assert!(validate_part_number(10000).is_ok());
    }
}
