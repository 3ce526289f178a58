use std::fs;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Read size for hashing and for streaming downloads.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Lowercase hex MD5 of a file, the digest format upstream publishes in `md5sums`.
pub fn md5_file_hex(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::fs(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::fs(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn known_digests() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let empty = tmp.path().join("empty");
        let hello = tmp.path().join("hello");
        fs::write(&empty, b"").expect("write empty");
        fs::write(&hello, b"hello").expect("write hello");
        assert_eq!(
            md5_file_hex(&empty).expect("md5"),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            md5_file_hex(&hello).expect("md5"),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn spans_multiple_chunks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("big");
        let data = vec![b'x'; CHUNK_SIZE * 2 + 17];
        fs::write(&path, &data).expect("write big");
        assert_eq!(
            md5_file_hex(&path).expect("md5"),
            hex::encode(Md5::digest(&data))
        );
    }

    #[test]
    fn missing_file_is_filesystem_error() {
        let err = md5_file_hex(Path::new("/nonexistent/imagebuilder.tar.bz2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }
}
