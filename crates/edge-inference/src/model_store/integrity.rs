use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use super::catalog::ResolvedFile;
use crate::error::DownloadError;

fn compute_sha256(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn compute_blake3(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Check one downloaded file: present, non-empty, declared size, declared digest.
pub async fn verify_file(dir: &Path, file: &ResolvedFile) -> Result<u64, DownloadError> {
    let path = dir.join(&file.name);
    let failed = |reason: String| DownloadError::ValidationFailed {
        file_name: file.name.clone(),
        reason,
    };

    let len = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(_) => return Err(failed("file is missing".into())),
    };
    if len == 0 {
        return Err(failed("file is empty".into()));
    }
    if let Some(expected) = file.size {
        if expected != len {
            return Err(failed(format!("expected {} bytes, found {}", expected, len)));
        }
    }

    if file.sha256.is_none() && file.blake3.is_none() {
        return Ok(len);
    }

    let owned: PathBuf = path.clone();
    let (sha_expected, blake_expected) = (file.sha256.clone(), file.blake3.clone());
    let digests = tokio::task::spawn_blocking(move || -> std::io::Result<(Option<String>, Option<String>)> {
        let sha = match sha_expected {
            Some(_) => Some(compute_sha256(&owned)?),
            None => None,
        };
        let blake = match blake_expected {
            Some(_) => Some(compute_blake3(&owned)?),
            None => None,
        };
        Ok((sha, blake))
    })
    .await
    .map_err(|e| failed(format!("checksum task failed: {}", e)))?
    .map_err(|e| DownloadError::io(file.name.clone(), e))?;

    let mismatch = |expected: &Option<String>, actual: &Option<String>| match (expected, actual) {
        (Some(e), Some(a)) => !e.eq_ignore_ascii_case(a),
        _ => false,
    };
    if mismatch(&file.sha256, &digests.0) {
        return Err(failed("sha256 mismatch".into()));
    }
    if mismatch(&file.blake3, &digests.1) {
        return Err(failed("blake3 mismatch".into()));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(name: &str) -> ResolvedFile {
        ResolvedFile {
            name: name.into(),
            file_type: "model".into(),
            urls: vec![],
            size: None,
            sha256: None,
            blake3: None,
        }
    }

    #[tokio::test]
    async fn test_verify_size_and_digests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"hello").unwrap();

        let mut file = resolved("a.bin");
        file.size = Some(5);
        file.sha256 =
            Some("2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824".into());
        file.blake3 = Some(blake3::hash(b"hello").to_hex().to_string());
        assert_eq!(verify_file(dir.path(), &file).await.unwrap(), 5);

        file.size = Some(6);
        assert!(matches!(
            verify_file(dir.path(), &file).await,
            Err(DownloadError::ValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_digest_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"hello").unwrap();
        std::fs::write(dir.path().join("empty.bin"), b"").unwrap();

        let mut file = resolved("a.bin");
        file.sha256 = Some("00".repeat(32));
        let err = verify_file(dir.path(), &file).await.unwrap_err();
        assert_eq!(err.file_name(), Some("a.bin"));

        assert!(verify_file(dir.path(), &resolved("empty.bin")).await.is_err());
        assert!(verify_file(dir.path(), &resolved("missing.bin")).await.is_err());
    }
}
