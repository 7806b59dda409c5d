use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use zoo_common::work::ContentHashes;

use crate::error::DownloadError;

/// An artifact fetched to local disk, with the hashes of its content.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub hashes: ContentHashes,
}

/// Where an artifact lands on disk. Only the final path component of the
/// declared filename is used, so a descriptor cannot escape the download
/// directory.
pub fn artifact_path(directory: &Path, filename: &str) -> PathBuf {
    let name = Path::new(filename)
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    directory.join(name)
}

/// Fetch an artifact, preferring `primary` and falling back to `secondary`
/// when it is set and different. Exactly one error comes back when no bytes
/// arrived from either location.
pub async fn fetch(
    client: &reqwest::Client,
    primary: &str,
    secondary: &str,
    destination: &Path,
    timeout: Duration,
) -> Result<FetchedArtifact, DownloadError> {
    let body = match fetch_bytes(client, primary, timeout).await {
        Ok(body) => body,
        Err(primary_error) => {
            if secondary.is_empty() || secondary == primary {
                return Err(primary_error);
            }
            warn!(
                uri = primary,
                "primary download failed ({}), trying secondary", primary_error
            );
            fetch_bytes(client, secondary, timeout).await?
        }
    };

    let hashes = content_hashes(&body);
    tokio::fs::write(destination, &body).await?;
    debug!(path = %destination.display(), sha256 = %hashes.sha256, "artifact stored");

    Ok(FetchedArtifact {
        path: destination.to_path_buf(),
        hashes,
    })
}

async fn fetch_bytes(
    client: &reqwest::Client,
    uri: &str,
    timeout: Duration,
) -> Result<bytes::Bytes, DownloadError> {
    let response = client
        .get(uri)
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| DownloadError::Request {
            uri: uri.to_owned(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            uri: uri.to_owned(),
            status,
        });
    }

    response.bytes().await.map_err(|source| DownloadError::Request {
        uri: uri.to_owned(),
        source,
    })
}

fn content_hashes(body: &[u8]) -> ContentHashes {
    ContentHashes {
        md5: hex::encode(Md5::digest(body)),
        sha1: hex::encode(Sha1::digest(body)),
        sha256: hex::encode(Sha256::digest(body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("zoo-download-{}-{}", test, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[test]
    fn test_artifact_path_strips_directories() {
        let dir = Path::new("/tmp");
        assert_eq!(artifact_path(dir, "x.exe"), PathBuf::from("/tmp/x.exe"));
        assert_eq!(
            artifact_path(dir, "../../etc/passwd"),
            PathBuf::from("/tmp/passwd")
        );
        assert_eq!(artifact_path(dir, ""), PathBuf::from("/tmp/artifact"));
    }

    #[test]
    fn test_content_hashes_of_one_nul_byte() {
        let hashes = content_hashes(b"\x00");
        assert_eq!(hashes.md5, "93b885adfe0da089cdf634904fd59f71");
        assert_eq!(hashes.sha1, "5ba93c9db0cff93f52b521d7420e43f6eda2784f");
        assert_eq!(
            hashes.sha256,
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d"
        );
    }

    #[tokio::test]
    async fn test_fetch_writes_file_and_hashes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/sample");
            then.status(200).body("\x00");
        });

        let destination = scratch_dir("ok").join("x.exe");
        let fetched = fetch(
            &client(),
            &server.url("/sample"),
            "",
            &destination,
            Duration::from_secs(5),
        )
        .await
        .expect("download should succeed");

        mock.assert_hits(1);
        assert_eq!(fetched.path, destination);
        assert_eq!(fetched.hashes.md5, "93b885adfe0da089cdf634904fd59f71");
        assert_eq!(std::fs::read(&destination).unwrap(), b"\x00");

        std::fs::remove_file(&destination).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_maps_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/sample");
            then.status(500);
        });

        let destination = scratch_dir("status").join("x.exe");
        let result = fetch(
            &client(),
            &server.url("/sample"),
            "",
            &destination,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(DownloadError::Status { .. })));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_secondary() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone");
            then.status(404);
        });
        let mirror = server.mock(|when, then| {
            when.method(GET).path("/mirror");
            then.status(200).body("payload");
        });

        let destination = scratch_dir("fallback").join("x.exe");
        let fetched = fetch(
            &client(),
            &server.url("/gone"),
            &server.url("/mirror"),
            &destination,
            Duration::from_secs(5),
        )
        .await
        .expect("secondary should be used");

        mirror.assert_hits(1);
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");

        std::fs::remove_file(&destination).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_reports_one_failure_when_both_fail() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/mirror");
            then.status(500);
        });

        let destination = scratch_dir("both-fail").join("x.exe");
        let result = fetch(
            &client(),
            &server.url("/gone"),
            &server.url("/mirror"),
            &destination,
            Duration::from_secs(5),
        )
        .await;

        // The secondary's error is the one reported.
        assert!(matches!(result, Err(DownloadError::Status { .. })));
        assert!(!destination.exists());
    }
}
