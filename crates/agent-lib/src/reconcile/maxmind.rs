//! Conditional refresh of the maxmind database

use crate::fsutil::{atomic_write, FileOwnership};
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::header::IF_MODIFIED_SINCE;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Issue a conditional GET against the configured database URL. On 200 the
/// body is gunzipped into the config directory and `true` is returned so
/// the caller forces a remap reload; on 304 nothing happens.
pub async fn check_maxmind_update(
    url: &str,
    config_dir: &Path,
    http: &reqwest::Client,
) -> Result<bool> {
    let dest = dest_path(url, config_dir)?;

    let mut req = http.get(url);
    if dest.exists() {
        let meta = std::fs::metadata(&dest)?;
        if let Ok(modified) = meta.modified() {
            let when: chrono::DateTime<chrono::Utc> = modified.into();
            req = req.header(
                IF_MODIFIED_SINCE,
                when.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }
    }

    let resp = req.send().await.with_context(|| format!("GET {url}"))?;
    match resp.status() {
        reqwest::StatusCode::NOT_MODIFIED => Ok(false),
        status if status.is_success() => {
            let body = resp.bytes().await.context("reading maxmind body")?;
            let mut decoder = GzDecoder::new(body.as_ref());
            let mut db = Vec::new();
            decoder
                .read_to_end(&mut db)
                .context("gunzipping maxmind database")?;
            atomic_write(&dest, &db, FileOwnership::root(0o644))
                .with_context(|| format!("writing {}", dest.display()))?;
            info!(dest = %dest.display(), bytes = db.len(), "maxmind database updated");
            Ok(true)
        }
        status => {
            warn!(%status, url, "maxmind fetch returned unexpected status");
            Ok(false)
        }
    }
}

fn dest_path(url: &str, config_dir: &Path) -> Result<PathBuf> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid maxmind URL {url}"))?;
    let name = parsed
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|n| !n.is_empty())
        .context("maxmind URL has no file name")?;
    let name = name.strip_suffix(".gz").unwrap_or(name);
    Ok(config_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use httpmock::{Method::GET, MockServer};
    use std::io::Write;

    fn gzipped(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn test_download_and_gunzip_on_200() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/GeoLite2-City.mmdb.gz");
            then.status(200).body(gzipped(b"binary geo data"));
        });

        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let updated =
            check_maxmind_update(&server.url("/GeoLite2-City.mmdb.gz"), dir.path(), &http)
                .await
                .unwrap();

        assert!(updated);
        let written = std::fs::read(dir.path().join("GeoLite2-City.mmdb")).unwrap();
        assert_eq!(written, b"binary geo data");
    }

    #[tokio::test]
    async fn test_not_modified_is_a_noop() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/GeoLite2-City.mmdb.gz").header_exists("if-modified-since");
            then.status(304);
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GeoLite2-City.mmdb"), b"existing").unwrap();

        let http = reqwest::Client::new();
        let updated =
            check_maxmind_update(&server.url("/GeoLite2-City.mmdb.gz"), dir.path(), &http)
                .await
                .unwrap();

        mock.assert();
        assert!(!updated);
        assert_eq!(std::fs::read(dir.path().join("GeoLite2-City.mmdb")).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_server_error_is_not_an_update() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/db.gz");
            then.status(503);
        });

        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let updated = check_maxmind_update(&server.url("/db.gz"), dir.path(), &http).await.unwrap();
        assert!(!updated);
    }
}
