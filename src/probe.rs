use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::error::{DownloadError, DownloadResult};
use crate::hashing::{Checksum, ChecksumAlgorithm};

/// What the metadata probe learned about a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
    pub checksum: Option<Checksum>,
}

/// Issue a HEAD request and check that the server can serve byte ranges.
pub async fn probe(client: &Client, url: &str) -> DownloadResult<BlobInfo> {
    Url::parse(url).map_err(|e| DownloadError::Capability(format!("invalid url {}: {}", url, e)))?;

    let response = client.head(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Capability(format!(
            "HEAD {} returned {}",
            url, status
        )));
    }

    let info = inspect_headers(response.headers())?;
    debug!(url, size = info.size, checksum = ?info.checksum, "probed blob");
    Ok(info)
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl reqwest::header::AsHeaderName,
) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub(crate) fn inspect_headers(headers: &HeaderMap) -> DownloadResult<BlobInfo> {
    let size = header_str(headers, CONTENT_LENGTH)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| DownloadError::Capability("server did not report Content-Length".into()))?;

    match header_str(headers, ACCEPT_RANGES) {
        None => {
            return Err(DownloadError::Capability(
                "server does not advertise Accept-Ranges".into(),
            ))
        }
        Some(unit) if !unit.trim().eq_ignore_ascii_case("bytes") => {
            return Err(DownloadError::Capability(format!(
                "server advertises unsupported range unit {:?}",
                unit
            )))
        }
        Some(_) => {}
    }

    Ok(BlobInfo {
        size,
        checksum: checksum_from_headers(headers),
    })
}

/// `Content-MD5` first, then an RFC 3230 `Digest` header.
fn checksum_from_headers(headers: &HeaderMap) -> Option<Checksum> {
    if let Some(value) = header_str(headers, "content-md5") {
        if !value.trim().is_empty() {
            return Some(Checksum::new(ChecksumAlgorithm::Md5, value));
        }
    }

    let digest = header_str(headers, "digest")?;
    let mut md5 = None;
    for entry in digest.split(',') {
        let Some((algorithm, value)) = entry.trim().split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        match algorithm.to_ascii_lowercase().as_str() {
            "sha-256" => return Some(Checksum::new(ChecksumAlgorithm::Sha256, value)),
            "md5" => md5 = Some(Checksum::new(ChecksumAlgorithm::Md5, value)),
            _ => {}
        }
    }
    md5
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn accepts_byte_ranges_with_md5() {
        let info = inspect_headers(&headers(&[
            ("content-length", "10000000"),
            ("accept-ranges", "bytes"),
            ("content-md5", "XrY7u+Ae7tCTyyK7j1rNww=="),
        ]))
        .unwrap();
        assert_eq!(info.size, 10_000_000);
        assert_eq!(
            info.checksum,
            Some(Checksum::new(ChecksumAlgorithm::Md5, "XrY7u+Ae7tCTyyK7j1rNww=="))
        );
    }

    #[test]
    fn checksum_is_optional() {
        let plain = headers(&[("content-length", "5"), ("accept-ranges", "bytes")]);
        let info = inspect_headers(&plain).unwrap();
        assert_eq!(info.checksum, None);
    }

    #[test]
    fn rejects_missing_length_or_ranges() {
        assert!(matches!(
            inspect_headers(&headers(&[("accept-ranges", "bytes")])),
            Err(DownloadError::Capability(_))
        ));
        assert!(matches!(
            inspect_headers(&headers(&[("content-length", "5")])),
            Err(DownloadError::Capability(_))
        ));
        assert!(matches!(
            inspect_headers(&headers(&[("content-length", "5"), ("accept-ranges", "none")])),
            Err(DownloadError::Capability(_))
        ));
        assert!(matches!(
            inspect_headers(&headers(&[("content-length", "5"), ("accept-ranges", "items")])),
            Err(DownloadError::Capability(_))
        ));
    }

    #[test]
    fn digest_header_prefers_sha256() {
        let info = inspect_headers(&headers(&[
            ("content-length", "5"),
            ("accept-ranges", "bytes"),
            (
                "digest",
                "md5=XrY7u+Ae7tCTyyK7j1rNww==, SHA-256=uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=",
            ),
        ]))
        .unwrap();
        assert_eq!(
            info.checksum.map(|c| c.algorithm),
            Some(ChecksumAlgorithm::Sha256)
        );
    }
}
