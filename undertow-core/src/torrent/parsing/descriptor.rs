//! Normalizes magnet links, remote `.torrent` URLs and local files into one
//! descriptor with a canonical `.torrent` copy on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info};

use super::bencode::BencodeParser;
use super::magnet::{MagnetLink, TrackerPolicy};
use super::media::{MediaHints, clean_title};
use super::types::TorrentMetadata;
use crate::torrent::{InfoHash, TorrentError};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for fetched or read torrent files.
const MAX_TORRENT_SIZE: u64 = 32 * 1024 * 1024;

/// Canonical form of a torrent input.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Input as given by the caller.
    pub uri: String,
    pub info_hash: InfoHash,
    pub name: String,
    pub title: String,
    pub private: bool,
    /// Deduplicated, with the tracker policy applied.
    pub trackers: Vec<String>,
    /// Known for torrent files; magnets learn it from peers.
    pub metadata: Option<TorrentMetadata>,
    /// Canonical bencoded bytes matching `torrent_path`.
    pub metainfo: Option<Bytes>,
    /// `<temp>/<infohash>.torrent`, written for torrent files.
    pub torrent_path: Option<PathBuf>,
    pub media: MediaHints,
}

impl TorrentDescriptor {
    pub fn is_magnet(&self) -> bool {
        self.metadata.is_none()
    }

    /// Magnet URI equivalent of this descriptor.
    pub fn magnet_uri(&self) -> String {
        MagnetLink {
            info_hash: self.info_hash,
            display_name: Some(self.name.clone()),
            trackers: self.trackers.clone(),
        }
        .to_uri()
    }

    /// Builds a descriptor from a parsed magnet.
    pub fn from_magnet(uri: &str, magnet: MagnetLink, policy: TrackerPolicy) -> Self {
        let magnet = magnet.with_policy(policy);
        let name = magnet
            .display_name
            .clone()
            .unwrap_or_else(|| magnet.info_hash.to_string());
        Self {
            uri: uri.to_string(),
            info_hash: magnet.info_hash,
            title: clean_title(&name),
            media: MediaHints::from_name(&name),
            name,
            private: false,
            trackers: magnet.trackers,
            metadata: None,
            metainfo: None,
            torrent_path: None,
        }
    }

    /// Decodes torrent bytes; no file is written.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - bytes are not a valid torrent
    pub fn from_metainfo(
        uri: &str,
        data: &[u8],
        policy: TrackerPolicy,
    ) -> Result<Self, TorrentError> {
        let metadata = BencodeParser::parse_bencode_data(data)?;
        let trackers = if metadata.private {
            // Private torrents must only talk to their own trackers.
            TrackerPolicy::AsIs.apply(metadata.announce_urls.clone())
        } else {
            policy.apply(metadata.announce_urls.clone())
        };
        let canonical = BencodeParser::canonical_torrent(data, &trackers)?;
        let name = metadata.name.clone();

        Ok(Self {
            uri: uri.to_string(),
            info_hash: metadata.info_hash,
            title: clean_title(&name),
            media: MediaHints::from_name(&name),
            name,
            private: metadata.private,
            trackers,
            metadata: Some(metadata),
            metainfo: Some(Bytes::from(canonical)),
            torrent_path: None,
        })
    }
}

/// Resolves inputs into descriptors.
pub struct DescriptorResolver {
    client: reqwest::Client,
    temp_dir: PathBuf,
    policy: TrackerPolicy,
}

impl DescriptorResolver {
    /// # Errors
    /// - `TorrentError::Http` - the HTTP client could not be built
    pub fn new(temp_dir: PathBuf, policy: TrackerPolicy) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            temp_dir,
            policy,
        })
    }

    /// Resolves a magnet URI, an `http(s)` URL (optionally followed by
    /// `|Header=value` pairs), a bare info hash, or a local path.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMagnet` - bad magnet or bare hash
    /// - `TorrentError::HttpStatus` / `TorrentError::Http` - remote fetch failed
    /// - `TorrentError::InvalidTorrentFile` - body is not a valid torrent
    /// - `TorrentError::FileNotFound` / `TorrentError::Io` - local file unreadable
    pub async fn resolve(&self, uri: &str) -> Result<TorrentDescriptor, TorrentError> {
        let trimmed = uri.trim();
        if trimmed.starts_with("magnet:") {
            return self.resolve_magnet(uri, trimmed);
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return self.resolve_url(uri, trimmed).await;
        }
        if is_bare_hash(trimmed) {
            let magnet = format!("magnet:?xt=urn:btih:{trimmed}");
            return self.resolve_magnet(uri, &magnet);
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        self.resolve_file(uri, Path::new(path)).await
    }

    fn resolve_magnet(&self, uri: &str, magnet: &str) -> Result<TorrentDescriptor, TorrentError> {
        let link = MagnetLink::parse(magnet)?;
        debug!("Resolved magnet {}", link.info_hash);
        Ok(TorrentDescriptor::from_magnet(uri, link, self.policy))
    }

    async fn resolve_url(&self, uri: &str, raw: &str) -> Result<TorrentDescriptor, TorrentError> {
        let (url, headers) = split_url_headers(raw)?;
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TorrentError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(length) = response.content_length()
            && length > MAX_TORRENT_SIZE
        {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Remote torrent too large: {length} bytes"),
            });
        }
        let body = response.bytes().await?;
        info!("Fetched {} bytes from {}", body.len(), url);
        self.from_body(uri, &body).await
    }

    async fn resolve_file(&self, uri: &str, path: &Path) -> Result<TorrentDescriptor, TorrentError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TorrentError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                TorrentError::Io(e)
            }
        })?;
        if metadata.len() > MAX_TORRENT_SIZE {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Torrent file too large: {} bytes", metadata.len()),
            });
        }
        let body = tokio::fs::read(path).await?;
        self.from_body(uri, &body).await
    }

    async fn from_body(&self, uri: &str, body: &[u8]) -> Result<TorrentDescriptor, TorrentError> {
        if let Some(magnet) = magnet_in_body(body) {
            return self.resolve_magnet(uri, &magnet);
        }

        let mut descriptor = TorrentDescriptor::from_metainfo(uri, body, self.policy)?;
        descriptor.torrent_path = Some(self.persist(&descriptor).await?);
        Ok(descriptor)
    }

    /// Writes the canonical copy to `<temp>/<infohash>.torrent`.
    async fn persist(&self, descriptor: &TorrentDescriptor) -> Result<PathBuf, TorrentError> {
        let path = self.temp_dir.join(format!("{}.torrent", descriptor.info_hash));
        if let Some(bytes) = &descriptor.metainfo {
            tokio::fs::create_dir_all(&self.temp_dir).await?;
            tokio::fs::write(&path, bytes).await?;
            debug!("Wrote canonical torrent {}", path.display());
        }
        Ok(path)
    }
}

/// First line of a body that starts with `magnet:` after leading whitespace.
fn magnet_in_body(body: &[u8]) -> Option<String> {
    let text_start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let text = &body[text_start..];
    if !text.starts_with(b"magnet:") {
        return None;
    }
    let magnet = String::from_utf8_lossy(text);
    magnet.lines().next().map(|line| line.trim().to_string())
}

fn is_bare_hash(candidate: &str) -> bool {
    (candidate.len() == 40 && candidate.chars().all(|c| c.is_ascii_hexdigit()))
        || (candidate.len() == 32
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)))
}

/// Splits `url|Name=value|Other=value` into the URL and request headers.
fn split_url_headers(raw: &str) -> Result<(&str, HeaderMap), TorrentError> {
    let mut parts = raw.split('|');
    let url = parts.next().unwrap_or(raw).trim();
    let mut headers = HeaderMap::new();
    for part in parts {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
            TorrentError::InvalidConfigValue {
                key: name.to_string(),
                reason: format!("invalid header name: {e}"),
            }
        })?;
        let decoded = urlencoding::decode(value.trim())
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.trim().to_string());
        let value = HeaderValue::from_str(&decoded).map_err(|e| TorrentError::InvalidConfigValue {
            key: name.to_string(),
            reason: format!("invalid header value: {e}"),
        })?;
        headers.insert(name, value);
    }
    Ok((url, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    #[tokio::test]
    async fn test_resolve_magnet_applies_policy() {
        let dir = tempfile::tempdir().unwrap();
        let resolver =
            DescriptorResolver::new(dir.path().to_path_buf(), TrackerPolicy::Clear).unwrap();
        let descriptor = resolver
            .resolve("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Movie.2020.720p&tr=udp%3A%2F%2Fa%3A1")
            .await
            .unwrap();

        assert!(descriptor.is_magnet());
        assert!(descriptor.trackers.is_empty());
        assert_eq!(descriptor.title, "Movie");
        assert!(descriptor.torrent_path.is_none());
    }

    #[tokio::test]
    async fn test_resolve_file_writes_canonical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("Film.mkv")
            .piece_length(16 * 1024)
            .file(&["Film.mkv"], 100_000)
            .tracker("udp://tracker.one:80")
            .build()
            .unwrap();
        let source = dir.path().join("input.torrent");
        std::fs::write(&source, &built.bytes).unwrap();

        let temp = dir.path().join("temp");
        let resolver =
            DescriptorResolver::new(temp.clone(), TrackerPolicy::AsIs).unwrap();
        let descriptor = resolver.resolve(source.to_str().unwrap()).await.unwrap();

        assert_eq!(descriptor.info_hash, built.metadata.info_hash);
        assert_eq!(descriptor.trackers, vec!["udp://tracker.one:80"]);
        let path = descriptor.torrent_path.clone().unwrap();
        assert_eq!(path, temp.join(format!("{}.torrent", built.metadata.info_hash)));
        let reloaded = BencodeParser::parse_bencode_data(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(reloaded.info_hash, descriptor.info_hash);
    }

    #[tokio::test]
    async fn test_file_containing_magnet_is_reentered() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("link.torrent");
        std::fs::write(
            &source,
            "\nmagnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=x\n",
        )
        .unwrap();
        let resolver =
            DescriptorResolver::new(dir.path().to_path_buf(), TrackerPolicy::AsIs).unwrap();
        let descriptor = resolver.resolve(source.to_str().unwrap()).await.unwrap();
        assert!(descriptor.is_magnet());
        assert_eq!(descriptor.name, "x");
    }

    #[tokio::test]
    async fn test_missing_file_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let resolver =
            DescriptorResolver::new(dir.path().to_path_buf(), TrackerPolicy::AsIs).unwrap();

        let missing = resolver.resolve("/definitely/not/here.torrent").await;
        assert!(matches!(missing, Err(TorrentError::FileNotFound { .. })));

        let garbage = dir.path().join("garbage.torrent");
        std::fs::write(&garbage, b"not bencode").unwrap();
        let result = resolver.resolve(garbage.to_str().unwrap()).await;
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }

    #[tokio::test]
    async fn test_bare_hash_becomes_magnet() {
        let dir = tempfile::tempdir().unwrap();
        let resolver =
            DescriptorResolver::new(dir.path().to_path_buf(), TrackerPolicy::AsIs).unwrap();
        let descriptor = resolver
            .resolve("0123456789ABCDEF0123456789ABCDEF01234567")
            .await
            .unwrap();
        assert_eq!(
            descriptor.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_split_url_headers() {
        let (url, headers) =
            split_url_headers("https://host/file.torrent|Referer=https%3A%2F%2Fhost%2F|Cookie=a=b")
                .unwrap();
        assert_eq!(url, "https://host/file.torrent");
        assert_eq!(headers.get("referer").unwrap(), "https://host/");
        assert_eq!(headers.get("cookie").unwrap(), "a=b");
    }

    #[test]
    fn test_split_url_headers_skips_bare_parts() {
        let (url, headers) =
            split_url_headers(" http://host/a.torrent |novalue|X-Token=abc").unwrap();
        assert_eq!(url, "http://host/a.torrent");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-token").unwrap(), "abc");

        let bad = split_url_headers("http://host/a.torrent|Bad Name=1");
        assert!(matches!(bad, Err(TorrentError::InvalidConfigValue { .. })));
    }

    #[test]
    fn test_magnet_in_body() {
        assert_eq!(
            magnet_in_body(b"  \r\nmagnet:?xt=urn:btih:abc \nsecond line").as_deref(),
            Some("magnet:?xt=urn:btih:abc")
        );
        assert_eq!(magnet_in_body(b"d8:announce"), None);
        assert_eq!(magnet_in_body(b""), None);
        assert_eq!(magnet_in_body(b"see magnet:?xt=urn:btih:abc"), None);
    }

    fn local_resolver(dir: &Path) -> DescriptorResolver {
        DescriptorResolver {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            temp_dir: dir.to_path_buf(),
            policy: TrackerPolicy::AsIs,
        }
    }

    /// Answers one request with `status` and `body`; yields the request head.
    async fn serve_once(status: &str, body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/file.torrent", listener.local_addr().unwrap());
        let status = status.to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_remote_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = local_resolver(dir.path());
        let (url, server) = serve_once("404 Not Found", b"gone".to_vec()).await;

        let result = resolver.resolve(&format!("{url}|X-Token=abc")).await;
        match result {
            Err(TorrentError::HttpStatus { status, url: failed }) => {
                assert_eq!(status, 404);
                assert_eq!(failed, url);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(server.await.unwrap().contains("x-token: abc"));
    }

    #[tokio::test]
    async fn test_remote_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = local_resolver(dir.path());

        let (url, server) = serve_once(
            "200 OK",
            b"magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=remote\n".to_vec(),
        )
        .await;
        let descriptor = resolver.resolve(&url).await.unwrap();
        assert!(descriptor.is_magnet());
        assert_eq!(descriptor.name, "remote");
        assert_eq!(descriptor.uri, url);
        server.await.unwrap();

        let (url, server) = serve_once("200 OK", b"<html>not a torrent</html>".to_vec()).await;
        let result = resolver.resolve(&url).await;
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
        server.await.unwrap();

        let built = TorrentBuilder::new("Remote.mkv")
            .piece_length(16 * 1024)
            .file(&["Remote.mkv"], 50_000)
            .build()
            .unwrap();
        let (url, server) = serve_once("200 OK", built.bytes.to_vec()).await;
        let descriptor = resolver.resolve(&url).await.unwrap();
        assert_eq!(descriptor.info_hash, built.metadata.info_hash);
        assert!(descriptor.torrent_path.unwrap().exists());
        server.await.unwrap();
    }

    #[test]
    fn test_private_torrent_keeps_own_trackers() {
        let built = TorrentBuilder::new("p.mkv")
            .file(&["p.mkv"], 10)
            .tracker("https://private.example/announce")
            .private(true)
            .build()
            .unwrap();
        let descriptor =
            TorrentDescriptor::from_metainfo("x", &built.bytes, TrackerPolicy::AddDefaults)
                .unwrap();
        assert!(descriptor.private);
        assert_eq!(descriptor.trackers, vec!["https://private.example/announce"]);
    }
}
