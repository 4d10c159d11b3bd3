//! Candidate list (CSV) and location table (JSON) loaders.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::classify::LocationTable;
use crate::{Endpoint, LocationRecord};

/// Fatal problem with an input file.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },

    #[error("{}: header has no address or port column", path.display())]
    MissingColumns { path: PathBuf },

    #[error("{}: no valid candidates", path.display())]
    NoCandidates { path: PathBuf },

    #[error("{}: invalid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}: no usable locations", path.display())]
    NoLocations { path: PathBuf },

    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("download of {url} returned an empty body; not saved")]
    EmptyDownload { url: String },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the location table is fetched from when the local copy is missing.
pub const DEFAULT_LOCATIONS_URL: &str = "https://locations-adw.pages.dev";

/// Bounds the whole location download.
pub const LOCATIONS_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn read_to_string(path: &Path) -> Result<String, InputError> {
    std::fs::read_to_string(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Candidates
// ─────────────────────────────────────────────────────────────────────────────

/// Load candidate endpoints from a CSV file with a header row.
pub fn read_candidates(path: &Path) -> Result<Vec<Endpoint>, InputError> {
    let text = read_to_string(path)?;
    let candidates = parse_candidates(&text, path)?;
    tracing::info!(path = %path.display(), count = candidates.len(), "loaded candidates");
    Ok(candidates)
}

/// Parse candidate CSV text. `path` is only used in errors.
///
/// The address column is the first header containing `IP`/`ip`; the port
/// column is the first containing `port` (any case) or `端口`. Rows with a
/// bad address or port are skipped; repeated endpoints are kept once.
pub fn parse_candidates(text: &str, path: &Path) -> Result<Vec<Endpoint>, InputError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
        });
    };

    let headers: Vec<&str> = header
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(str::trim)
        .collect();
    let ip_col = headers
        .iter()
        .position(|h| h.contains("IP") || h.contains("ip"));
    let port_col = headers
        .iter()
        .position(|h| h.to_ascii_lowercase().contains("port") || h.contains("端口"));
    let (Some(ip_col), Some(port_col)) = (ip_col, port_col) else {
        return Err(InputError::MissingColumns {
            path: path.to_path_buf(),
        });
    };
    tracing::debug!(ip_col, port_col, "candidate columns");

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut skipped = 0usize;
    for line in lines {
        let columns: Vec<&str> = line.split(',').collect();
        let (Some(ip), Some(port)) = (columns.get(ip_col), columns.get(port_col)) else {
            skipped += 1;
            continue;
        };
        match Endpoint::from_parts(ip, port) {
            Ok(endpoint) => {
                if seen.insert(endpoint) {
                    candidates.push(endpoint);
                }
            }
            Err(e) => {
                skipped += 1;
                tracing::trace!(line, error = %e, "skipping candidate row");
            }
        }
    }
    if skipped > 0 {
        tracing::debug!(skipped, "skipped invalid candidate rows");
    }

    if candidates.is_empty() {
        return Err(InputError::NoCandidates {
            path: path.to_path_buf(),
        });
    }
    Ok(candidates)
}

// ─────────────────────────────────────────────────────────────────────────────
// Locations
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(default)]
    iata: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// Download the location table to `path` unless a file is already there.
/// Returns whether a download happened.
///
/// Only a `200` with a non-blank body is saved; the body is written as
/// received and validated when it is loaded.
pub async fn ensure_locations(path: &Path, url: &str, timeout: Duration) -> Result<bool, InputError> {
    if tokio::fs::metadata(path).await.is_ok() {
        tracing::debug!(path = %path.display(), "location table present");
        return Ok(false);
    }
    tracing::info!(path = %path.display(), url, "location table missing, downloading");

    let download = |source| InputError::Download {
        url: url.to_string(),
        source,
    };
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(download)?;
    let response = client.get(url).send().await.map_err(download)?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(InputError::DownloadStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.text().await.map_err(download)?;
    if body.trim().is_empty() {
        return Err(InputError::EmptyDownload {
            url: url.to_string(),
        });
    }

    tokio::fs::write(path, &body)
        .await
        .map_err(|source| InputError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::info!(path = %path.display(), bytes = body.len(), "location table saved");
    Ok(true)
}

/// Load the location table from a JSON array of `{iata, country, emoji,
/// region}` objects.
pub fn read_locations(path: &Path) -> Result<LocationTable, InputError> {
    let text = read_to_string(path)?;
    let table = parse_locations(&text, path)?;
    tracing::info!(path = %path.display(), locations = table.len(), "loaded location table");
    Ok(table)
}

/// Parse location JSON text. Entries missing `iata`, `country` or `emoji`
/// are skipped.
pub fn parse_locations(text: &str, path: &Path) -> Result<LocationTable, InputError> {
    let raw: Vec<RawLocation> = serde_json::from_str(text).map_err(|source| InputError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let table = LocationTable::from_records(raw.into_iter().filter_map(|entry| {
        let iata = non_empty(entry.iata)?;
        let record = LocationRecord {
            country: non_empty(entry.country)?,
            emoji: non_empty(entry.emoji)?,
            region: entry.region.unwrap_or_default(),
        };
        Some((iata, record))
    }));

    if table.is_empty() {
        return Err(InputError::NoLocations {
            path: path.to_path_buf(),
        });
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, spawn_server, Script, TestServer};
    use std::io::Write;

    fn p() -> &'static Path {
        Path::new("test.csv")
    }

    #[test]
    fn test_parse_candidates_english_header() {
        let csv = "IP Address,Port,Latency\n1.2.3.4,443,10\n5.6.7.8,2053,20\n";
        let eps = parse_candidates(csv, p()).unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].to_string(), "1.2.3.4:443");
        assert_eq!(eps[1].to_string(), "5.6.7.8:2053");
    }

    #[test]
    fn test_parse_candidates_chinese_header_and_column_order() {
        let csv = "端口,IP地址\n8443,104.16.0.1\r\n";
        let eps = parse_candidates(csv, p()).unwrap();
        assert_eq!(eps[0].to_string(), "104.16.0.1:8443");
    }

    #[test]
    fn test_parse_candidates_skips_bad_rows_and_duplicates() {
        let csv = "ip,port\n1.2.3.4,443\nhost.example,443\n1.2.3.4,abc\n1.2.3.4,443\n\n2606:4700::1,443\nshort\n";
        let eps = parse_candidates(csv, p()).unwrap();
        let shown: Vec<String> = eps.iter().map(ToString::to_string).collect();
        assert_eq!(shown, vec!["1.2.3.4:443", "[2606:4700::1]:443"]);
    }

    #[test]
    fn test_parse_candidates_missing_columns() {
        let err = parse_candidates("address,number\n1.2.3.4,443\n", p()).unwrap_err();
        assert!(matches!(err, InputError::MissingColumns { .. }));
    }

    #[test]
    fn test_parse_candidates_empty_and_no_valid_rows() {
        assert!(matches!(parse_candidates("\n\n", p()).unwrap_err(), InputError::Empty { .. }));
        assert!(matches!(
            parse_candidates("ip,port\nx,y\n", p()).unwrap_err(),
            InputError::NoCandidates { .. }
        ));
    }

    #[test]
    fn test_parse_locations() {
        let json = r#"[
            {"iata": "NRT", "country": "JP", "emoji": "🇯🇵", "region": "Asia Pacific"},
            {"iata": "LAX", "country": "US", "emoji": "🇺🇸"},
            {"iata": "", "country": "XX", "emoji": "x"},
            {"country": "YY", "emoji": "y"}
        ]"#;
        let table = parse_locations(json, Path::new("locations.json")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("NRT").unwrap().region, "Asia Pacific");
        assert_eq!(table.get("LAX").unwrap().region, "");
    }

    #[test]
    fn test_parse_locations_errors() {
        let path = Path::new("locations.json");
        assert!(matches!(parse_locations("{", path).unwrap_err(), InputError::Json { .. }));
        assert!(matches!(parse_locations("[]", path).unwrap_err(), InputError::NoLocations { .. }));
    }

    #[test]
    fn test_read_candidates_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "IP,port").unwrap();
        writeln!(file, "9.9.9.9,443").unwrap();
        let eps = read_candidates(file.path()).unwrap();
        assert_eq!(eps.len(), 1);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_locations(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, InputError::Read { .. }));
        assert!(err.to_string().contains("missing.json"));
    }

    // ── location download ──────────────────────────────────────────────────

    const LOCATIONS: &str = r#"[{"iata": "NRT", "country": "JP", "emoji": "🇯🇵", "region": "Asia Pacific"}]"#;

    fn url_of(server: &TestServer) -> String {
        format!("http://{}/", server.endpoint)
    }

    #[tokio::test]
    async fn test_ensure_locations_downloads_when_missing() {
        let server = spawn_server(Script::Respond(vec![ok_response(LOCATIONS)]), false).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.json");

        let fetched = ensure_locations(&path, &url_of(&server), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(fetched);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), LOCATIONS);
        assert_eq!(read_locations(&path).unwrap().get("NRT").unwrap().country, "JP");
    }

    #[tokio::test]
    async fn test_ensure_locations_keeps_existing_file() {
        let server = spawn_server(Script::Respond(vec![ok_response("[]")]), false).await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{LOCATIONS}").unwrap();

        let fetched = ensure_locations(file.path(), &url_of(&server), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!fetched);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), LOCATIONS);
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn test_ensure_locations_rejects_non_200() {
        let reply = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec();
        let server = spawn_server(Script::Respond(vec![reply]), false).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.json");

        let err = ensure_locations(&path, &url_of(&server), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::DownloadStatus { status: 404, .. }), "{err}");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ensure_locations_refuses_blank_body() {
        let server = spawn_server(Script::Respond(vec![ok_response(" \n ")]), false).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.json");

        let err = ensure_locations(&path, &url_of(&server), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::EmptyDownload { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ensure_locations_unreachable_host() {
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.json");

        let url = format!("http://127.0.0.1:{port}/");
        let err = ensure_locations(&path, &url, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::Download { .. }));
        assert!(!path.exists());
    }
}
