//! Content-store gateway client.
//!
//! The gateway exposes an IPFS-style HTTP API. Repository objects live in
//! its mutable namespace (`files/*`); new content enters through `add`
//! (staging) and is grafted into the namespace with `files/cp`.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::debug;

use dealstore_common::ObjectReader;

use super::transport::{AuthTransport, Session, GATEWAY_AUTH_HEADER};
use super::{check_response, ApiError};
use crate::staging::tree_entries;

/// Name the staged tree's root carries inside an upload.
const STAGE_ROOT: &str = "stage";
const DIRECTORY_MIME: &str = "application/x-directory";

/// Opaque content identifier handed out by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId(pub String);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub hash: ContentId,
    pub size: u64,
    pub is_dir: bool,
}

/// Result of uploading a staged tree.
#[derive(Debug, Clone)]
pub struct StagedContent {
    pub root: ContentId,
    /// Content id of every file and directory, keyed by path relative to the tree root.
    pub entries: HashMap<String, ContentId>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn ls(&self, session: &Session, path: &str) -> Result<Vec<Entry>, ApiError>;

    async fn stat(&self, session: &Session, path: &str) -> Result<Stat, ApiError>;

    /// Stream `length` bytes (or everything, for `None`) starting at `offset`.
    async fn read(
        &self,
        session: &Session,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, ApiError>;

    /// Recursively remove `path` from the namespace.
    async fn remove(&self, session: &Session, path: &str) -> Result<(), ApiError>;

    /// Upload the local tree at `dir`.
    async fn stage(&self, session: &Session, dir: &Path) -> Result<StagedContent, ApiError>;

    /// Make `content` visible at `path`, creating missing parents.
    async fn link(&self, session: &Session, content: &ContentId, path: &str) -> Result<(), ApiError>;
}

pub struct HttpContentStore {
    transport: AuthTransport,
}

#[derive(Debug, Deserialize)]
struct LsResponse {
    #[serde(rename = "Entries", default)]
    entries: Option<Vec<LsEntry>>,
}

#[derive(Debug, Deserialize)]
struct LsEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type", default)]
    kind: u8,
    #[serde(rename = "Size", default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct AddEvent {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: Option<String>,
}

impl HttpContentStore {
    pub fn new(gateway_addr: &str) -> Result<Self, ApiError> {
        Ok(Self {
            transport: AuthTransport::new(gateway_addr, GATEWAY_AUTH_HEADER)?,
        })
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    async fn post(
        &self,
        session: &Session,
        command: &str,
        query: &[(&str, &str)],
        path: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let resp = self
            .transport
            .request(session, Method::POST, &format!("/api/v0/{}", command))?
            .query(query)
            .send()
            .await?;
        check_response(resp, path).await
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn ls(&self, session: &Session, path: &str) -> Result<Vec<Entry>, ApiError> {
        let resp = self
            .post(session, "files/ls", &[("arg", path), ("long", "true")], path)
            .await?;
        let body: LsResponse = resp.json().await?;
        Ok(body
            .entries
            .unwrap_or_default()
            .into_iter()
            .map(|e| Entry {
                name: e.name,
                size: e.size,
                is_dir: e.kind == 1,
            })
            .collect())
    }

    async fn stat(&self, session: &Session, path: &str) -> Result<Stat, ApiError> {
        let resp = self.post(session, "files/stat", &[("arg", path)], path).await?;
        let body: StatResponse = resp.json().await?;
        Ok(Stat {
            hash: ContentId(body.hash),
            size: body.size,
            is_dir: body.kind == "directory",
        })
    }

    async fn read(
        &self,
        session: &Session,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, ApiError> {
        let offset = offset.to_string();
        let count = length.map(|l| l.to_string());
        let mut query = vec![("arg", path), ("offset", offset.as_str())];
        if let Some(count) = count.as_deref() {
            query.push(("count", count));
        }
        let resp = self.post(session, "files/read", &query, path).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn remove(&self, session: &Session, path: &str) -> Result<(), ApiError> {
        self.post(
            session,
            "files/rm",
            &[("arg", path), ("recursive", "true"), ("force", "true")],
            path,
        )
        .await?;
        debug!(path = %path, "Removed");
        Ok(())
    }

    async fn stage(&self, session: &Session, dir: &Path) -> Result<StagedContent, ApiError> {
        let mut form = Form::new().part("file", directory_part(STAGE_ROOT)?);
        for entry in tree_entries(dir)? {
            let name = format!("{}/{}", STAGE_ROOT, entry.relative);
            let part = if entry.is_dir {
                directory_part(&name)?
            } else {
                let data = tokio::fs::read(&entry.path).await?;
                Part::bytes(data)
                    .file_name(urlencoding::encode(&name).into_owned())
                    .mime_str("application/octet-stream")?
            };
            form = form.part("file", part);
        }

        let dir_label = dir.display().to_string();
        let resp = self
            .transport
            .request(session, Method::POST, "/api/v0/add")?
            .query(&[
                ("recursive", "true"),
                ("pin", "false"),
                ("cid-version", "1"),
                ("progress", "false"),
            ])
            .multipart(form)
            .send()
            .await?;
        let body = check_response(resp, &dir_label).await?.text().await?;
        let staged = parse_add_events(&body)?;
        debug!(root = %staged.root, files = staged.entries.len(), "Staged tree");
        Ok(staged)
    }

    async fn link(&self, session: &Session, content: &ContentId, path: &str) -> Result<(), ApiError> {
        let source = format!("/ipfs/{}", content);
        let resp = self
            .transport
            .request(session, Method::POST, "/api/v0/files/cp")?
            .query(&[("arg", source.as_str()), ("arg", path), ("parents", "true")])
            .send()
            .await?;
        check_response(resp, path).await?;
        debug!(path = %path, content = %content, "Linked");
        Ok(())
    }
}

fn directory_part(name: &str) -> Result<Part, ApiError> {
    Ok(Part::bytes(Vec::new())
        .file_name(urlencoding::encode(name).into_owned())
        .mime_str(DIRECTORY_MIME)?)
}

/// Parse the newline-delimited JSON the gateway answers `add` with.
fn parse_add_events(body: &str) -> Result<StagedContent, ApiError> {
    let mut root = None;
    let mut entries = HashMap::new();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let event: AddEvent = serde_json::from_str(line)
            .map_err(|e| ApiError::Decode(format!("add event {:?}: {}", line, e)))?;
        let Some(hash) = event.hash else { continue };
        let name = match urlencoding::decode(&event.name) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => event.name.clone(),
        };
        if name == STAGE_ROOT {
            root = Some(ContentId(hash));
        } else if let Some(relative) = name.strip_prefix(&format!("{}/", STAGE_ROOT)) {
            entries.insert(relative.to_string(), ContentId(hash));
        }
    }
    let root = root.ok_or_else(|| ApiError::Decode("add response has no root entry".to_string()))?;
    Ok(StagedContent { root, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_events() {
        let body = r#"{"Name":"stage/keys/abc","Hash":"bafkreia","Size":"4"}
{"Name":"stage/keys","Hash":"bafybeik","Size":"60"}
{"Name":"stage","Hash":"bafybeiroot","Size":"120"}
"#;
        let staged = parse_add_events(body).unwrap();
        assert_eq!(staged.root, ContentId("bafybeiroot".to_string()));
        assert_eq!(staged.entries["keys/abc"], ContentId("bafkreia".to_string()));
        assert_eq!(staged.entries["keys"], ContentId("bafybeik".to_string()));
        assert_eq!(staged.entries.len(), 2);
    }

    #[test]
    fn test_parse_add_events_skips_progress_lines() {
        let body = "{\"Name\":\"stage/data\",\"Bytes\":1024}\n{\"Name\":\"stage\",\"Hash\":\"bafyroot\"}\n";
        let staged = parse_add_events(body).unwrap();
        assert_eq!(staged.root.0, "bafyroot");
        assert!(staged.entries.is_empty());
    }

    #[test]
    fn test_parse_add_events_requires_root() {
        let body = r#"{"Name":"stage/keys","Hash":"bafybeik"}"#;
        assert!(matches!(parse_add_events(body), Err(ApiError::Decode(_))));
    }

    #[test]
    fn test_ls_response_with_null_entries() {
        let body: LsResponse = serde_json::from_str(r#"{"Entries":null}"#).unwrap();
        assert!(body.entries.is_none());
        let body: LsResponse = serde_json::from_str(
            r#"{"Entries":[{"Name":"ab","Type":1,"Size":0,"Hash":""},{"Name":"x","Type":0,"Size":12,"Hash":""}]}"#,
        )
        .unwrap();
        let entries = body.entries.unwrap();
        assert_eq!(entries[0].kind, 1);
        assert_eq!(entries[1].size, 12);
    }

    #[test]
    fn test_stat_response() {
        let body: StatResponse = serde_json::from_str(
            r#"{"Hash":"bafkreib","Size":42,"CumulativeSize":53,"Blocks":1,"Type":"file"}"#,
        )
        .unwrap();
        assert_eq!(body.hash, "bafkreib");
        assert_eq!(body.size, 42);
        assert_eq!(body.kind, "file");
    }
}
