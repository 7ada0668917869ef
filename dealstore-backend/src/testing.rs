//! In-memory stand-ins for the gateway and the deal API.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use dealstore_common::ObjectReader;

use crate::api::{
    ApiError, ApplyOptions, ContentId, ContentStore, DealApi, DealJobState, Entry, JobId,
    Session, StagedContent, Stat, NO_FILE_SIGNATURE,
};
use crate::config::{BatchConfig, Config};
use crate::staging::tree_entries;

pub const ROOT: &str = "/repo-a";

/// A 64-char lowercase hex id derived from `seed`.
pub fn id(seed: u8) -> String {
    hex::encode(Sha256::digest([seed]))
}

pub fn config(staging: &Path) -> Config {
    Config {
        token: "secret".to_string(),
        server_addr: "127.0.0.1:5002".to_string(),
        gateway_addr: "127.0.0.1:6002".to_string(),
        layout: "auto".to_string(),
        backup_root: ROOT.to_string(),
        connections: 4,
        test_timeout_ms: 3_000,
        staging_dir: Some(staging.to_path_buf()),
        bypass_init_check: false,
        batch: BatchConfig {
            max_entries: 1,
            max_bytes: 1 << 20,
            max_age_ms: 60_000,
        },
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { cid: ContentId, data: Bytes },
}

#[derive(Debug, Clone)]
enum Upload {
    /// Relative paths of a staged tree; `None` marks a directory.
    Tree(Vec<(String, Option<(ContentId, Bytes)>)>),
    File(Bytes),
}

fn missing(path: &str) -> ApiError {
    ApiError::from_remote(500, format!("{}: {}", NO_FILE_SIGNATURE, path), path)
}

fn parents(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        out.push(path[..end].to_string());
    }
    out
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    uploads: Mutex<HashMap<ContentId, Upload>>,
    seq: AtomicUsize,
    /// Message every `ls` fails with while set.
    pub ls_error: Mutex<Option<String>>,
    /// Message every `stat` fails with while set.
    pub stat_error: Mutex<Option<String>>,
    pub stat_delay: Mutex<Option<Duration>>,
    pub fail_stage: AtomicBool,
    pub stage_calls: AtomicUsize,
    pub link_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn contains(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().unwrap().get(path), Some(Node::Dir))
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Place a file directly, bypassing staging.
    pub fn put(&self, path: &str, data: &[u8]) {
        let mut nodes = self.nodes.lock().unwrap();
        for dir in parents(path) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        nodes.insert(
            path.to_string(),
            Node::File {
                cid: file_cid(data),
                data: Bytes::copy_from_slice(data),
            },
        );
    }

    pub fn mkdir(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        for dir in parents(path) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn stages(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
    }
}

fn file_cid(data: &[u8]) -> ContentId {
    ContentId(format!("bafk{}", &hex::encode(Sha256::digest(data))[..32]))
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn ls(&self, _session: &Session, path: &str) -> Result<Vec<Entry>, ApiError> {
        if let Some(message) = self.ls_error.lock().unwrap().clone() {
            return Err(ApiError::from_remote(500, message, path));
        }
        let nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(missing(path));
        }
        let prefix = format!("{}/", path);
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, node)| Entry {
                name: k[prefix.len()..].to_string(),
                size: match node {
                    Node::File { data, .. } => data.len() as u64,
                    Node::Dir => 0,
                },
                is_dir: matches!(node, Node::Dir),
            })
            .collect())
    }

    async fn stat(&self, _session: &Session, path: &str) -> Result<Stat, ApiError> {
        let error = self.stat_error.lock().unwrap().clone();
        if let Some(message) = error {
            return Err(ApiError::from_remote(401, message, path));
        }
        let delay = *self.stat_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File { cid, data }) => Ok(Stat {
                hash: cid.clone(),
                size: data.len() as u64,
                is_dir: false,
            }),
            Some(Node::Dir) => Ok(Stat {
                hash: ContentId(format!("bafydir{}", path.replace('/', "-"))),
                size: 0,
                is_dir: true,
            }),
            None => Err(missing(path)),
        }
    }

    async fn read(
        &self,
        _session: &Session,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, ApiError> {
        let data = self.file(path).ok_or_else(|| missing(path))?;
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(length) => (start + length as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(Cursor::new(data.slice(start..end).to_vec())))
    }

    async fn remove(&self, _session: &Session, path: &str) -> Result<(), ApiError> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.remove(path).is_none() {
            return Err(missing(path));
        }
        let prefix = format!("{}/", path);
        nodes.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn stage(&self, _session: &Session, dir: &Path) -> Result<StagedContent, ApiError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stage.load(Ordering::SeqCst) {
            return Err(ApiError::Remote {
                status: 502,
                message: "gateway unavailable".to_string(),
            });
        }
        let mut tree = Vec::new();
        let mut entries = HashMap::new();
        let mut uploads = self.uploads.lock().unwrap();
        for entry in tree_entries(dir)? {
            if entry.is_dir {
                let cid = ContentId(format!(
                    "bafydir{}",
                    self.seq.fetch_add(1, Ordering::SeqCst)
                ));
                entries.insert(entry.relative.clone(), cid);
                tree.push((entry.relative, None));
            } else {
                let data = Bytes::from(std::fs::read(&entry.path)?);
                let cid = file_cid(&data);
                uploads.insert(cid.clone(), Upload::File(data.clone()));
                entries.insert(entry.relative.clone(), cid.clone());
                tree.push((entry.relative, Some((cid, data))));
            }
        }
        let root = ContentId(format!(
            "bafyroot{}",
            self.seq.fetch_add(1, Ordering::SeqCst)
        ));
        uploads.insert(root.clone(), Upload::Tree(tree));
        Ok(StagedContent { root, entries })
    }

    async fn link(&self, _session: &Session, content: &ContentId, path: &str) -> Result<(), ApiError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .get(content)
            .cloned()
            .ok_or_else(|| ApiError::Remote {
                status: 500,
                message: format!("block {} not found", content),
            })?;
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Err(ApiError::Remote {
                status: 500,
                message: "directory already has entry by that name".to_string(),
            });
        }
        for dir in parents(path) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        match upload {
            Upload::File(data) => {
                nodes.insert(
                    path.to_string(),
                    Node::File {
                        cid: content.clone(),
                        data,
                    },
                );
            }
            Upload::Tree(tree) => {
                nodes.insert(path.to_string(), Node::Dir);
                for (relative, file) in tree {
                    let node = match file {
                        Some((cid, data)) => Node::File { cid, data },
                        None => Node::Dir,
                    };
                    nodes.insert(format!("{}/{}", path, relative), node);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeals {
    seq: AtomicUsize,
    pub fail_apply: AtomicBool,
    pub applied: Mutex<Vec<(ContentId, bool)>>,
}

impl MemoryDeals {
    pub fn applied(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl DealApi for MemoryDeals {
    async fn apply(
        &self,
        _session: &Session,
        content: &ContentId,
        options: ApplyOptions,
    ) -> Result<JobId, ApiError> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ApiError::Remote {
                status: 400,
                message: "deal rejected".to_string(),
            });
        }
        self.applied
            .lock()
            .unwrap()
            .push((content.clone(), options.override_config));
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(JobId(format!("job-{}", n)))
    }

    async fn job_status(&self, _session: &Session, job: &JobId) -> Result<DealJobState, ApiError> {
        let n: usize = job
            .0
            .strip_prefix("job-")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if n == 0 || n > self.seq.load(Ordering::SeqCst) {
            return Err(ApiError::Remote {
                status: 404,
                message: format!("job {} not found", job),
            });
        }
        Ok(DealJobState::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents() {
        assert_eq!(parents("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
        assert!(parents("/a").is_empty());
    }
}
