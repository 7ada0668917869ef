//! Repository path layouts.
//!
//! A layout maps a [`Handle`] to a path relative to the repository root,
//! lists the directories a fresh repository must contain, and parses
//! listed paths back into handles.
//!
//! Two layouts are provided:
//! - `default`: `data/{id[..2]}/{id}`, `keys/`, `locks/`, `snapshots/`, `index/`, `config`
//! - `s3legacy`: `data/{id}`, `key/`, `lock/`, `snapshot/`, `index/`, `config`

use std::fmt;

use crate::handle::{is_id, Handle, ObjectType};

pub const DEFAULT_LAYOUT: &str = "default";
pub const S3_LEGACY_LAYOUT: &str = "s3legacy";
pub const AUTO_LAYOUT: &str = "auto";

const CONFIG_FILE: &str = "config";

pub trait Layout: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Directory holding objects of type `t`, relative to the root.
    /// Empty for the config object, which lives at the root.
    fn dirname(&self, t: ObjectType) -> &'static str;

    /// Whether objects of type `t` are split into two-hex-char subdirectories.
    fn is_sharded(&self, t: ObjectType) -> bool;

    /// Relative path of the object behind `h`.
    fn filename(&self, h: &Handle) -> String {
        if h.object_type == ObjectType::Config {
            return CONFIG_FILE.to_string();
        }
        let dir = self.dirname(h.object_type);
        match h.name.get(..2) {
            Some(shard) if self.is_sharded(h.object_type) => {
                format!("{}/{}/{}", dir, shard, h.name)
            }
            _ => format!("{}/{}", dir, h.name),
        }
    }

    /// Every directory a repository root must contain, parents first.
    fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for t in ObjectType::ALL {
            if t == ObjectType::Config {
                continue;
            }
            let dir = self.dirname(t);
            paths.push(dir.to_string());
            if self.is_sharded(t) {
                for i in 0..=255u8 {
                    paths.push(format!("{}/{:02x}", dir, i));
                }
            }
        }
        paths
    }

    /// Inverse of [`Layout::filename`]. Returns `None` for anything that is
    /// not a well-formed path for an object of type `t`.
    fn parse(&self, t: ObjectType, relative: &str) -> Option<Handle> {
        let relative = relative.trim_matches('/');
        if t == ObjectType::Config {
            return (relative == CONFIG_FILE).then(Handle::config);
        }
        let rest = relative
            .strip_prefix(self.dirname(t))?
            .strip_prefix('/')?;
        let name = if self.is_sharded(t) {
            let (shard, name) = rest.split_once('/')?;
            if shard.len() != 2 || !name.starts_with(shard) {
                return None;
            }
            name
        } else {
            rest
        };
        if name.contains('/') || !is_id(name) {
            return None;
        }
        Some(Handle::new(t, name))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLayout;

impl Layout for DefaultLayout {
    fn name(&self) -> &'static str {
        DEFAULT_LAYOUT
    }

    fn dirname(&self, t: ObjectType) -> &'static str {
        match t {
            ObjectType::Data => "data",
            ObjectType::Key => "keys",
            ObjectType::Lock => "locks",
            ObjectType::Snapshot => "snapshots",
            ObjectType::Index => "index",
            ObjectType::Config => "",
        }
    }

    fn is_sharded(&self, t: ObjectType) -> bool {
        t == ObjectType::Data
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct S3LegacyLayout;

impl Layout for S3LegacyLayout {
    fn name(&self) -> &'static str {
        S3_LEGACY_LAYOUT
    }

    fn dirname(&self, t: ObjectType) -> &'static str {
        match t {
            ObjectType::Data => "data",
            ObjectType::Key => "key",
            ObjectType::Lock => "lock",
            ObjectType::Snapshot => "snapshot",
            ObjectType::Index => "index",
            ObjectType::Config => "",
        }
    }

    fn is_sharded(&self, _t: ObjectType) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown backend layout: {0:?}")]
pub struct UnknownLayout(pub String);

/// Resolve a layout by name. Empty and `auto` fall back to `default_name`.
pub fn resolve(name: &str, default_name: &str) -> Result<Box<dyn Layout>, UnknownLayout> {
    let name = match name.trim() {
        "" | AUTO_LAYOUT => default_name,
        other => other,
    };
    match name {
        DEFAULT_LAYOUT => Ok(Box::new(DefaultLayout)),
        S3_LEGACY_LAYOUT => Ok(Box::new(S3LegacyLayout)),
        other => Err(UnknownLayout(other.to_string())),
    }
}

/// Join a repository root and a relative path with exactly one separator.
pub fn join(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    match (root.is_empty(), relative.is_empty()) {
        (_, true) if root.is_empty() => "/".to_string(),
        (_, true) => root.to_string(),
        (true, false) => format!("/{}", relative),
        (false, false) => format!("{}/{}", root, relative),
    }
}
