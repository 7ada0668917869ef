use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded object id.
pub const ID_HEX_LEN: usize = 64;

/// The kinds of objects a repository stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Data,
    Key,
    Lock,
    Snapshot,
    Index,
    Config,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::Data,
        ObjectType::Key,
        ObjectType::Lock,
        ObjectType::Snapshot,
        ObjectType::Index,
        ObjectType::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Data => "data",
            ObjectType::Key => "key",
            ObjectType::Lock => "lock",
            ObjectType::Snapshot => "snapshot",
            ObjectType::Index => "index",
            ObjectType::Config => "config",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown object type: {0}")]
pub struct UnknownObjectType(pub String);

impl FromStr for ObjectType {
    type Err = UnknownObjectType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(ObjectType::Data),
            "key" | "keys" => Ok(ObjectType::Key),
            "lock" | "locks" => Ok(ObjectType::Lock),
            "snapshot" | "snapshots" => Ok(ObjectType::Snapshot),
            "index" => Ok(ObjectType::Index),
            "config" => Ok(ObjectType::Config),
            other => Err(UnknownObjectType(other.to_string())),
        }
    }
}

/// Identifies one stored object. The config object has an empty name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub object_type: ObjectType,
    pub name: String,
}

impl Handle {
    pub fn new(object_type: ObjectType, name: impl Into<String>) -> Self {
        Self {
            object_type,
            name: name.into(),
        }
    }

    pub fn config() -> Self {
        Self::new(ObjectType::Config, "")
    }

    /// A handle is valid when its name matches what its type requires:
    /// empty for config, a lowercase hex id for everything else.
    pub fn is_valid(&self) -> bool {
        match self.object_type {
            ObjectType::Config => self.name.is_empty(),
            _ => is_id(&self.name),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.object_type == ObjectType::Config {
            return f.write_str("<config>");
        }
        let end = self
            .name
            .char_indices()
            .nth(8)
            .map_or(self.name.len(), |(i, _)| i);
        let short = &self.name[..end];
        write!(f, "<{}/{}>", self.object_type, short)
    }
}

/// Whether `name` is a well-formed object id.
pub fn is_id(name: &str) -> bool {
    name.len() == ID_HEX_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Name and size of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "c6d21f7eae9b1d3a0b3cf8d7f5d8f0e1a2b3c4d5e6f708192a3b4c5d6e7f8091";

    #[test]
    fn test_is_id() {
        assert!(is_id(ID));
        assert!(!is_id(&ID[..63]));
        assert!(!is_id(&ID.to_uppercase()));
        assert!(!is_id("config"));
    }

    #[test]
    fn test_handle_validity() {
        assert!(Handle::new(ObjectType::Data, ID).is_valid());
        assert!(!Handle::new(ObjectType::Data, "").is_valid());
        assert!(Handle::config().is_valid());
        assert!(!Handle::new(ObjectType::Config, ID).is_valid());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::new(ObjectType::Snapshot, ID).to_string(), "<snapshot/c6d21f7e>");
        assert_eq!(Handle::config().to_string(), "<config>");
    }

    #[test]
    fn test_handle_display_multibyte_name() {
        let h = Handle::new(ObjectType::Key, "abcdefg\u{e9}xyz");
        assert_eq!(h.to_string(), "<key/abcdefg\u{e9}>");
        let h = Handle::new(ObjectType::Key, "abcdefg\u{e9}");
        assert_eq!(h.to_string(), "<key/abcdefg\u{e9}>");
    }

    #[test]
    fn test_object_type_from_str() {
        assert_eq!("locks".parse::<ObjectType>().unwrap(), ObjectType::Lock);
        assert_eq!("data".parse::<ObjectType>().unwrap(), ObjectType::Data);
        assert!("blob".parse::<ObjectType>().is_err());
    }
}
