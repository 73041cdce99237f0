//! Domain names and messages shared by storage, processor and scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Package identity. Both parts are non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageName {
    pub id: String,
    pub version: String,
}

impl PackageName {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let name = Self {
            id: id.into(),
            version: version.into(),
        };
        debug_assert!(!name.id.is_empty() && !name.version.is_empty());
        name
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.version)
    }
}

/// Lifecycle state of a package slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageState {
    None,
    New,
    Original,
    IndexingQueued,
    Indexing,
    Succeeded,
    DeletingQueued,
    Deleting,
    Deleted,
    Partial,
    DamagedNew,
    DamagedIndexing,
    DamagedDeleting,
}

impl PackageState {
    pub const ALL: [PackageState; 13] = [
        PackageState::None,
        PackageState::New,
        PackageState::Original,
        PackageState::IndexingQueued,
        PackageState::Indexing,
        PackageState::Succeeded,
        PackageState::DeletingQueued,
        PackageState::Deleting,
        PackageState::Deleted,
        PackageState::Partial,
        PackageState::DamagedNew,
        PackageState::DamagedIndexing,
        PackageState::DamagedDeleting,
    ];

    /// Lowercase form used in storage paths and partition keys.
    pub fn storage_name(&self) -> String {
        format!("{:?}", self).to_lowercase()
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for PackageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        PackageState::ALL
            .iter()
            .find(|state| state.storage_name() == lower)
            .copied()
            .ok_or_else(|| format!("Unknown package state: {}", s))
    }
}

/// Content identifier of a stored debug symbol file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolName {
    pub image_name: String,
    pub symbol_hash: String,
}

impl SymbolName {
    pub fn new(image_name: impl Into<String>, symbol_hash: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            symbol_hash: symbol_hash.into(),
        }
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.image_name, self.symbol_hash)
    }
}

/// Content identifier of a stored source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceName {
    pub file_name: String,
    pub hash: String,
}

impl SourceName {
    pub fn new(file_name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_name, self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageName {
    pub name: String,
    pub hash: String,
}

impl ImageName {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: Option<String>,
    pub user_handle: Option<String>,
}

impl UserInfo {
    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            user_handle: None,
        }
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.user_name.as_deref().unwrap_or("anonymous");
        match self.user_handle.as_deref() {
            Some(handle) if !handle.is_empty() => write!(f, "{} ({})", name, handle),
            _ => write!(f, "{}", name),
        }
    }
}

/// Unit of work passed through the scheduler: "this package reached this state".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMessage {
    #[serde(default)]
    pub user_info: UserInfo,
    pub feed_name: Option<String>,
    pub package_state: PackageState,
    pub package_name: PackageName,
}

impl PackageMessage {
    pub fn new(
        user_info: UserInfo,
        feed_name: Option<String>,
        package_state: PackageState,
        package_name: PackageName,
    ) -> Self {
        Self {
            user_info,
            feed_name,
            package_state,
            package_name,
        }
    }
}

impl fmt::Display for PackageMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} as {}",
            self.feed_name.as_deref().unwrap_or(""),
            self.package_state,
            self.package_name,
            self.user_info
        )
    }
}

/// Case-normalizes a feed name. Blank names select the default feed.
pub fn normalize_feed_name(feed_name: Option<&str>) -> Option<String> {
    feed_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_lowercase)
}
