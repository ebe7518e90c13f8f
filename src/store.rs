use {
    crate::{error::Error, Version},
    std::time::Duration,
};

///
/// Suffix appended to a normalized key to form the key that represents lock ownership.
///
pub const LOCK_SUFFIX: &str = "___lock";

///
/// Immutable snapshot of a key as returned by the store.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

///
/// Expected prior state of a key for a conditional write or delete.
///
/// `MustExist` covers "must exist", "must have version", "must have value" and the
/// version+value combination: every field set to `Some` is checked.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    MustNotExist,
    MustExist {
        version: Option<Version>,
        value: Option<Vec<u8>>,
    },
}

impl Precondition {
    pub fn must_exist() -> Self {
        Precondition::MustExist {
            version: None,
            value: None,
        }
    }

    pub fn version(version: Version) -> Self {
        Precondition::MustExist {
            version: Some(version),
            value: None,
        }
    }

    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Precondition::MustExist {
            version: None,
            value: Some(value.into()),
        }
    }

    ///
    /// Adds a value check on top of an existence or version precondition.
    /// A `MustNotExist` precondition is returned unchanged.
    ///
    pub fn with_value(self, expected: impl Into<Vec<u8>>) -> Self {
        match self {
            Precondition::MustNotExist => Precondition::MustNotExist,
            Precondition::MustExist { version, .. } => Precondition::MustExist {
                version,
                value: Some(expected.into()),
            },
        }
    }

    pub fn requires_existence(&self) -> bool {
        matches!(self, Precondition::MustExist { .. })
    }

    ///
    /// Checks the precondition against the current state of a key, `None` meaning absent.
    ///
    pub fn check(&self, current: Option<&VersionedValue>) -> Result<(), Error> {
        match (self, current) {
            (Precondition::MustNotExist, None) => Ok(()),
            (Precondition::MustNotExist, Some(_)) => Err(Error::AlreadyExists),
            (Precondition::MustExist { .. }, None) => Err(Error::NotFound),
            (Precondition::MustExist { version, value }, Some(current)) => {
                if version.is_some_and(|v| v != current.version) {
                    return Err(Error::VersionConflict);
                }
                if value.as_ref().is_some_and(|v| *v != current.value) {
                    return Err(Error::VersionConflict);
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    Expired,
}

impl Action {
    ///
    /// True for the actions after which the key no longer exists.
    ///
    pub fn is_removal(&self) -> bool {
        matches!(self, Action::Deleted | Action::Expired)
    }
}

///
/// A single change observed on a watched key.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: Action,
    pub key: String,
    /// Resulting value, absent for deletions and expirations.
    pub value: Option<VersionedValue>,
    /// Store version at which the change happened, used to resume watching without gaps.
    pub version: Version,
}

///
/// Remote versioned key-value store the coordination primitives are built on.
///
/// Implementations translate their own failure codes into [`Error::NotFound`],
/// [`Error::AlreadyExists`] and [`Error::VersionConflict`] and pass every other failure through.
/// Keys are received already normalized.
///
#[async_trait::async_trait]
pub trait VersionedStore: Send + Sync + 'static {
    async fn read(&self, key: &str, consistent: bool) -> Result<VersionedValue, Error>;

    ///
    /// Store-wide version as of now. Watching after it delivers every later change.
    ///
    async fn current_version(&self) -> Result<Version, Error>;

    ///
    /// Writes `value` at `key`, optionally guarded by a precondition and bound to a TTL.
    /// Writing without a TTL clears any TTL the key had.
    ///
    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        precondition: Option<&Precondition>,
        ttl: Option<Duration>,
    ) -> Result<VersionedValue, Error>;

    async fn delete(&self, key: &str, precondition: Option<&Precondition>) -> Result<(), Error>;

    ///
    /// Long-polls for the next change on `key` strictly after version `after`,
    /// or after the store's current version when `after` is `None`.
    ///
    async fn watch(&self, key: &str, after: Option<Version>) -> Result<ChangeEvent, Error>;

    ///
    /// Same as [`VersionedStore::watch`] for any key starting with `prefix`.
    ///
    async fn watch_prefix(&self, prefix: &str, after: Option<Version>)
        -> Result<ChangeEvent, Error>;

    async fn list(&self, prefix: &str, consistent: bool) -> Result<Vec<VersionedValue>, Error>;

    async fn delete_tree(&self, prefix: &str) -> Result<(), Error>;
}

///
/// Normalizes a user key: leading and trailing slashes are stripped and empty segments collapsed.
///
pub fn normalize(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn is_mutex_key(key: &str) -> bool {
    key.ends_with(LOCK_SUFFIX)
}

pub fn mutex_key(key: &str) -> String {
    format!("{}{LOCK_SUFFIX}", normalize(key))
}
