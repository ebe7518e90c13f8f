use {
    crate::{
        error::Error,
        store::{Precondition, VersionedStore, VersionedValue},
    },
    std::time::Duration,
    tracing::trace,
};

///
/// Result of trying to create a key that must not exist yet.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(VersionedValue),
    Existed,
}

///
/// Writes `value` at `key` if and only if the key's current state satisfies `precondition`.
///
/// Fails with [`Error::VersionConflict`] on a mismatch, [`Error::AlreadyExists`] when
/// [`Precondition::MustNotExist`] meets an existing key and [`Error::NotFound`] when an
/// existence precondition meets an absent key. Every other failure is passed through, nothing is retried.
///
/// The returned version must be used as the precondition of the next conditional operation on the key.
///
pub async fn compare_and_swap(
    store: &dyn VersionedStore,
    key: &str,
    value: impl Into<Vec<u8>>,
    precondition: &Precondition,
    ttl: Option<Duration>,
) -> Result<VersionedValue, Error> {
    let result = store
        .write(key, value.into(), Some(precondition), ttl)
        .await;
    match &result {
        Ok(kv) => trace!("cas {key} succeeded at version {}", kv.version),
        Err(e) => trace!("cas {key} with {precondition:?} failed: {e}"),
    }
    result
}

///
/// Deletes `key` if and only if its current state satisfies `precondition`.
///
/// The precondition must require existence, an unconditional delete goes through
/// [`VersionedStore::delete`] directly.
///
pub async fn compare_and_delete(
    store: &dyn VersionedStore,
    key: &str,
    precondition: &Precondition,
) -> Result<(), Error> {
    if !precondition.requires_existence() {
        return Err(Error::InvalidState(
            "compare-and-delete needs a precondition requiring existence",
        ));
    }
    let result = store.delete(key, Some(precondition)).await;
    if let Err(e) = &result {
        trace!("cad {key} with {precondition:?} failed: {e}");
    }
    result
}

///
/// Creates `key` if absent. An existing key is reported as [`CreateOutcome::Existed`] rather than an error.
///
pub async fn create_if_absent(
    store: &dyn VersionedStore,
    key: &str,
    value: impl Into<Vec<u8>>,
    ttl: Option<Duration>,
) -> Result<CreateOutcome, Error> {
    match compare_and_swap(store, key, value, &Precondition::MustNotExist, ttl).await {
        Ok(kv) => Ok(CreateOutcome::Created(kv)),
        Err(Error::AlreadyExists) => Ok(CreateOutcome::Existed),
        Err(e) => Err(e),
    }
}
