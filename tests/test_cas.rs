use kv_mutex::{
    cas::{compare_and_delete, compare_and_swap, create_if_absent, CreateOutcome},
    Error, Precondition, VersionedStore,
};

mod common;

#[tokio::test]
async fn successful_cas_versions_should_be_strictly_increasing() {
    let (backend, _) = common::memory_store();

    let mut kv = compare_and_swap(&backend, "k", "0", &Precondition::MustNotExist, None)
        .await
        .expect("create");
    for i in 1..10 {
        let next = compare_and_swap(
            &backend,
            "k",
            i.to_string(),
            &Precondition::version(kv.version),
            None,
        )
        .await
        .expect("cas");
        assert!(next.version > kv.version);
        kv = next;
    }
    assert_eq!(backend.read("k", true).await.expect("read"), kv);
}

#[tokio::test]
async fn stale_version_should_be_rejected() {
    let (backend, _) = common::memory_store();

    let first = compare_and_swap(&backend, "k", "a", &Precondition::MustNotExist, None)
        .await
        .expect("create");
    compare_and_swap(&backend, "k", "b", &Precondition::version(first.version), None)
        .await
        .expect("cas");

    let result = compare_and_swap(&backend, "k", "c", &Precondition::version(first.version), None)
        .await;
    assert!(matches!(result, Err(Error::VersionConflict)));
    assert_eq!(backend.read("k", true).await.expect("read").value, b"b");
}

#[tokio::test]
async fn must_not_exist_should_fail_with_already_exists() {
    let (backend, _) = common::memory_store();

    compare_and_swap(&backend, "k", "a", &Precondition::MustNotExist, None)
        .await
        .expect("create");
    let result = compare_and_swap(&backend, "k", "b", &Precondition::MustNotExist, None).await;
    assert!(matches!(result, Err(Error::AlreadyExists)));
}

#[tokio::test]
async fn existence_precondition_on_absent_key_should_fail_with_not_found() {
    let (backend, _) = common::memory_store();

    let result = compare_and_swap(&backend, "k", "a", &Precondition::version(1), None).await;
    assert!(matches!(result, Err(Error::NotFound)));
    let result = compare_and_swap(&backend, "k", "a", &Precondition::must_exist(), None).await;
    assert!(matches!(result, Err(Error::NotFound)));
}

#[tokio::test]
async fn value_precondition_should_be_checked_with_version() {
    let (backend, _) = common::memory_store();

    let kv = compare_and_swap(&backend, "k", "a", &Precondition::MustNotExist, None)
        .await
        .expect("create");
    let wrong_value = Precondition::version(kv.version).with_value("z");
    let result = compare_and_swap(&backend, "k", "b", &wrong_value, None).await;
    assert!(matches!(result, Err(Error::VersionConflict)));

    let right = Precondition::version(kv.version).with_value("a");
    compare_and_swap(&backend, "k", "b", &right, None)
        .await
        .expect("cas with version and value");
}

#[tokio::test]
async fn compare_and_delete_should_require_current_version() {
    let (backend, _) = common::memory_store();

    let first = compare_and_swap(&backend, "k", "a", &Precondition::MustNotExist, None)
        .await
        .expect("create");
    let second = compare_and_swap(&backend, "k", "b", &Precondition::version(first.version), None)
        .await
        .expect("cas");

    let stale = compare_and_delete(&backend, "k", &Precondition::version(first.version)).await;
    assert!(matches!(stale, Err(Error::VersionConflict)));

    compare_and_delete(&backend, "k", &Precondition::version(second.version))
        .await
        .expect("delete");
    let gone = compare_and_delete(&backend, "k", &Precondition::version(second.version)).await;
    assert!(matches!(gone, Err(Error::NotFound)));
}

#[tokio::test]
async fn compare_and_delete_should_refuse_must_not_exist() {
    let (backend, _) = common::memory_store();

    let result = compare_and_delete(&backend, "k", &Precondition::MustNotExist).await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn create_if_absent_should_report_existing_key() {
    let (backend, _) = common::memory_store();

    let created = create_if_absent(&backend, "k", "a", None).await.expect("create");
    assert!(matches!(created, CreateOutcome::Created(ref kv) if kv.value == b"a"));

    let existed = create_if_absent(&backend, "k", "b", None).await.expect("create");
    assert_eq!(existed, CreateOutcome::Existed);
}
