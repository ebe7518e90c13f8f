use std::time::Duration;

use kv_mutex::{config::StoreConfig, Error, LockOptions, Store};

mod common;

#[tokio::test]
async fn put_get_delete_should_normalize_keys() {
    let (_, store) = common::memory_store();

    let kv = store.put("/app//name/", "value", None).await.expect("put");
    assert_eq!(kv.key, "app/name");
    assert_eq!(store.get("app/name").await.expect("get"), kv);
    assert!(store.exists("/app/name").await.expect("exists"));

    store.delete("app/name/").await.expect("delete");
    assert!(!store.exists("app/name").await.expect("exists"));
    assert!(matches!(store.get("app/name").await, Err(Error::NotFound)));
    assert!(matches!(store.delete("app/name").await, Err(Error::NotFound)));
}

#[tokio::test(start_paused = true)]
async fn put_with_ttl_should_expire() {
    let (_, store) = common::memory_store();

    store
        .put("session", "s", Some(Duration::from_secs(5)))
        .await
        .expect("put");
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(store.exists("session").await.expect("exists"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!store.exists("session").await.expect("exists"));
}

#[tokio::test(start_paused = true)]
async fn list_should_hide_lock_keys() {
    let (_, store) = common::memory_store();
    store.put("svc/a", "1", None).await.expect("put");
    store.put("svc/b", "2", None).await.expect("put");
    store.put("other", "3", None).await.expect("put");

    let lock = store.new_lock("svc/leader", LockOptions::new().with_value("me"));
    lock.lock().await.expect("lock");

    let keys = store
        .list("/svc")
        .await
        .expect("list")
        .into_iter()
        .map(|kv| kv.key)
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["svc/a", "svc/b", "svc/leader"]);
    lock.unlock().await.expect("unlock");
}

#[tokio::test]
async fn list_of_a_missing_directory_should_be_not_found() {
    let (_, store) = common::memory_store();
    store.put("directory", "1", None).await.expect("put");

    assert!(matches!(store.list("dir").await, Err(Error::NotFound)));
    assert!(matches!(store.list("missing").await, Err(Error::NotFound)));
    assert_eq!(store.list("/").await.expect("list root").len(), 1);
}

#[tokio::test]
async fn delete_tree_should_remove_every_child() {
    let (_, store) = common::memory_store();
    store.put("dir/a", "1", None).await.expect("put");
    store.put("dir/sub/b", "2", None).await.expect("put");
    store.put("directory", "3", None).await.expect("put");

    store.delete_tree("dir").await.expect("delete tree");
    assert!(matches!(store.list("dir").await, Err(Error::NotFound)));
    assert!(store.exists("directory").await.expect("exists"));
    assert!(matches!(store.delete_tree("dir").await, Err(Error::NotFound)));
}

#[tokio::test]
async fn atomic_put_should_follow_previous_read() {
    let (_, store) = common::memory_store();

    let created = store.atomic_put("k", "a", None, None).await.expect("create");
    let again = store.atomic_put("k", "a", None, None).await;
    assert!(matches!(again, Err(Error::AlreadyExists)));

    let updated = store
        .atomic_put("k", "b", Some(&created), None)
        .await
        .expect("update");
    let stale = store.atomic_put("k", "c", Some(&created), None).await;
    assert!(matches!(stale, Err(Error::VersionConflict)));

    let stale = store.atomic_delete("k", &created).await;
    assert!(matches!(stale, Err(Error::VersionConflict)));
    store.atomic_delete("k", &updated).await.expect("delete");
    assert!(matches!(
        store.atomic_delete("k", &updated).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn connect_should_build_the_configured_backend() {
    common::init_tracing();
    let config = StoreConfig::from_json(r#"{ "backend": "memory", "history_capacity": 10 }"#)
        .expect("config");
    let store = Store::connect(&config).await.expect("connect");

    store.put("k", "v", None).await.expect("put");
    assert_eq!(store.get("k").await.expect("get").value, b"v");

    let clone = store.clone();
    assert_eq!(clone.get("k").await.expect("get").value, b"v");
}
