use core::time::Duration;

use kv_mutex::{config::StoreConfig, LockOptions, Store};

// Pass a JSON store config as the first argument, defaults to a local etcd.
// e.g. `demo-lock '{ "backend": "memory" }'`
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = std::env::args()
        .nth(1)
        .unwrap_or_else(|| r#"{ "backend": "etcd", "endpoints": ["localhost:2379"] }"#.to_string());
    let config = StoreConfig::from_json(&config).expect("invalid store config");
    let store = Store::connect(&config)
        .await
        .expect("failed to connect to store");

    let lock_name = "svc/leader";
    let ttl = Duration::from_secs(3);

    let lock_a = store.new_lock(lock_name, LockOptions::new().with_ttl(ttl).with_value("A"));
    let lock_b = store.new_lock(lock_name, LockOptions::new().with_ttl(ttl).with_value("B"));

    let lost_a = lock_a.lock().await.expect("failed to lock");
    println!("Lock acquired by A!");

    let store2 = store.clone();
    let h = tokio::spawn(async move {
        let lost_b = lock_b.lock().await.expect("failed to lock");
        let holder = store2.get(lock_name).await.expect("failed to read lock value");
        println!(
            "Lock acquired by B, value is now {:?}",
            String::from_utf8_lossy(&holder.value)
        );
        lock_b.unlock().await.expect("B failed to unlock");
        lost_b.recv().await;
    });

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Unlocking A!");
    lock_a.unlock().await.expect("A failed to unlock");
    lost_a.recv().await;

    println!("Waiting for B to acquire lock...");
    h.await.expect("B failed to acquire lock");
    println!("Finished!");
}
