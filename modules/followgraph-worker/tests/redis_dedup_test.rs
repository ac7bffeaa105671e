//! RedisDedupStore against a real Redis. Run with `--features test-utils`.
#![cfg(feature = "test-utils")]

use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage,
};

use followgraph_common::EntityId;
use followgraph_worker::{DedupStore, RedisDedupStore};

async fn redis_container() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7.4")
        .with_exposed_port(ContainerPort::Tcp(6379))
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");

    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get Redis host port");

    (container, format!("redis://127.0.0.1:{port}/"))
}

#[tokio::test]
async fn add_is_a_first_writer_wins_gate() {
    let (_container, url) = redis_container().await;
    let a = RedisDedupStore::connect(&url, "twitter_fetched_users").await.unwrap();
    let b = RedisDedupStore::connect(&url, "twitter_fetched_users").await.unwrap();

    assert!(a.add(EntityId(42)).await.unwrap());
    assert!(!b.add(EntityId(42)).await.unwrap());
    assert!(!a.add(EntityId(42)).await.unwrap());
}

#[tokio::test]
async fn remove_reopens_the_gate() {
    let (_container, url) = redis_container().await;
    let store = RedisDedupStore::connect(&url, "twitter_fetched_users").await.unwrap();

    assert!(store.add(EntityId(7)).await.unwrap());
    store.remove(EntityId(7)).await.unwrap();
    store.remove(EntityId(7)).await.unwrap();

    assert!(store.add(EntityId(7)).await.unwrap());
}

#[tokio::test]
async fn keys_are_independent_sets() {
    let (_container, url) = redis_container().await;
    let one = RedisDedupStore::connect(&url, "set-one").await.unwrap();
    let two = RedisDedupStore::connect(&url, "set-two").await.unwrap();

    assert!(one.add(EntityId(1)).await.unwrap());
    assert!(two.add(EntityId(1)).await.unwrap());
}
