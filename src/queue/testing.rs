use std::future::Future;
use std::time::Duration;

use testcontainers::{
    core::{ContainerAsync, IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage,
};

use super::redis::{create_redis_pool, RedisStore};

pub async fn setup_redis_test_environment() -> (RedisStore, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "alpine3.22")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis");

    let host = container.get_host().await.expect("Failed to get host");
    let host_port = container
        .get_host_port_ipv4(6379.tcp())
        .await
        .expect("Failed to get host port");
    let pool = create_redis_pool(&format!("redis://{host}:{host_port}")).await;
    assert!(pool.is_ok(), "Failed create connection redis pool");

    (RedisStore::new(pool.unwrap()), container)
}

/// Polls `check` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
