use logs_router::cache::RedisLogCache;
use redis::AsyncCommands;

pub const BASE_REDIS_URL: &str = "redis://localhost:6379";

pub struct RedisTestContext {
    pub cache: RedisLogCache,
    pub connection: redis::aio::MultiplexedConnection,
    pub prefix: String,
}

impl RedisTestContext {
    pub async fn new(name: &str) -> Self {
        let prefix = format!("test:{}:{}", name, uuid::Uuid::new_v4());
        let cache = RedisLogCache::connect(BASE_REDIS_URL, prefix.clone())
            .await
            .expect("could not connect redis log cache");
        let connection = redis::Client::open(BASE_REDIS_URL)
            .expect("could not parse redis url")
            .get_multiplexed_async_connection()
            .await
            .expect("could not connect to redis");
        Self {
            cache,
            connection,
            prefix,
        }
    }

    /// Drops every key written under this context's prefix.
    pub async fn cleanup(mut self) {
        let keys: Vec<String> = self
            .connection
            .keys(format!("{}:*", self.prefix))
            .await
            .expect("could not list test keys");
        if !keys.is_empty() {
            let _: usize = self
                .connection
                .del(keys)
                .await
                .expect("could not delete test keys");
        }
    }
}
