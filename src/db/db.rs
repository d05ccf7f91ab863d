// db/db.rs
use redis::aio::ConnectionManager;
use sqlx::{Pool, Postgres};
use std::sync::Arc;

#[derive(Clone)]
pub struct DBClient {
    pub pool: Pool<Postgres>,
    pub redis_client: Option<Arc<ConnectionManager>>,
}

impl std::fmt::Debug for DBClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBClient")
            .field("pool", &"Pool<Postgres>")
            .field("redis_client", &self.redis_client.is_some())
            .finish()
    }
}

impl DBClient {
    pub fn with_redis(pool: Pool<Postgres>, redis: Arc<ConnectionManager>) -> Self {
        DBClient {
            pool,
            redis_client: Some(redis),
        }
    }

    pub fn is_redis_available(&self) -> bool {
        self.redis_client.is_some()
    }
}
