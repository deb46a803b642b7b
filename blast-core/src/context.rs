use std::sync::Arc;

use crate::clock::SchedulingClock;
use crate::config::Config;
use crate::db::{create_pool as create_db_pool, run_migrations};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::store::{PgStore, Store};

/// Shared handles every service loop and HTTP handler is built from.
#[derive(Clone)]
pub struct BlastContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub clock: SchedulingClock,
    /// Presence lookups for interactive devices. `None` when no Redis URL is
    /// configured, in which case every device is treated as reachable.
    pub redis_pool: Option<RedisPool>,
}

impl BlastContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        if config.database.run_migrations {
            run_migrations(&config.database).await?;
        }
        let db_pool = create_db_pool(&config.database).await?;

        let redis_pool = if config.redis.url.trim().is_empty() {
            tracing::warn!("REDIS_URL is empty, device presence checks are disabled");
            None
        } else {
            Some(create_redis_pool(&config.redis).await?)
        };

        Ok(BlastContext {
            clock: SchedulingClock::from_config(&config.scheduling),
            config: Arc::new(config),
            store: Arc::new(PgStore::new(db_pool)),
            redis_pool,
        })
    }

    /// Context over an already-built store, without Redis.
    pub fn with_store(config: Config, store: Arc<dyn Store>, clock: SchedulingClock) -> Self {
        BlastContext {
            config: Arc::new(config),
            store,
            clock,
            redis_pool: None,
        }
    }
}
