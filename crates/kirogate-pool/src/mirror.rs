use redis::aio::ConnectionManager;

/// Best-effort mirror of per-credential in-flight counts into a shared
/// cache, for cross-process observability only. The in-memory counters stay
/// authoritative; every failure here is swallowed.
#[derive(Clone)]
pub struct InflightMirror {
    conn: ConnectionManager,
}

impl InflightMirror {
    pub async fn connect(url: &str) -> Option<Self> {
        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(error = %err, "invalid REDIS_URL, in-flight mirror disabled");
                return None;
            }
        };
        match ConnectionManager::new(client).await {
            Ok(conn) => {
                tracing::info!("in-flight mirror connected");
                Some(Self { conn })
            }
            Err(err) => {
                tracing::warn!(error = %err, "redis unreachable, in-flight mirror disabled");
                None
            }
        }
    }

    pub fn incr(&self, token_id: i64) {
        let mut conn = self.conn.clone();
        tokio::spawn(async move {
            let _: Result<i64, _> = redis::cmd("INCR")
                .arg(format!("kiro:inflight:{token_id}"))
                .query_async(&mut conn)
                .await;
        });
    }

    pub fn decr(&self, token_id: i64) {
        let mut conn = self.conn.clone();
        tokio::spawn(async move {
            let _: Result<i64, _> = redis::cmd("DECR")
                .arg(format!("kiro:inflight:{token_id}"))
                .query_async(&mut conn)
                .await;
        });
    }
}
