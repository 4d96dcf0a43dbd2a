use chatsync_messaging::{UserId, DEFAULT_DEDUP_WINDOW_MS};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Runtime configuration for the dev node.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub build_id: String,
    pub local_user: UserId,
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT").unwrap_or(8080);
        let build_id =
            env::var("CHATSYNC_BUILD_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let local_user =
            UserId::new(env::var("CHATSYNC_LOCAL_USER").unwrap_or_else(|_| "local".to_string()));
        let data_dir = env::var("CHATSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/node"));
        let sync = SyncConfig::from_env()?;
        Ok(Self {
            host,
            port,
            build_id,
            local_user,
            data_dir,
            sync,
        })
    }
}

/// Tunables of the per-conversation sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows per remote page.
    pub page_size: usize,
    /// Newest messages kept in the local snapshot.
    pub cache_limit: usize,
    /// Optimistic/confirmed matching window.
    pub dedup_window_ms: i64,
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            cache_limit: 50,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let page_size = env_parse("CHATSYNC_PAGE_SIZE").unwrap_or(defaults.page_size);
        let cache_limit = env_parse("CHATSYNC_CACHE_LIMIT").unwrap_or(defaults.cache_limit);
        let dedup_window_ms =
            env_parse("CHATSYNC_DEDUP_WINDOW_MS").unwrap_or(defaults.dedup_window_ms);
        anyhow::ensure!(page_size > 0, "CHATSYNC_PAGE_SIZE must be positive");
        anyhow::ensure!(dedup_window_ms >= 0, "CHATSYNC_DEDUP_WINDOW_MS must not be negative");

        let delay = env_parse("CHATSYNC_RECONNECT_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(ReconnectPolicy::DEFAULT_DELAY);
        let reconnect = match env::var("CHATSYNC_RECONNECT_BACKOFF").as_deref() {
            Ok("exponential") => ReconnectPolicy::Exponential {
                initial: delay,
                max: env_parse("CHATSYNC_RECONNECT_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::from_secs(60)),
                multiplier: 2.0,
            },
            Ok("fixed") | Err(_) => ReconnectPolicy::Fixed { delay },
            Ok(other) => anyhow::bail!("unknown CHATSYNC_RECONNECT_BACKOFF value: {other}"),
        };

        Ok(Self {
            page_size,
            cache_limit,
            dedup_window_ms,
            reconnect,
        })
    }
}

/// How long to wait before reopening a dropped realtime channel.
///
/// Retries never give up while the conversation stays focused.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    Fixed {
        delay: Duration,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay: Self::DEFAULT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.max(1.0).powi(attempt.min(32) as i32);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
