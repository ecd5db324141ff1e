/// Errors of the shared Redis layer. `RedisCache` logs them and degrades to a miss, so they
/// never reach workflow callers.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis unavailable, degrading gracefully")]
    RedisUnavailable,
}
