//! Reuse pool for [`Response`] objects.
//!
//! Every decoded reply needs a `Response`; pulling them from a free list keeps
//! the receive path from allocating per call. A [`PooledResponse`] goes back to
//! its pool when dropped, so success, error and timeout paths all release it
//! exactly once.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use object_pool::{Pool, ReusableOwned};

use crate::response::Response;

/// Number of responses pre-allocated by the shared pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Thread-safe free list of responses
#[derive(Clone)]
pub struct ResponsePool {
    pool: Arc<Pool<Response>>,
}

impl ResponsePool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: Arc::new(Pool::new(capacity, Response::new)),
        }
    }

    /// Process-wide pool used by the default protocol implementations
    pub fn shared() -> &'static ResponsePool {
        static SHARED: OnceLock<ResponsePool> = OnceLock::new();
        SHARED.get_or_init(ResponsePool::new)
    }

    /// Take a reset response; an empty pool allocates instead of blocking
    pub fn acquire(&self) -> PooledResponse {
        self.acquire_with(Response::new)
    }

    /// Like [`acquire`](Self::acquire), building misses with `fallback`
    pub fn acquire_with<F>(&self, fallback: F) -> PooledResponse
    where
        F: Fn() -> Response,
    {
        let mut inner = self.pool.pull_owned(fallback);
        inner.reset();
        PooledResponse { inner }
    }
}

impl Default for ResponsePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResponsePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePool").finish_non_exhaustive()
    }
}

/// A response on loan from a [`ResponsePool`]
pub struct PooledResponse {
    inner: ReusableOwned<Response>,
}

impl Deref for PooledResponse {
    type Target = Response;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledResponse {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl fmt::Debug for PooledResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use meridian_core::{CompressType, Value};

    use super::*;

    #[test]
    fn acquire_after_use_is_reset() {
        let pool = ResponsePool::with_capacity(1);
        {
            let mut response = pool.acquire();
            response.correlation_id = Some(41);
            response.result = Some(Value::from("previous call"));
            response.error = Some("failed".to_string());
            response.kv_attachment = HashMap::from([("trace".to_string(), "1".to_string())]);
            response.binary_attachment = Some(Bytes::from_static(b"old"));
            response.compress_type = CompressType::Zlib;
        }

        let response = pool.acquire();
        assert_eq!(*response, Response::default());
    }

    #[test]
    fn exhausted_pool_still_hands_out_responses() {
        let pool = ResponsePool::with_capacity(1);
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(*first, Response::default());
        assert_eq!(*second, Response::default());
    }

    #[test]
    fn concurrent_acquire_release_keeps_reset_invariant() {
        let pool = ResponsePool::with_capacity(4);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let mut response = pool.acquire();
                        assert!(response.result.is_none());
                        assert!(response.kv_attachment.is_empty());
                        response.result = Some(Value::Int(i * 1000 + n));
                        response.kv_attachment.insert("n".to_string(), n.to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
