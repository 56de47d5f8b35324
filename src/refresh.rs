use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{
    auth::{usable_token, TokenRefresher, TokenStore},
    ApiError, Result,
};

type RefreshFlight = Shared<BoxFuture<'static, std::result::Result<String, Arc<ApiError>>>>;

/// Single-flight coordination of token refreshes.
///
/// At most one refresh runs at a time; callers arriving while it is in
/// flight await the same shared future and observe the same outcome.
#[derive(Default)]
pub(crate) struct RefreshGate {
    in_flight: Mutex<Option<RefreshFlight>>,
}

impl RefreshGate {
    /// Returns a token to retry with after `stale` was rejected with a 401.
    ///
    /// If the store already holds a different token, another caller has
    /// refreshed since `stale` was read and that token is returned without a
    /// new refresh. On failure the store is cleared once, by the flight that
    /// failed.
    pub(crate) async fn refresh(
        &self,
        stale: Option<&str>,
        store: Option<&Arc<dyn TokenStore>>,
        refresher: &Arc<dyn TokenRefresher>,
    ) -> Result<String> {
        if let Some(current) = store.and_then(|store| usable_token(store.token())) {
            if stale != Some(current.as_str()) {
                return Ok(current);
            }
        }

        let flight = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let flight = start_flight(Arc::clone(refresher), store.cloned());
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        {
            let mut slot = self.lock();
            if slot
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&flight))
            {
                *slot = None;
            }
        }

        outcome.map_err(ApiError::RefreshFailed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<RefreshFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn start_flight(
    refresher: Arc<dyn TokenRefresher>,
    store: Option<Arc<dyn TokenStore>>,
) -> RefreshFlight {
    async move {
        #[cfg(feature = "tracing")]
        tracing::debug!("refreshing access token");

        let outcome = match refresher.refresh().await {
            Ok(token) => usable_token(Some(token))
                .ok_or_else(|| ApiError::Decode("refresher returned an empty token".to_owned())),
            Err(err) => Err(err),
        };

        outcome.map_err(|err| {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %err, "token refresh failed; clearing stored token");

            if let Some(store) = store {
                store.clear();
            }
            Arc::new(err)
        })
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::RefreshGate;
    use crate::{
        auth::{MemoryTokenStore, TokenRefresher, TokenStore},
        ApiError, Result,
    };

    struct CountingRefresher {
        calls: AtomicUsize,
        store: Arc<MemoryTokenStore>,
        succeed: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !self.succeed {
                return Err(ApiError::Http {
                    status: 401,
                    code: None,
                    message: "refresh token expired".to_owned(),
                    body: String::new(),
                });
            }
            let token = format!("fresh-{call}");
            self.store.set(token.clone());
            Ok(token)
        }
    }

    fn fixture(succeed: bool) -> (Arc<MemoryTokenStore>, Arc<CountingRefresher>) {
        let store = Arc::new(MemoryTokenStore::with_token("stale"));
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            store: Arc::clone(&store),
            succeed,
        });
        (store, refresher)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (store, refresher) = fixture(true);
        let gate = RefreshGate::default();
        let store_dyn: Arc<dyn TokenStore> = store.clone();
        let refresher_dyn: Arc<dyn TokenRefresher> = refresher.clone();

        let results = futures::future::join_all((0..5).map(|_| {
            gate.refresh(Some("stale"), Some(&store_dyn), &refresher_dyn)
        }))
        .await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.expect("refresh must succeed"), "fresh-1");
        }
    }

    #[tokio::test]
    async fn caller_with_outdated_token_reuses_current_one() {
        let (store, refresher) = fixture(true);
        store.set("already-refreshed");
        let gate = RefreshGate::default();
        let store_dyn: Arc<dyn TokenStore> = store.clone();
        let refresher_dyn: Arc<dyn TokenRefresher> = refresher.clone();

        let token = gate
            .refresh(Some("stale"), Some(&store_dyn), &refresher_dyn)
            .await
            .expect("current token must be returned");

        assert_eq!(token, "already-refreshed");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_refresh_reaches_every_waiter_and_clears_store() {
        let (store, refresher) = fixture(false);
        let gate = RefreshGate::default();
        let store_dyn: Arc<dyn TokenStore> = store.clone();
        let refresher_dyn: Arc<dyn TokenRefresher> = refresher.clone();

        let results = futures::future::join_all((0..3).map(|_| {
            gate.refresh(Some("stale"), Some(&store_dyn), &refresher_dyn)
        }))
        .await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|result| matches!(result, Err(ApiError::RefreshFailed(_)))));
        assert_eq!(store.token(), None);
    }

    #[tokio::test]
    async fn sequential_refreshes_start_new_flights() {
        let (store, refresher) = fixture(true);
        let gate = RefreshGate::default();
        let store_dyn: Arc<dyn TokenStore> = store.clone();
        let refresher_dyn: Arc<dyn TokenRefresher> = refresher.clone();

        let first = gate
            .refresh(Some("stale"), Some(&store_dyn), &refresher_dyn)
            .await
            .expect("first refresh");
        let second = gate
            .refresh(Some(first.as_str()), Some(&store_dyn), &refresher_dyn)
            .await
            .expect("second refresh");

        assert_eq!(first, "fresh-1");
        assert_eq!(second, "fresh-2");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }
}
