//! Provider manager: priority-ordered failover across NNTP servers
//!
//! Routes each segment fetch to the highest-priority provider that has
//! a free connection slot and has not already reported the article
//! missing. Slots are counted with per-provider semaphores; the permit
//! rides inside the returned [`Lease`] so it is released exactly once,
//! when the lease closes or drops.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::types::Segment;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::provider::{BodyReader, NntpProvider, Provider};

/// Pause between failover attempts after a 430
const FAILOVER_DELAY: Duration = Duration::from_millis(100);

struct ManagedProvider {
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
}

/// Routes segment fetches across providers subject to per-provider
/// concurrency and priority
pub struct ProviderManager {
    providers: Vec<ManagedProvider>,
}

impl ProviderManager {
    /// Build providers from server configuration and validate each with
    /// a startup connection test.
    pub async fn new(configs: &[ServerConfig]) -> Result<Self> {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(configs.len());
        for config in configs {
            let provider = NntpProvider::new(config.clone());
            tracing::info!(provider = %provider.id(), "validating provider");
            provider.test_connection().await?;
            providers.push(Arc::new(provider));
        }
        Ok(Self::with_providers(providers))
    }

    /// Assemble a manager from prebuilt providers without the startup
    /// connection test.
    pub fn with_providers(mut providers: Vec<Arc<dyn Provider>>) -> Self {
        // 0 is the highest priority and is tried first
        providers.sort_by_key(|p| p.priority());
        let providers = providers
            .into_iter()
            .map(|provider| ManagedProvider {
                semaphore: Arc::new(Semaphore::new(provider.max_connections())),
                provider,
            })
            .collect();
        ProviderManager { providers }
    }

    /// Fetch a segment body from the best available provider.
    ///
    /// Providers are tried in priority order; ones that already returned
    /// 430 for this segment are skipped, ones at their connection cap
    /// are passed over. A 430 marks the provider missing and moves on
    /// after a short pause. When every provider has reported the article
    /// missing the result is [`Error::ArticleNotFound`]; when the only
    /// obstacle was saturated slots it is [`Error::ProviderBusy`], which
    /// the worker pool retries without consuming the retry budget.
    pub async fn fetch(
        &self,
        segment: &Segment,
        groups: &[String],
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut last_err: Option<Error> = None;
        let mut saw_busy = false;

        for managed in &self.providers {
            let provider_id = managed.provider.id();
            if segment.is_missing_from(provider_id) {
                continue;
            }

            if segment.missing_count() > 0 {
                tracing::debug!(
                    message_id = %segment.message_id,
                    missing_on = segment.missing_count(),
                    provider = %provider_id,
                    priority = managed.provider.priority(),
                    "failover attempt"
                );
            }

            let permit = match managed.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    saw_busy = true;
                    continue;
                }
            };

            match managed.provider.fetch(&segment.message_id, groups).await {
                Ok(body) => {
                    return Ok(Lease {
                        body,
                        _permit: permit,
                    });
                }
                Err(Error::ArticleNotFound) => {
                    drop(permit);
                    tracing::debug!(
                        provider = %provider_id,
                        message_id = %segment.message_id,
                        "430 missing, marking provider"
                    );
                    segment.mark_missing_from(provider_id);
                    tokio::time::sleep(FAILOVER_DELAY).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::debug!(provider = %provider_id, error = %e, "fetch failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        if segment.missing_count() >= self.providers.len() {
            return Err(Error::ArticleNotFound);
        }
        if saw_busy {
            return Err(Error::ProviderBusy);
        }
        match last_err {
            Some(e) => Err(e),
            None => Err(Error::ProviderBusy),
        }
    }

    /// Maximum concurrent fetches across all providers; the worker pool
    /// sizes itself from this.
    pub fn total_capacity(&self) -> usize {
        self.providers
            .iter()
            .map(|m| m.provider.max_connections())
            .sum()
    }

    /// Free connection slots for one provider (by id). After quiescence
    /// this equals the provider's `max_connections`.
    pub fn free_slots(&self, provider_id: &str) -> Option<usize> {
        self.providers
            .iter()
            .find(|m| m.provider.id() == provider_id)
            .map(|m| m.semaphore.available_permits())
    }

    /// Close every provider's idle pool
    pub async fn close(&self) {
        for managed in &self.providers {
            managed.provider.close().await;
        }
    }
}

/// A leased article body: the streamed payload plus the provider slot
/// it occupies. The slot is released exactly once — when the lease is
/// closed (drain + recycle) or dropped (socket discard).
pub struct Lease {
    body: BodyReader,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl Lease {
    /// Drain and recycle the underlying connection, then release the
    /// provider slot.
    pub async fn close(self) {
        let Lease { body, _permit } = self;
        body.close().await;
    }
}

impl AsyncRead for Lease {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.body).poll_read(cx, buf)
    }
}
