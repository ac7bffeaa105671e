use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::{error, info, warn};

use followgraph_common::{Credentials, EntityId, Relation};
use twitter_client::{
    IdsEndpoint, IdsPage, OAuthCredentials, TwitterClient, TwitterError, FIRST_CURSOR,
};

use crate::error::FetchError;

/// Rate-limit waits allowed per page request before giving up. The request
/// is attempted at most `MAX_RATE_LIMIT_RETRIES + 1` times.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Remote source of relationship listings.
#[async_trait]
pub trait FollowGraphApi: Send + Sync {
    /// One page of ids related to `id`. Start at [`FIRST_CURSOR`]; a
    /// `next_cursor` of 0 ends the listing.
    async fn ids_page(
        &self,
        relation: Relation,
        id: EntityId,
        cursor: i64,
    ) -> Result<IdsPage, TwitterError>;
}

#[async_trait]
impl<T: FollowGraphApi + ?Sized> FollowGraphApi for Arc<T> {
    async fn ids_page(
        &self,
        relation: Relation,
        id: EntityId,
        cursor: i64,
    ) -> Result<IdsPage, TwitterError> {
        (**self).ids_page(relation, id, cursor).await
    }
}

#[async_trait]
impl FollowGraphApi for TwitterClient {
    async fn ids_page(
        &self,
        relation: Relation,
        id: EntityId,
        cursor: i64,
    ) -> Result<IdsPage, TwitterError> {
        let endpoint = match relation {
            Relation::Followers => IdsEndpoint::Followers,
            Relation::Friends => IdsEndpoint::Friends,
        };
        TwitterClient::ids_page(self, endpoint, id.get(), cursor).await
    }
}

/// Builds an API client from a credentials bundle.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Box<dyn FollowGraphApi>;
}

pub struct TwitterConnector;

impl ApiConnector for TwitterConnector {
    fn connect(&self, credentials: &Credentials) -> Box<dyn FollowGraphApi> {
        Box::new(TwitterClient::new(OAuthCredentials {
            consumer_key: credentials.consumer_key.clone(),
            consumer_secret: credentials.consumer_secret.clone(),
            access_token: credentials.oauth_token.clone(),
            access_token_secret: credentials.oauth_token_secret.clone(),
        }))
    }
}

/// Retrieves complete relationship listings, waiting out rate limits.
///
/// The client is swapped atomically on credential rotation; a fetch that is
/// already running keeps the client it started with.
#[derive(Default)]
pub struct RateLimitedFetcher {
    client: ArcSwapOption<Box<dyn FollowGraphApi>>,
}

impl RateLimitedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a client, or clear it with `None`.
    pub fn configure(&self, client: Option<Box<dyn FollowGraphApi>>) {
        self.client.store(client.map(Arc::new));
    }

    pub fn is_configured(&self) -> bool {
        self.client.load().is_some()
    }

    /// All ids related to `id`, across every page.
    ///
    /// Blocks the caller for the full rate-limit reset interval when the
    /// server asks for it; there is no cancellation.
    pub async fn fetch(
        &self,
        relation: Relation,
        id: EntityId,
    ) -> Result<Vec<EntityId>, FetchError> {
        let Some(client) = self.client.load_full() else {
            return Err(FetchError::NotConfigured);
        };

        let mut ids = Vec::new();
        let mut cursor = FIRST_CURSOR;
        loop {
            let page = page_with_retry(&**client, relation, id, cursor).await?;
            ids.extend(page.ids.into_iter().map(EntityId));
            if page.next_cursor == 0 {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(ids)
    }
}

async fn page_with_retry(
    client: &dyn FollowGraphApi,
    relation: Relation,
    id: EntityId,
    cursor: i64,
) -> Result<IdsPage, FetchError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.ids_page(relation, id, cursor).await {
            Ok(page) => return Ok(page),
            Err(TwitterError::RateLimited { reset_in }) if attempt <= MAX_RATE_LIMIT_RETRIES => {
                info!(
                    entity_id = %id,
                    %relation,
                    attempt,
                    reset_in_secs = reset_in.as_secs(),
                    "Rate limited, sleeping until window resets"
                );
                tokio::time::sleep(reset_in).await;
            }
            Err(TwitterError::RateLimited { .. }) => {
                warn!(entity_id = %id, %relation, attempt, "Rate limit retries exhausted");
                return Err(FetchError::RateLimitExhausted {
                    relation,
                    entity: id,
                    attempts: attempt,
                });
            }
            Err(TwitterError::NotFound(message)) => {
                return Err(FetchError::NotFound {
                    relation,
                    entity: id,
                    message,
                });
            }
            Err(e) => {
                match &e {
                    TwitterError::Api {
                        status,
                        code,
                        message,
                        remaining,
                    } => error!(
                        entity_id = %id,
                        %relation,
                        status,
                        code = ?code,
                        message = message.as_str(),
                        remaining = ?remaining,
                        "Remote API error"
                    ),
                    other => error!(entity_id = %id, %relation, error = %other, "Remote API error"),
                }
                return Err(FetchError::Remote {
                    relation,
                    entity: id,
                    source: e,
                });
            }
        }
    }
}
