pub mod error;
mod oauth;
pub mod types;

pub use error::{Result, TwitterError};
pub use types::{IdsEndpoint, IdsPage, OAuthCredentials};

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use types::ErrorBody;

const BASE_URL: &str = "https://api.twitter.com/1.1";

/// Maximum page size accepted by the `*/ids` endpoints.
const IDS_PAGE_SIZE: u32 = 5000;

/// Length of a rate-limit window, used when the server omits the reset header.
const DEFAULT_RESET: Duration = Duration::from_secs(15 * 60);

/// First cursor of any cursored listing.
pub const FIRST_CURSOR: i64 = -1;

pub struct TwitterClient {
    client: reqwest::Client,
    credentials: OAuthCredentials,
}

impl TwitterClient {
    pub fn new(credentials: OAuthCredentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            credentials,
        }
    }

    /// Fetch one page of a cursored id listing. Start with [`FIRST_CURSOR`];
    /// the listing is exhausted when the returned `next_cursor` is 0.
    pub async fn ids_page(
        &self,
        endpoint: IdsEndpoint,
        user_id: i64,
        cursor: i64,
    ) -> Result<IdsPage> {
        let url = format!("{BASE_URL}/{}", endpoint.path());
        let params = vec![
            ("count", IDS_PAGE_SIZE.to_string()),
            ("cursor", cursor.to_string()),
            ("user_id", user_id.to_string()),
        ];

        let auth = oauth::authorization_header(
            &self.credentials,
            "GET",
            &url,
            &params,
            &uuid::Uuid::new_v4().simple().to_string(),
            Utc::now().timestamp(),
        );

        let resp = self
            .client
            .get(&url)
            .query(&params)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_error(
                status.as_u16(),
                &headers,
                &body,
                Utc::now().timestamp(),
            ));
        }

        let body = resp.text().await?;
        let page: IdsPage = serde_json::from_str(&body)?;
        tracing::debug!(
            user_id,
            endpoint = endpoint.path(),
            cursor,
            count = page.ids.len(),
            "Fetched id page"
        );
        Ok(page)
    }
}

/// Map a non-success response onto the error taxonomy.
fn classify_error(status: u16, headers: &HeaderMap, body: &str, now: i64) -> TwitterError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.errors.into_iter().next());

    match status {
        429 => TwitterError::RateLimited {
            reset_in: reset_in(headers, now),
        },
        404 => TwitterError::NotFound(
            detail
                .map(|d| d.message)
                .unwrap_or_else(|| body.to_string()),
        ),
        _ => {
            let (code, message) = match detail {
                Some(d) => (Some(d.code), d.message),
                None => (None, body.to_string()),
            };
            TwitterError::Api {
                status,
                code,
                message,
                remaining: header_i64(headers, "x-rate-limit-remaining")
                    .and_then(|v| u64::try_from(v).ok()),
            }
        }
    }
}

/// Time until the rate-limit window resets, from the `x-rate-limit-reset`
/// epoch header. Never negative.
fn reset_in(headers: &HeaderMap, now: i64) -> Duration {
    match header_i64(headers, "x-rate-limit-reset") {
        Some(reset_at) => Duration::from_secs(u64::try_from(reset_at - now).unwrap_or(0)),
        None => DEFAULT_RESET,
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
