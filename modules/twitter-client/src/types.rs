use serde::Deserialize;

/// OAuth 1.0a user-context credentials.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

/// Which cursored id listing to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdsEndpoint {
    /// `followers/ids`: accounts following the user.
    Followers,
    /// `friends/ids`: accounts the user follows.
    Friends,
}

impl IdsEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            IdsEndpoint::Followers => "followers/ids.json",
            IdsEndpoint::Friends => "friends/ids.json",
        }
    }
}

/// One page of a cursored id listing. A `next_cursor` of 0 marks the last page.
#[derive(Debug, Clone, Deserialize)]
pub struct IdsPage {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub next_cursor: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    pub code: i64,
    pub message: String,
}
