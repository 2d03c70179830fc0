//! Authenticated client for the MOT history API.

use serde::Deserialize;

use crate::{Credentials, FileListing, RemoteError, retry};

/// OAuth2 token endpoint; `{tenant}` is replaced with the tenant id.
pub const TOKEN_URL_TEMPLATE: &str =
    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";

/// Scope requested for the client-credentials grant.
pub const DEFAULT_SCOPE: &str = "https://tapi.dvsa.gov.uk/.default";

/// Endpoint listing the downloadable bulk and delta files.
pub const LISTING_URL: &str = "https://history.mot.api.gov.uk/v1/trade/vehicles/bulk-download";

const USER_AGENT: &str = "mot-loader/0.1";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// HTTP client bound to one set of credentials.
pub struct RemoteClient {
    http: reqwest::Client,
    credentials: Credentials,
    token_url: String,
    listing_url: String,
    scope: String,
}

impl RemoteClient {
    /// Creates a client for the production endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Http`] if the HTTP client cannot be built.
    pub fn new(credentials: Credentials) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        let token_url = TOKEN_URL_TEMPLATE.replace("{tenant}", &credentials.tenant_id);
        Ok(Self {
            http,
            credentials,
            token_url,
            listing_url: LISTING_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        })
    }

    /// Overrides the endpoints, e.g. to point at a mirror.
    #[must_use]
    pub fn with_endpoints(mut self, token_url: impl Into<String>, listing_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self.listing_url = listing_url.into();
        self
    }

    /// The underlying HTTP client, for downloads.
    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Obtains a bearer token via the client-credentials grant.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] if the token endpoint rejects the request or
    /// the response has no `access_token`.
    pub async fn fetch_token(&self) -> Result<String, RemoteError> {
        log::info!("Requesting access token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let token: TokenResponse =
            retry::send_json(|| self.http.post(&self.token_url).form(&form)).await?;
        Ok(token.access_token)
    }

    /// Fetches the current bulk/delta file listing.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] if the request fails or the body is not a
    /// file listing.
    pub async fn list_files(&self, token: &str) -> Result<FileListing, RemoteError> {
        log::info!("Fetching file listing");
        let listing: FileListing = retry::send_json(|| {
            self.http
                .get(&self.listing_url)
                .bearer_auth(token)
                .header("X-API-Key", &self.credentials.api_key)
        })
        .await?;
        log::info!(
            "  {} bulk file(s), {} delta file(s)",
            listing.bulk.len(),
            listing.delta.len()
        );
        Ok(listing)
    }
}
