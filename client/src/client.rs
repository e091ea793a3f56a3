use crate::{
    gateway::{decode, error_detail, ApiRequest, Gateway, SessionEvent, SessionSnapshot, SessionStatus},
    store::{MemoryTokenStore, TokenStore},
    ClientConfig, Error, Result,
};
use casebox_types::{api::paths, UserProfile};
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

/// Handle to the casebox API. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    gateway: Arc<Gateway>,
}

impl Client {
    /// Client with default settings and an in-memory token store.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(
            &ClientConfig::default().with_base_url(base_url),
            Arc::new(MemoryTokenStore::new()),
        )
    }

    pub fn with_config(config: &ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let gateway = Gateway::new(
            http,
            base_url.clone(),
            store,
            config.max_refresh_attempts,
            config.refresh_backoff,
        );
        Ok(Self {
            base_url,
            gateway: Arc::new(gateway),
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Pick up a persisted refresh token, if any.
    pub fn restore(&self) -> Result<bool> {
        self.gateway.restore()
    }

    pub async fn login(&self, init_data: &str) -> Result<()> {
        self.gateway.login(init_data).await
    }

    pub fn logout(&self) -> Result<()> {
        self.gateway.logout()
    }

    pub fn status(&self) -> SessionStatus {
        self.gateway.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.gateway.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.gateway.subscribe()
    }

    pub async fn current_user(&self) -> Result<UserProfile> {
        self.fetch(ApiRequest::get(paths::CURRENT_USER)).await
    }

    pub(crate) async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = expect_success(self.gateway.send(&request).await?).await?;
        decode(response).await
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(Error::InvalidScheme(scheme.to_string())),
    }
    // Relative joins drop the last segment unless the path ends in '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) async fn expect_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, body) = error_detail(response).await;
    Err(Error::FailedWithBody { status, body })
}
