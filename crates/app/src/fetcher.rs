use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use toybox_core::{FetchResponse, Fetcher, Href, Result, ToyboxError};

/// Serves URLs from a build output directory mounted at the site root.
#[derive(Debug, Clone)]
pub struct DistFetcher {
    root: PathBuf,
}

impl DistFetcher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Fetcher for DistFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        let href = Href::parse(url);
        let relative = href.path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return Ok(FetchResponse {
                status: 403,
                body: String::new(),
            });
        }

        let path = self.root.join(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(FetchResponse::ok(body)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(FetchResponse::not_found()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Fetcher for runs without a build directory. Every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        Err(ToyboxError::msg(format!("offline, cannot fetch {url}")))
    }
}
