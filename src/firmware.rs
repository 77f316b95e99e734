// Copyright 2026 Gattlink Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Firmware image sources.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Supplies firmware images for OTA updates.
pub trait FirmwareSource: Send + Sync {
    /// Fetch the complete image behind `url`.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Where a firmware URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Http(String),
    File(PathBuf),
}

impl Location {
    fn parse(url: &str) -> Self {
        if url.starts_with("http://") || url.starts_with("https://") {
            Location::Http(url.to_string())
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Location::File(PathBuf::from(path))
        }
    }
}

/// Fetches images over HTTP(S) or from the local filesystem.
#[derive(Debug, Clone)]
pub struct FirmwareFetcher {
    client: reqwest::Client,
}

impl FirmwareFetcher {
    /// Create a fetcher whose HTTP requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl FirmwareSource for FirmwareFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let location = Location::parse(url);
        let client = self.client.clone();

        Box::pin(async move {
            let image = match location {
                Location::Http(url) => {
                    info!("Downloading firmware from {}", url);
                    let response = client
                        .get(&url)
                        .send()
                        .await
                        .with_context(|| format!("requesting {}", url))?
                        .error_for_status()?;
                    response.bytes().await?.to_vec()
                }
                Location::File(path) => {
                    info!("Reading firmware from {}", path.display());
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?
                }
            };

            info!("Firmware image: {} bytes", image.len());
            Ok(image)
        })
    }
}
