use crate::error::UploadError;
use log::info;
use std::time::Duration;

/// Downloads replacement datasets for `DatasetStore::upload`.
pub struct DatasetFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl DatasetFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Fetch `url`, returning the file name taken from the final URL path and the body.
    pub async fn fetch(&self, url: &str) -> Result<(String, Vec<u8>), UploadError> {
        info!("Fetching dataset from: {}", url);
        let fetch_err = |reason: String| UploadError::Fetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP request failed with status: {}", response.status())));
        }

        let file_name = file_name_from_url(response.url());
        let body = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        info!("Downloaded {} bytes as '{}'", body.len(), file_name);

        Ok((file_name, body.to_vec()))
    }
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn file_name_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default()
        .to_string()
}
