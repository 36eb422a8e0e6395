//! HTTP segment transport

use super::transport::{LoadedSegment, SegmentRequest, SegmentTransport};
use crate::abr::ProgressReporter;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::RANGE;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// [`SegmentTransport`] over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn download(
        &self,
        request: &SegmentRequest,
        progress: &ProgressReporter,
    ) -> Result<LoadedSegment> {
        let location = request.location();
        let url = request.segment.url.clone().ok_or_else(|| Error::SegmentRequest {
            url: location.clone(),
            message: "segment has no URL".into(),
        })?;

        let started = Instant::now();
        let mut builder = self.client.get(url);
        if let Some(range) = request.segment.byte_range {
            builder = builder.header(RANGE, format!("bytes={}-{}", range.start, range.end()));
        }

        let mut response = builder.send().await.map_err(|e| classify(&location, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::SegmentHttp {
                url: location,
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut data = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(&location, e))? {
            data.extend_from_slice(&chunk);
            progress.report(data.len() as u64, total);
        }

        if let Some(expected) = total {
            if data.len() as u64 != expected {
                return Err(Error::SegmentIntegrity { url: location });
            }
        }

        let size = data.len() as u64;
        Ok(LoadedSegment {
            data: data.freeze(),
            request_duration: started.elapsed(),
            size,
        })
    }
}

#[async_trait]
impl SegmentTransport for HttpTransport {
    #[instrument(skip_all, fields(url = %request.location()))]
    async fn load(
        &self,
        request: &SegmentRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<LoadedSegment> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Request aborted");
                Err(Error::Cancelled)
            }
            result = self.download(request, progress) => result,
        }
    }
}

fn classify(url: &str, error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::SegmentTimeout { url: url.into() }
    } else if error.is_connect() {
        Error::SegmentOffline { url: url.into() }
    } else if let Some(status) = error.status() {
        Error::SegmentHttp {
            url: url.into(),
            status: status.as_u16(),
        }
    } else {
        Error::SegmentRequest {
            url: url.into(),
            message: error.to_string(),
        }
    }
}
