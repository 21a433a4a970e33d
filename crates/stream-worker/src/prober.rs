//! Liveness probing. The default implementation treats the monitor's
//! configured `stream_url` as already resolving to a fetchable HLS/DASH
//! manifest endpoint — the proprietary step of turning a YouTube watch
//! page into that endpoint is an external concern this worker never
//! performs itself.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use stream_core::WorkerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveStatus {
    Live { title: Option<String> },
    NotLive,
    WasLive,
}

#[async_trait]
pub trait StreamProber: Send + Sync {
    async fn is_live(&self, stream_url: &str) -> Result<LiveStatus, WorkerError>;

    /// Returns the manifest URL to hand to `ManifestSource::fetch` for
    /// the monitoring loop. May differ from `stream_url` once resolution
    /// redirects to a variant-specific endpoint.
    async fn get_manifest(&self, stream_url: &str) -> Result<String, WorkerError>;
}

pub struct HttpStreamProber {
    client: Client,
}

impl HttpStreamProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamProber for HttpStreamProber {
    async fn is_live(&self, stream_url: &str) -> Result<LiveStatus, WorkerError> {
        let resp = match self.client.get(stream_url).send().await {
            Ok(r) => r,
            Err(e) => return Err(WorkerError::Probe(e.to_string())),
        };

        if resp.status() == StatusCode::NOT_FOUND || resp.status() == StatusCode::GONE {
            return Ok(LiveStatus::WasLive);
        }
        if !resp.status().is_success() {
            return Ok(LiveStatus::NotLive);
        }

        let body = resp.text().await.map_err(|e| WorkerError::Probe(e.to_string()))?;
        match m3u8_rs::parse_playlist(body.as_bytes()) {
            Ok((_, m3u8_rs::Playlist::MasterPlaylist(master))) => {
                if master.variants.is_empty() {
                    Ok(LiveStatus::NotLive)
                } else {
                    Ok(LiveStatus::Live { title: None })
                }
            }
            Ok((_, m3u8_rs::Playlist::MediaPlaylist(media))) => {
                if media.end_list {
                    Ok(LiveStatus::WasLive)
                } else if media.segments.is_empty() {
                    Ok(LiveStatus::NotLive)
                } else {
                    Ok(LiveStatus::Live { title: None })
                }
            }
            Err(_) => Ok(LiveStatus::NotLive),
        }
    }

    async fn get_manifest(&self, stream_url: &str) -> Result<String, WorkerError> {
        Ok(stream_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reports_was_live_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = HttpStreamProber::new(Client::new());
        let status = prober.is_live(&server.uri()).await.unwrap();
        assert_eq!(status, LiveStatus::WasLive);
    }

    #[tokio::test]
    async fn reports_live_for_a_populated_media_playlist() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:6.0,\nseg1.ts\n";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
            .mount(&server)
            .await;

        let prober = HttpStreamProber::new(Client::new());
        let status = prober.is_live(&server.uri()).await.unwrap();
        assert_eq!(status, LiveStatus::Live { title: None });
    }

    #[tokio::test]
    async fn reports_was_live_when_endlist_present() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:6.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
            .mount(&server)
            .await;

        let prober = HttpStreamProber::new(Client::new());
        let status = prober.is_live(&server.uri()).await.unwrap();
        assert_eq!(status, LiveStatus::WasLive);
    }
}
