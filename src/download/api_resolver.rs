use super::error::{DownloadError, DownloadResult};
use super::resolver::{LyricInfo, SourceResolver, UrlRequest};
use super::task::{MusicInfo, Quality};
use crate::app::config::{NetworkConfig, ResolverConfig};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PicResponse {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LyricResponse {
    #[serde(default)]
    lyric: Option<String>,
    #[serde(default)]
    tlyric: Option<String>,
    #[serde(default)]
    rlyric: Option<String>,
}

type CacheKey = (String, String, Quality);

/// Client for a JSON lookup service exposing `/url`, `/pic` and `/lyric`
pub struct HttpResolver {
    client: reqwest::Client,
    base: Url,
    url_cache: Mutex<HashMap<CacheKey, String>>,
}

impl HttpResolver {
    pub fn new(
        api_base: &str,
        user_agent: &str,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> DownloadResult<Self> {
        let mut base = Url::parse(api_base)?;
        // Url::join drops the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base,
            url_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(resolver: &ResolverConfig, network: &NetworkConfig) -> DownloadResult<Self> {
        Self::new(
            &resolver.api_base,
            &network.user_agent,
            Duration::from_secs(network.connect_timeout_secs),
            Duration::from_secs(network.timeout_secs),
        )
    }

    fn endpoint(&self, name: &str, info: &MusicInfo) -> DownloadResult<Url> {
        let mut url = self.base.join(name)?;
        url.query_pairs_mut()
            .append_pair("source", &info.source)
            .append_pair("id", &info.id);
        Ok(url)
    }

    /// GET `url` and decode the body. `Ok(None)` on 404.
    async fn fetch_json<T: DeserializeOwned>(&self, url: Url) -> DownloadResult<Option<T>> {
        tracing::trace!("Lookup request: {}", url);
        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DownloadError::from_status(status));
        }
        let body = response.bytes().await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, String>> {
        self.url_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceResolver for HttpResolver {
    async fn resolve_transfer_url(&self, request: &UrlRequest) -> DownloadResult<String> {
        let info = &request.music_info;
        let key = (info.source.clone(), info.id.clone(), request.quality);

        if !request.force_refresh {
            let cached = self.lock_cache().get(&key).cloned();
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }

        let mut url = self.endpoint("url", info)?;
        url.query_pairs_mut()
            .append_pair("quality", request.quality.as_str());
        if !request.allow_quality_fallback {
            url.query_pairs_mut().append_pair("fallback", "0");
        }

        let response: UrlResponse = self
            .fetch_json(url)
            .await?
            .ok_or_else(|| DownloadError::resolve(format!("No download URL for {}", info.name)))?;

        if let Some(served) = response.quality.as_deref() {
            if !request.allow_quality_fallback && served != request.quality.as_str() {
                return Err(DownloadError::resolve(format!(
                    "Quality {} unavailable (service offered {})",
                    request.quality, served
                )));
            }
        }

        let transfer_url = response.url.filter(|u| !u.is_empty()).ok_or_else(|| {
            DownloadError::resolve(
                response
                    .msg
                    .unwrap_or_else(|| format!("No download URL for {}", info.name)),
            )
        })?;

        self.lock_cache().insert(key, transfer_url.clone());
        Ok(transfer_url)
    }

    fn invalidate_transfer_url(&self, music_info: &MusicInfo, quality: Quality) {
        let key = (music_info.source.clone(), music_info.id.clone(), quality);
        if self.lock_cache().remove(&key).is_some() {
            tracing::debug!("Dropped cached URL for {} ({})", music_info.name, quality);
        }
    }

    async fn resolve_cover_url(&self, music_info: &MusicInfo) -> DownloadResult<Option<String>> {
        let url = self.endpoint("pic", music_info)?;
        let response: Option<PicResponse> = self.fetch_json(url).await?;
        Ok(response.and_then(|r| r.url).filter(|u| !u.is_empty()))
    }

    async fn resolve_lyric(&self, music_info: &MusicInfo) -> DownloadResult<Option<LyricInfo>> {
        let url = self.endpoint("lyric", music_info)?;
        let response: Option<LyricResponse> = self.fetch_json(url).await?;
        Ok(response.and_then(|r| {
            let lyric = r.lyric.filter(|l| !l.is_empty())?;
            Some(LyricInfo {
                lyric,
                translated: r.tlyric,
                romanized: r.rlyric,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn song() -> MusicInfo {
        MusicInfo {
            id: "777".to_string(),
            name: "Song".to_string(),
            singer: "Artist".to_string(),
            source: "kw".to_string(),
            album: None,
        }
    }

    fn request(force_refresh: bool) -> UrlRequest {
        UrlRequest {
            music_info: song(),
            quality: Quality::K320,
            force_refresh,
            allow_quality_fallback: false,
        }
    }

    fn resolver(server: &MockServer) -> HttpResolver {
        // Base without trailing slash exercises the join fix-up
        HttpResolver::new(
            &format!("{}/api", server.uri()),
            "test-agent",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_url_sends_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .and(query_param("source", "kw"))
            .and(query_param("id", "777"))
            .and(query_param("quality", "320k"))
            .and(query_param("fallback", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"url":"http://cdn.example/777.mp3","quality":"320k"}"#,
            ))
            .mount(&server)
            .await;

        let url = resolver(&server).resolve_transfer_url(&request(true)).await.unwrap();
        assert_eq!(url, "http://cdn.example/777.mp3");
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":"http://cdn.example/a.mp3"}"#))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        resolver.resolve_transfer_url(&request(true)).await.unwrap();
        // Served from cache
        resolver.resolve_transfer_url(&request(false)).await.unwrap();
        // Hits the service again
        resolver.resolve_transfer_url(&request(true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidated_url_is_fetched_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":"http://cdn.example/a.mp3"}"#))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        resolver.resolve_transfer_url(&request(true)).await.unwrap();
        resolver.invalidate_transfer_url(&song(), Quality::K320);
        assert!(resolver.lock_cache().is_empty());
        // Cache miss: goes back to the service
        resolver.resolve_transfer_url(&request(false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_applies_total_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"url":"http://cdn.example/a.mp3"}"#)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let resolver_config = ResolverConfig {
            api_base: format!("{}/api", server.uri()),
        };
        let network = NetworkConfig {
            connect_timeout_secs: 30,
            timeout_secs: 1,
            ..NetworkConfig::default()
        };
        let resolver = HttpResolver::from_config(&resolver_config, &network).unwrap();

        let err = resolver.resolve_transfer_url(&request(true)).await.unwrap_err();
        assert!(matches!(err, DownloadError::Http(_)));
    }

    #[tokio::test]
    async fn test_quality_mismatch_without_fallback_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"url":"http://cdn.example/a.mp3","quality":"128k"}"#,
            ))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve_transfer_url(&request(true)).await.unwrap_err();
        assert!(matches!(err, DownloadError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_missing_url_uses_service_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":null,"msg":"copyright"}"#))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve_transfer_url(&request(true)).await.unwrap_err();
        assert_eq!(err.to_string(), "Resolve failed: copyright");
    }

    #[tokio::test]
    async fn test_server_error_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve_transfer_url(&request(true)).await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_cover_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/pic"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":"http://img.example/c.jpg"}"#))
            .mount(&server)
            .await;

        let cover = resolver(&server).resolve_cover_url(&song()).await.unwrap();
        assert_eq!(cover.as_deref(), Some("http://img.example/c.jpg"));
    }

    #[tokio::test]
    async fn test_lyric_with_extras_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/lyric"))
            .and(query_param("id", "777"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"lyric":"[00:00.00]a","tlyric":"[00:00.00]b"}"#,
            ))
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        let lyric = resolver.resolve_lyric(&song()).await.unwrap().unwrap();
        assert_eq!(lyric.lyric, "[00:00.00]a");
        assert_eq!(lyric.translated.as_deref(), Some("[00:00.00]b"));
        assert_eq!(lyric.romanized, None);

        let mut other = song();
        other.id = "404".to_string();
        assert_eq!(resolver.resolve_lyric(&other).await.unwrap(), None);
    }
}
