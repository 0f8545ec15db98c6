//! Location lookup for outgoing events
//!
//! Failures never block delivery: a failed lookup yields `None` and the
//! event goes out without coordinates. After a failed HTTP lookup no request
//! is made for a short backoff period.

use crate::infra::config::{Config, GeolocationMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
}

impl Location {
    fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Lookups are skipped for this long after a failure
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Last successful HTTP lookup and the time of the last failure
#[derive(Default)]
struct LocationCache {
    last_good: Option<(Location, Instant)>,
    failed_at: Option<Instant>,
}

pub enum Geolocator {
    Disabled,
    Fixed(Location),
    Http {
        client: reqwest::Client,
        url: String,
        ttl: Duration,
        failure_backoff: Duration,
        cache: Mutex<LocationCache>,
    },
}

impl Geolocator {
    /// Build from config; HTTP mode falls back to disabled if the client cannot be built
    pub fn from_config(config: &Config) -> Self {
        match config.geolocation_mode() {
            GeolocationMode::Disabled => Geolocator::Disabled,
            GeolocationMode::Fixed => {
                match (config.geolocation_latitude(), config.geolocation_longitude()) {
                    (Some(latitude), Some(longitude)) => {
                        Geolocator::Fixed(Location { latitude, longitude })
                    }
                    _ => Geolocator::Disabled,
                }
            }
            GeolocationMode::Http => {
                let Some(url) = config.geolocation_url() else {
                    return Geolocator::Disabled;
                };
                match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
                    Ok(client) => Geolocator::http(
                        client,
                        url,
                        Duration::from_secs(config.geolocation_cache_secs()),
                    ),
                    Err(e) => {
                        warn!(error = %e, "geolocation_client_build_failed");
                        Geolocator::Disabled
                    }
                }
            }
        }
    }

    pub fn http(client: reqwest::Client, url: &str, ttl: Duration) -> Self {
        Geolocator::Http {
            client,
            url: url.to_string(),
            ttl,
            failure_backoff: FAILURE_BACKOFF,
            cache: Mutex::new(LocationCache::default()),
        }
    }

    /// Override how long lookups are skipped after a failure (HTTP mode only)
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        if let Geolocator::Http { failure_backoff, .. } = &mut self {
            *failure_backoff = backoff;
        }
        self
    }

    pub fn mode(&self) -> GeolocationMode {
        match self {
            Geolocator::Disabled => GeolocationMode::Disabled,
            Geolocator::Fixed(_) => GeolocationMode::Fixed,
            Geolocator::Http { .. } => GeolocationMode::Http,
        }
    }

    /// Current location, or `None` when unavailable
    pub async fn locate(&self) -> Option<Location> {
        match self {
            Geolocator::Disabled => None,
            Geolocator::Fixed(location) => Some(*location),
            Geolocator::Http { client, url, ttl, failure_backoff, cache } => {
                {
                    let cache = cache.lock();
                    if let Some((location, fetched_at)) = cache.last_good {
                        if fetched_at.elapsed() < *ttl {
                            return Some(location);
                        }
                    }
                    // Still backing off from the last failed lookup
                    if cache.failed_at.is_some_and(|at| at.elapsed() < *failure_backoff) {
                        return None;
                    }
                }

                match fetch_location(client, url).await {
                    Ok(location) => {
                        debug!(lat = %location.latitude, lon = %location.longitude, "geolocation_refreshed");
                        *cache.lock() = LocationCache {
                            last_good: Some((location, Instant::now())),
                            failed_at: None,
                        };
                        Some(location)
                    }
                    Err(e) => {
                        warn!(
                            url = %url,
                            error = %e,
                            retry_in_secs = %failure_backoff.as_secs(),
                            "geolocation_lookup_failed"
                        );
                        cache.lock().failed_at = Some(Instant::now());
                        None
                    }
                }
            }
        }
    }
}

async fn fetch_location(client: &reqwest::Client, url: &str) -> anyhow::Result<Location> {
    let location: Location =
        client.get(url).send().await?.error_for_status()?.json().await?;
    if !location.is_valid() {
        anyhow::bail!("coordinates out of range: {}, {}", location.latitude, location.longitude);
    }
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_disabled_returns_none() {
        let geo = Geolocator::from_config(&Config::default());
        assert_eq!(geo.mode(), GeolocationMode::Disabled);
        assert_eq!(geo.locate().await, None);
    }

    #[tokio::test]
    async fn test_fixed_location() {
        let config = Config::from_toml_str(
            "[geolocation]\nmode = \"fixed\"\nlatitude = 53.35\nlongitude = -6.26\n",
            "inline".to_string(),
        )
        .unwrap();
        let geo = Geolocator::from_config(&config);
        assert_eq!(geo.locate().await, Some(Location { latitude: 53.35, longitude: -6.26 }));
    }

    #[tokio::test]
    async fn test_http_failure_returns_none() {
        // Nothing listens on port 9 locally; the lookup must degrade to None
        let geo = Geolocator::http(
            reqwest::Client::builder().timeout(Duration::from_millis(500)).build().unwrap(),
            "http://127.0.0.1:9/location",
            Duration::from_secs(60),
        );
        assert_eq!(geo.locate().await, None);
    }

    /// Answers every request with `status` and `body`, counting connections
    async fn counting_server(status: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/location", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (url, hits)
    }

    #[tokio::test]
    async fn test_http_failure_skips_lookups_during_backoff() {
        let (url, hits) = counting_server("503 Service Unavailable", "").await;
        let geo = Geolocator::http(reqwest::Client::new(), &url, Duration::from_secs(60));

        assert_eq!(geo.locate().await, None);
        assert_eq!(geo.locate().await, None);
        assert_eq!(geo.locate().await, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Once the backoff has passed the endpoint is tried again
        let geo = geo.with_failure_backoff(Duration::ZERO);
        assert_eq!(geo.locate().await, None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_success_is_cached() {
        let (url, hits) = counting_server("200 OK", r#"{"lat": 53.35, "lng": -6.26}"#).await;
        let geo = Geolocator::http(reqwest::Client::new(), &url, Duration::from_secs(60));

        let expected = Some(Location { latitude: 53.35, longitude: -6.26 });
        assert_eq!(geo.locate().await, expected);
        assert_eq!(geo.locate().await, expected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_location_aliases() {
        let loc: Location = serde_json::from_str(r#"{"lat": 1.5, "lon": 2.5}"#).unwrap();
        assert_eq!(loc, Location { latitude: 1.5, longitude: 2.5 });
        assert!(loc.is_valid());
        assert!(!Location { latitude: 91.0, longitude: 0.0 }.is_valid());
    }
}
