//! HTTP probe implementations for websites and JSON APIs.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use reqwest::Url;

use super::ProbeError;

/// Fetch a URL through a fresh connection pinned to an already resolved IP.
///
/// Returns the response status, the body and the elapsed time in milliseconds
/// from sending the request to reading the last body byte.
async fn fetch(address: &str, ip: IpAddr, timeout: Duration) -> Result<(u16, Vec<u8>, f64), ProbeError> {
    let url = Url::parse(address).map_err(|e| ProbeError::Config(format!("invalid URL {}: {}", address, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::Config(format!("URL {} has no host", address)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    // No pooling: every check measures a cold connection.
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(0)
        .resolve(&host, SocketAddr::new(ip, port))
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| map_reqwest_error(e, timeout))?;
    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let body = response
        .bytes()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))?
        .to_vec();

    Ok((status, body, start.elapsed().as_secs_f64() * 1000.0))
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}

/// Check a website: the page must answer 200.
///
/// Returns latency in milliseconds.
pub async fn check_website(address: &str, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (status, _body, elapsed) = fetch(address, ip, timeout).await?;
    if status != 200 {
        return Err(ProbeError::Status(status));
    }
    Ok(elapsed)
}

/// Check a JSON API: any status, but the body must be valid JSON.
///
/// Returns latency in milliseconds.
pub async fn check_api(address: &str, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (_status, body, elapsed) = fetch(address, ip, timeout).await?;
    validate_json(&body)?;
    Ok(elapsed)
}

fn validate_json(body: &[u8]) -> Result<(), ProbeError> {
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|_| ())
        .map_err(|_| ProbeError::Payload("Invalid JSON".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_json() {
        assert!(validate_json(br#"{"ok":true}"#).is_ok());
        assert!(validate_json(b"[]").is_ok());
        assert!(matches!(validate_json(b"<html>"), Err(ProbeError::Payload(_))));
        assert!(validate_json(b"").is_err());
    }

    #[tokio::test]
    async fn test_website_invalid_url() {
        let result = check_website("not a url", "127.0.0.1".parse().unwrap(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }
}
