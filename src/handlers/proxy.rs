use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri, Version},
    response::Response,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::AppError;
use crate::config::ConfigError;
use crate::AppState;

pub type UpstreamClient = Client<HttpConnector, Body>;

/// Headers that only make sense for a single connection and must not be
/// forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The single target service every request is forwarded to.
pub struct Upstream {
    client: UpstreamClient,
    base_url: String,
    timeout: Duration,
}

impl Upstream {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, ConfigError> {
        let base_url = format!("http://{host}:{port}");
        let uri: Uri = base_url
            .parse()
            .map_err(|e| ConfigError::InvalidTarget(format!("{base_url}: {e}")))?;
        if uri.authority().is_none() {
            return Err(ConfigError::InvalidTarget(base_url));
        }

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// `http://host:port`
    pub fn target(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ─── Fallback: everything not served locally ─────────────────────

/// Forwards the request to the upstream and streams its response back.
/// Connection failures become 502, timeouts 504.
pub async fn forward(
    State(state): State<Arc<AppState>>,
    mut req: Request,
) -> Result<Response, AppError> {
    let upstream = &state.upstream;

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let target = format!(
        "{}{}",
        upstream.base_url,
        req.uri().path_and_query().map_or("/", |pq| pq.as_str())
    );
    *req.uri_mut() = target
        .parse()
        .map_err(|e| AppError::BadRequest(format!("invalid request target: {e}")))?;
    *req.version_mut() = Version::HTTP_11;

    strip_hop_by_hop(req.headers_mut());
    if let Some(ip) = client_ip {
        append_forwarded_for(req.headers_mut(), ip);
    }

    let timeout = upstream.timeout();
    let response = match tokio::time::timeout(timeout, upstream.client.request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(target_url = %target, error = %e, "upstream request failed");
            return Err(AppError::BadGateway(e.to_string()));
        }
        Err(_) => {
            warn!(target_url = %target, timeout = ?timeout, "upstream request timed out");
            return Err(AppError::GatewayTimeout(timeout));
        }
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in `Connection` are hop-by-hop as well.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
