use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::{database::VoteStore, error::AppError, state::AppState, vote::Vote};

/// Smallest well-formed BMP: a single pixel. Returned for every
/// recorded vote so the endpoint can be embedded as a tracking pixel.
pub const EMPTY_BMP: &[u8] = &[
    0x42, 0x4d, 0x1e, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00, 0x0c,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x18, 0x00, 0x00, 0x00, 0xff, 0x00,
];

pub async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Any GET outside `/health` is a vote submission encoded in the
/// query string.
pub async fn vote_handler<S: VoteStore>(
    State(state): State<Arc<AppState<S>>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<impl IntoResponse, AppError> {
    let client = client_address(&headers, peer.map(|ConnectInfo(addr)| addr));

    let raw = query.unwrap_or_default();
    let vote = Vote::from_query(raw.as_bytes(), client.as_deref())?;

    state.store.append(&vote).await?;

    Ok(([(CONTENT_TYPE, "image/bmp")], EMPTY_BMP))
}

/// The first non-empty `X-Forwarded-For` entry when a proxy supplied
/// one, otherwise the socket peer. Blank entries (stray commas) are
/// skipped, not treated as the end of the list.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded
            .split(',')
            .map(str::trim)
            .find(|entry| !entry.is_empty())
        {
            return Some(first.to_string());
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::client_address;
    use axum::http::HeaderMap;

    #[test]
    fn test_forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "241.129.42.29, 10.0.0.1".parse().unwrap());

        let peer = Some("127.0.0.1:9999".parse().unwrap());
        assert_eq!(
            client_address(&headers, peer).as_deref(),
            Some("241.129.42.29")
        );
    }

    #[test]
    fn test_skips_blank_forwarded_entries() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", ", 241.129.42.29".parse().unwrap());

        let peer = Some("127.0.0.1:9999".parse().unwrap());
        assert_eq!(
            client_address(&headers, peer).as_deref(),
            Some("241.129.42.29")
        );
    }

    #[test]
    fn test_falls_back_to_peer() {
        let peer = Some("192.168.1.5:9999".parse().unwrap());
        assert_eq!(
            client_address(&HeaderMap::new(), peer).as_deref(),
            Some("192.168.1.5")
        );
    }

    #[test]
    fn test_no_address_at_all() {
        assert_eq!(client_address(&HeaderMap::new(), None), None);
    }
}
