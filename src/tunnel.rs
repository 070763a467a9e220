use crate::config::ProxyConfig;
use crate::dispatch::{empty, status_response, ProxyBody, ProxyState};
use crate::registry::{RequestGuard, TunnelSide};
use http::uri::Authority;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};

/// Why a CONNECT request was refused before a tunnel came up.
#[derive(Debug, thiserror::Error)]
enum TunnelError {
    #[error("DNS Resolution Failed: {0}")]
    Resolve(String),
    #[error("Connection to port {0} is restricted")]
    Restricted(u16),
    #[error("{0}")]
    Upstream(#[from] std::io::Error),
}

impl TunnelError {
    fn status(&self) -> StatusCode {
        match self {
            TunnelError::Resolve(_) => StatusCode::BAD_GATEWAY,
            TunnelError::Restricted(_) => StatusCode::FORBIDDEN,
            TunnelError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handle a CONNECT request: open the upstream socket, answer 200 and hand
/// the connection to a background task that pumps bytes both ways.
///
/// The 200 head is written by hyper once this response is returned; the
/// upgrade future then yields the client's end of the connection. On HTTP/1.1
/// that is the hijacked socket with its buffered I/O, on HTTP/2 a stream that
/// maps reads and writes onto DATA frames and flushes as it goes. Either way
/// the pump below sees one bidirectional byte stream.
pub async fn handle_connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    guard: RequestGuard,
) -> Response<ProxyBody> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => {
            return status_response(
                StatusCode::BAD_GATEWAY,
                &format!("DNS Resolution Failed: {}", req.uri()),
            )
        }
    };

    let upstream = match establish(&state.config, &authority).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!("CONNECT {} refused: {}", authority, error);
            return status_response(error.status(), &error.to_string());
        }
    };

    let id = guard.id();
    tokio::task::spawn(async move {
        // The guard lives for the whole tunnel; the registry entry goes away
        // only after both copiers are done.
        let _guard = guard;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                run_tunnel(state, id, TokioIo::new(upgraded), upstream).await;
                debug!("tunnel #{} to {} closed", id, authority);
            }
            Err(error) => warn!("CONNECT {} upgrade failed: {}", authority, error),
        }
    });

    Response::new(empty())
}

/// Resolve and dial the tunnel target, enforcing the restricted-ports policy.
async fn establish(config: &ProxyConfig, authority: &Authority) -> Result<TcpStream, TunnelError> {
    let port = authority
        .port_u16()
        .ok_or_else(|| TunnelError::Resolve(authority.to_string()))?;
    let mut addrs = lookup_host(authority.as_str())
        .await
        .map_err(|_| TunnelError::Resolve(authority.to_string()))?;
    let addr = addrs
        .next()
        .ok_or_else(|| TunnelError::Resolve(authority.to_string()))?;
    if config.restricted_ports.contains(&port) {
        return Err(TunnelError::Restricted(port));
    }
    Ok(TcpStream::connect(addr).await?)
}

/// Pump bytes between the client connection and the upstream socket until
/// both directions have seen end-of-stream.
///
/// Each direction runs as its own task. When the up copier finishes it shuts
/// down the write half of the upstream socket, so the origin observes EOF
/// while its remaining responses still drain through the down copier. A
/// failed copier never tears down its peer; the tunnel ends when both have
/// returned.
async fn run_tunnel<C>(state: Arc<ProxyState>, id: u64, client: C, upstream: TcpStream)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let up_state = state.clone();
    let up = tokio::task::spawn(async move {
        let copied = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
        up_state.registry.mark(id, TunnelSide::Up);
        copied
    });

    let down_state = state.clone();
    let down = tokio::task::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        down_state.registry.mark(id, TunnelSide::Down);
        copied
    });

    let (up_result, down_result) = tokio::join!(up, down);
    match up_result {
        Ok(Ok(bytes)) => debug!("tunnel #{} sent {} bytes upstream", id, bytes),
        Ok(Err(error)) => warn!("tunnel #{} client to upstream: {}", id, error),
        Err(error) => warn!("tunnel #{} up copier panicked: {}", id, error),
    }
    match down_result {
        Ok(Ok(bytes)) => debug!("tunnel #{} received {} bytes", id, bytes),
        Ok(Err(error)) => warn!("tunnel #{} upstream to client: {}", id, error),
        Err(error) => warn!("tunnel #{} down copier panicked: {}", id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_config(restricted: &[u16]) -> ProxyConfig {
        ProxyConfig {
            host: "proxy.example.com".to_string(),
            user: "user".to_string(),
            pass: "pass".to_string(),
            allow_anonymous: false,
            restricted_ports: restricted.iter().copied().collect::<HashSet<u16>>(),
            listen_addr: "127.0.0.1:1080".parse().unwrap(),
            tls_addr: "127.0.0.1:8443".parse().unwrap(),
            cert_file: None,
            key_file: None,
        }
    }

    #[tokio::test]
    async fn refuses_restricted_port_without_dialing() {
        let authority: Authority = "127.0.0.1:25".parse().unwrap();
        let error = establish(&test_config(&[25]), &authority)
            .await
            .expect_err("port 25 must be refused");
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        assert_eq!(error.to_string(), "Connection to port 25 is restricted");
    }

    #[tokio::test]
    async fn missing_port_is_a_resolution_failure() {
        let authority: Authority = "example.com".parse().unwrap();
        let error = establish(&test_config(&[]), &authority)
            .await
            .expect_err("authority without port must fail");
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error.to_string(), "DNS Resolution Failed: example.com");
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_resolution_failure() {
        let authority: Authority = "does-not-exist.invalid:443".parse().unwrap();
        let error = establish(&test_config(&[]), &authority)
            .await
            .expect_err("bogus host must fail");
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
        assert!(error
            .to_string()
            .starts_with("DNS Resolution Failed: does-not-exist.invalid"));
    }
}
