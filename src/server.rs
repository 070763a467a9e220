use crate::dispatch::{dispatch, ProxyState};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Serve the cleartext listener. Every connection gets its own task; CONNECT
/// upgrades hand the raw socket over to the tunnel engine.
pub async fn serve_plain(listener: TcpListener, state: Arc<ProxyState>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!("accept error: {} (continuing)", error);
                continue;
            }
        };
        let state = state.clone();
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| dispatch(state.clone(), req));

            if let Err(error) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("connection from {} ended: {}", peer_addr, error);
            }
        });
    }
}

/// Serve the TLS listener. ALPN selects HTTP/1.1 or HTTP/2 per connection
/// and the auto builder drives whichever was negotiated, with CONNECT
/// upgrades available on both.
pub async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, state: Arc<ProxyState>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!("accept error: {} (continuing)", error);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::task::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(error) => {
                    debug!("TLS handshake with {} failed: {}", peer_addr, error);
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req| dispatch(state.clone(), req));

            if let Err(error) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                debug!("TLS connection from {} ended: {}", peer_addr, error);
            }
        });
    }
}
