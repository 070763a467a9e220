use clap::Parser;
use color_eyre::eyre::Result;
use porterd::config::{Cli, ProxyConfig};
use porterd::dispatch::ProxyState;
use porterd::{server, tls};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("porterd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    let (chain, key) = match (&config.cert_file, &config.key_file) {
        (Some(cert_path), Some(key_path)) => tls::load_identity(cert_path, key_path)?,
        _ => {
            // The status hostname may carry a port; the certificate wants
            // the bare name.
            let hostname = config.host.split(':').next().unwrap_or(&config.host);
            let leaf = tls::self_signed(hostname)?;
            tls::persist(&leaf)?;
            info!("minted self-signed certificate for {}; wrote privkey.pem and cert.pem", hostname);
            (vec![leaf.cert_der.clone()], leaf.key_der)
        }
    };
    let acceptor = TlsAcceptor::from(tls::server_config(chain, key)?);

    let state = Arc::new(ProxyState::new(config));

    let plain_listener = TcpListener::bind(state.config.listen_addr).await?;
    let tls_listener = TcpListener::bind(state.config.tls_addr).await?;
    info!("HTTP proxy listening on http://{}", state.config.listen_addr);
    info!("TLS proxy listening on https://{}", state.config.tls_addr);

    tokio::select! {
        _ = server::serve_plain(plain_listener, state.clone()) => {}
        _ = server::serve_tls(tls_listener, acceptor, state.clone()) => {}
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
