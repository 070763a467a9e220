use clap::Parser;
use color_eyre::eyre::eyre;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// The TLS listener always binds this port.
pub const TLS_PORT: u16 = 8443;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Authenticating forwarding HTTP proxy",
    long_about = "porterd relays HTTP requests to origin servers and tunnels arbitrary TCP \
via CONNECT, after checking a Basic credential in Proxy-Authorization.\n\n\
Listeners:\n\
- cleartext HTTP on --port (default 1080)\n\
- TLS on 8443 (HTTP/1.1 and HTTP/2 via ALPN), using --cert/--key or a freshly\n\
  minted self-signed pair written to privkey.pem and cert.pem\n\n\
Requests whose Host equals --hostname are answered with a status page listing\n\
the requests currently in flight."
)]
pub struct Cli {
    /// Cleartext HTTP listen port
    #[arg(short, long, default_value_t = 1080)]
    pub port: u16,

    /// IP address to bind both listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Serve the status page on this hostname (matched against Host, port included)
    #[arg(long)]
    pub hostname: String,

    /// Username for proxy auth
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password for proxy auth
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Skip proxy authentication (the credential header is still stripped)
    #[arg(long, default_value_t = false)]
    pub allow_anonymous: bool,

    /// Certificate file for the TLS listener (requires --key)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key file for the TLS listener (requires --cert)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Comma-separated list of ports CONNECT won't connect to
    #[arg(long, value_delimiter = ',', default_value = "25")]
    pub restricted_ports: Vec<u16>,
}

/// Proxy server configuration derived from CLI arguments.
///
/// Immutable after startup; concurrent readers need no synchronization.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Virtual hostname that routes to the status page
    pub host: String,
    pub user: String,
    pub pass: String,
    pub allow_anonymous: bool,
    /// TCP ports for which CONNECT is refused
    pub restricted_ports: HashSet<u16>,
    pub listen_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Create a ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        if !args.allow_anonymous {
            match (&args.username, &args.password) {
                (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {}
                _ => {
                    return Err(eyre!(
                        "--username and --password are required unless --allow-anonymous is set"
                    ))
                }
            }
        }
        if args.cert.is_some() != args.key.is_some() {
            return Err(eyre!("--cert and --key must be provided together"));
        }
        if args.hostname.is_empty() {
            return Err(eyre!("--hostname must not be empty"));
        }

        Ok(Self {
            host: args.hostname,
            user: args.username.unwrap_or_default(),
            pass: args.password.unwrap_or_default(),
            allow_anonymous: args.allow_anonymous,
            restricted_ports: args.restricted_ports.into_iter().collect(),
            listen_addr: SocketAddr::from((args.listen_ip, args.port)),
            tls_addr: SocketAddr::from((args.listen_ip, TLS_PORT)),
            cert_file: args.cert,
            key_file: args.key,
        })
    }
}
