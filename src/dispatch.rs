use crate::auth;
use crate::config::ProxyConfig;
use crate::headers;
use crate::registry::{RequestGuard, RequestRegistry};
use crate::status;
use crate::tunnel;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// State shared by both listeners: the frozen configuration and the registry
/// of in-flight requests.
#[derive(Debug)]
pub struct ProxyState {
    pub config: ProxyConfig,
    pub registry: Arc<RequestRegistry>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RequestRegistry::default()),
        }
    }
}

/// Per-request entry point, shared by the cleartext and TLS listeners.
///
/// Routes, in order: the status virtual host, the authentication gate,
/// CONNECT tunneling, plain forwarding. A registry entry is held for the
/// whole lifetime of the request; for CONNECT its guard moves into the
/// tunnel task so the entry survives until both pump directions are done.
pub async fn dispatch(
    state: Arc<ProxyState>,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let guard = RequestGuard::new(state.registry.clone(), req.method(), req.uri());
    debug!("#{} {} {}", guard.id(), req.method(), req.uri());

    if request_host(&req).as_deref() == Some(state.config.host.as_str()) {
        return Ok(status::handle(&state, req.headers_mut()));
    }

    if !auth::check_credentials(req.headers_mut(), &PROXY_AUTHORIZATION, &state.config) {
        debug!("#{} rejected: proxy auth required", guard.id());
        return Ok(proxy_auth_required());
    }

    if req.method() == Method::CONNECT {
        return Ok(tunnel::handle_connect(state, req, guard).await);
    }

    Ok(forward(req).await)
}

/// Relay a plain HTTP request to its origin server and stream the answer
/// back. Redirects are left to the client; the origin's protocol version is
/// never echoed (an HTTP/1.0 origin still yields an HTTP/1.1 reply).
async fn forward(req: Request<Incoming>) -> Response<ProxyBody> {
    match round_trip(req).await {
        Ok(resp) => resp,
        Err(error) => {
            warn!("forward failed: {}", error);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
        }
    }
}

async fn round_trip(req: Request<Incoming>) -> Result<Response<ProxyBody>, BoxError> {
    let target = target_uri(&req)?;
    let host = target
        .host()
        .ok_or("request target has no host")?
        .to_string();
    let port = target.port_u16().unwrap_or(80);
    let authority = target
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_else(|| host.clone());

    let (parts, body) = req.into_parts();

    // A declared empty body is sent as such, never with chunked framing.
    let outbound_body = if is_empty_body(&parts) {
        empty()
    } else {
        body.map_err(|error| Box::new(error) as BoxError).boxed()
    };

    let mut outbound = Request::new(outbound_body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()?;
    *outbound.headers_mut() = parts.headers;
    headers::strip_hop_by_hop(outbound.headers_mut());
    outbound
        .headers_mut()
        .insert(HOST, HeaderValue::from_str(&authority)?);

    let stream = TcpStream::connect((host.as_str(), port)).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;

    // The driver owns the upstream socket until the response body is done.
    // When the client goes away hyper drops this request's future, the
    // in-flight round trip with it, and the driver winds down.
    tokio::task::spawn(async move {
        if let Err(error) = conn.await {
            debug!("upstream connection ended: {}", error);
        }
    });

    let resp = sender.send_request(outbound).await?;
    let (mut parts, body) = resp.into_parts();
    headers::strip_response(&mut parts.headers);
    parts.version = Version::HTTP_11;
    Ok(Response::from_parts(
        parts,
        body.map_err(|error| Box::new(error) as BoxError).boxed(),
    ))
}

/// Resolve the URL a request should be forwarded to. Absolute-form targets
/// are used verbatim; origin-form targets are rebuilt from the Host header.
fn target_uri(req: &Request<Incoming>) -> Result<Uri, BoxError> {
    if req.uri().scheme().is_some() {
        return Ok(req.uri().clone());
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or("request has no Host header")?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(format!("http://{host}{path_and_query}").parse()?)
}

fn is_empty_body(parts: &http::request::Parts) -> bool {
    parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim() == "0")
        .unwrap_or(false)
}

/// The request's notion of its own host: the Host header when present,
/// otherwise the URI authority (HTTP/2 carries it there). Compared byte-exact
/// against the configured status hostname, port included.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|authority| authority.to_string()))
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text error response in the shape clients of the original expect:
/// status text body with a trailing newline.
pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{message}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn proxy_auth_required() -> Response<ProxyBody> {
    let mut resp = status_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    resp.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"proxy\""),
    );
    resp
}
