use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers scoped to a single transport connection, never forwarded by a
/// proxy (RFC 7230 section 6.1, plus `Public` from RFC 2068 section 14.35).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "public",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers from a message about to be forwarded.
///
/// Names listed in the message's own `Connection` header are resolved and
/// removed first, then the fixed set. The order matters: a client cannot
/// smuggle a fixed-set name through `Connection` and have it survive, and a
/// `Connection: connection` entry cannot recurse.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in nominated {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Remove headers a proxy must not relay from an origin response.
///
/// RFC 2068 section 14.35 requires `Public` to be stripped.
pub fn strip_response(headers: &mut HeaderMap) {
    headers.remove("public");
}
