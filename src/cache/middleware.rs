//! Response cache middleware.
//!
//! Caches GET responses of the routes it wraps under one namespace, serves cached
//! responses verbatim and commits 2xx responses before they leave the service.
//! Apply it with `route_layer` so path parameters are visible to the key builder.

use std::sync::Arc;

use axum::{
    body::{Body, BodyDataStream, HttpBody},
    extract::{FromRequestParts, RawPathParams, State},
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode,
        header::{ACCEPT_LANGUAGE, CONTENT_LENGTH, HOST},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use tracing::{debug, error, instrument, warn};
use url::form_urlencoded;

use super::{
    CacheConfig,
    error::CacheError,
    keys::{NegotiatedLocale, Principal, RequestContext},
    store::CachedResponse,
    view::{CachedView, Lookup},
};

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub view: Arc<CachedView>,
}

/// Middleware for response caching.
///
/// Only GET requests are looked up and only 2xx responses are committed. A request
/// without an identifiable target is a wiring error and is answered with 500.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enable_response_cache || request.method() != Method::GET {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let context = match request_context(&mut parts, &cache.config.default_locale).await {
        Ok(context) => context,
        Err(err) => {
            error!(
                reference = cache.view.namespace().reference(),
                error = %err,
                "Response cache applied outside a valid request context"
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let request = Request::from_parts(parts, body);

    let key = match cache.view.lookup(&context).await {
        Lookup::Hit(cached) => return build_response(cached),
        Lookup::Miss(key) => key,
    };

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let limit = cache.config.response_body_limit_bytes;
    if exceeds_limit(&response, limit) {
        debug!(limit, "Response exceeds cacheable size, passing through");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match buffer_body(body, limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Oversized(body) => {
            debug!(limit, "Streamed response exceeds cacheable size, passing through");
            return Response::from_parts(parts, body);
        }
        Buffered::Failed(body) => {
            warn!("Response body failed while buffering, passing through uncached");
            return Response::from_parts(parts, body);
        }
    };

    let cached = CachedResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect(),
        body: bytes.clone(),
    };
    cache.view.commit(&key, cached).await;

    Response::from_parts(parts, Body::from(bytes))
}

/// Derive the key builder's view of an HTTP request.
pub async fn request_context(
    parts: &mut Parts,
    default_locale: &str,
) -> Result<RequestContext, CacheError> {
    let target = absolute_target(parts)?;
    let locale = negotiated_locale(parts, default_locale);

    let mut context = RequestContext::new(&target, locale)?;

    // Missing path params only mean the layer was not applied per route.
    if let Ok(params) = RawPathParams::from_request_parts(parts, &()).await {
        context = context.with_params(params.iter());
    }
    if let Some(query) = parts.uri.query() {
        context = context.with_params(form_urlencoded::parse(query.as_bytes()));
    }

    let principal = parts
        .extensions
        .get::<Principal>()
        .map(|principal| principal.0.clone());
    Ok(context.with_principal(principal))
}

fn absolute_target(parts: &Parts) -> Result<String, CacheError> {
    let uri = &parts.uri;
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| CacheError::invalid_request("request has neither an absolute URI nor a Host header"))?;
    let scheme = parts
        .headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());

    Ok(format!("{scheme}://{host}{path_and_query}"))
}

/// Locale from the `NegotiatedLocale` extension, then `Accept-Language`, then the
/// configured default. Every source is normalized the same way.
fn negotiated_locale(parts: &Parts, default_locale: &str) -> String {
    parts
        .extensions
        .get::<NegotiatedLocale>()
        .and_then(|locale| normalize_locale(&locale.0))
        .or_else(|| {
            parts
                .headers
                .get(ACCEPT_LANGUAGE)
                .and_then(|value| value.to_str().ok())
                .and_then(first_language_tag)
        })
        .or_else(|| normalize_locale(default_locale))
        .unwrap_or_default()
}

/// First concrete tag of an `Accept-Language` header.
fn first_language_tag(header: &str) -> Option<String> {
    header
        .split(',')
        .filter_map(|entry| entry.split(';').next())
        .map(str::trim)
        .filter(|tag| *tag != "*")
        .find_map(normalize_locale)
}

fn normalize_locale(tag: &str) -> Option<String> {
    let tag = tag.trim();
    (!tag.is_empty()).then(|| tag.to_ascii_lowercase())
}

/// True when the body is known to be larger than `limit`, from either the
/// `Content-Length` header or the body's own size hint.
fn exceeds_limit(response: &Response, limit: usize) -> bool {
    let limit = limit as u64;
    let declared = declared_length(response.headers());
    let hinted = response.body().size_hint().lower();
    declared.is_some_and(|length| length > limit) || hinted > limit
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

enum Buffered {
    Complete(Bytes),
    /// The body grew past the limit; frames already read are replayed in front.
    Oversized(Body),
    /// The body errored; frames already read are replayed before the error.
    Failed(Body),
}

/// Read a body of unknown size into memory, stopping as soon as it exceeds `limit`.
async fn buffer_body(body: Body, limit: usize) -> Buffered {
    let mut rest = body.into_data_stream();
    let mut chunks = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = rest.next().await {
        match frame {
            Ok(chunk) => {
                total += chunk.len();
                chunks.push(chunk);
                if total > limit {
                    return Buffered::Oversized(replay(chunks, None, rest));
                }
            }
            Err(err) => {
                debug!(error = %err, "Response body stream failed");
                return Buffered::Failed(replay(chunks, Some(err), rest));
            }
        }
    }

    let mut bytes = BytesMut::with_capacity(total);
    for chunk in chunks {
        bytes.extend_from_slice(&chunk);
    }
    Buffered::Complete(bytes.freeze())
}

fn replay(chunks: Vec<Bytes>, error: Option<axum::Error>, rest: BodyDataStream) -> Body {
    let read = chunks.into_iter().map(Ok).chain(error.map(Err));
    Body::from_stream(stream::iter(read).chain(rest))
}

/// Build a response from cached data.
fn build_response(cached: CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);

    for (name, value) in cached.headers {
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, header_value);
        }
    }

    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
