//! Tenant/user identification and trace-id propagation.
//!
//! Required headers on tenant-bound calls: `X-Tenant-Id` (always),
//! `X-User-Id` (chat), `X-Trace-Id` (optional — generated and echoed back
//! when absent).

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use tempo_domain::{Error, Result, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const TRACE_HEADER: &str = "x-trace-id";

/// Extract the tenant context from request headers.
///
/// Falls back to `Authorization: Bearer <tenant>` for callers that cannot
/// set custom headers.
pub fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantContext> {
    let tenant_id = header_str(headers, TENANT_HEADER)
        .or_else(|| bearer_token(headers))
        .ok_or_else(|| Error::Unauthorized("missing tenant identification".into()))?;
    let user_id = header_str(headers, USER_HEADER);
    let trace_id =
        header_str(headers, TRACE_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
    TenantContext::new(tenant_id, user_id, trace_id)
}

/// Like [`tenant_from_headers`], but the user id is mandatory (chat).
pub fn chat_tenant_from_headers(headers: &HeaderMap) -> Result<TenantContext> {
    let tenant = tenant_from_headers(headers)?;
    if tenant.user_id.is_none() {
        return Err(Error::Unauthorized("missing X-User-Id".into()));
    }
    Ok(tenant)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "authorization")?
        .strip_prefix("Bearer ")
        .map(str::to_owned)
}

/// Middleware: propagate (or generate) `X-Trace-Id` onto every response and
/// log request latency.
pub async fn trace_layer(request: Request, next: Next) -> Response {
    let trace_id = header_str(request.headers(), TRACE_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let started = std::time::Instant::now();
    let mut response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    tracing::info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms,
        trace_id = %trace_id,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn extracts_tenant_and_user() {
        let ctx = tenant_from_headers(&headers(&[
            ("x-tenant-id", "t_001"),
            ("x-user-id", "u_9"),
            ("x-trace-id", "tr-abc"),
        ]))
        .unwrap();
        assert_eq!(ctx.tenant_id, "t_001");
        assert_eq!(ctx.user_id.as_deref(), Some("u_9"));
        assert_eq!(ctx.trace_id, "tr-abc");
    }

    #[test]
    fn generates_trace_id_when_absent() {
        let ctx = tenant_from_headers(&headers(&[("x-tenant-id", "t_001")])).unwrap();
        assert!(!ctx.trace_id.is_empty());
    }

    #[test]
    fn bearer_token_is_tenant_fallback() {
        let ctx =
            tenant_from_headers(&headers(&[("authorization", "Bearer t_002")])).unwrap();
        assert_eq!(ctx.tenant_id, "t_002");
    }

    #[test]
    fn missing_tenant_is_unauthorized() {
        let err = tenant_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn chat_requires_user_id() {
        let err = chat_tenant_from_headers(&headers(&[("x-tenant-id", "t_001")])).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(chat_tenant_from_headers(&headers(&[
            ("x-tenant-id", "t_001"),
            ("x-user-id", "u_1"),
        ]))
        .is_ok());
    }
}
