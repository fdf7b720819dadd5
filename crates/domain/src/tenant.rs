//! Tenant identity carried through the call chain.
//!
//! Every stored key, every event, and every external call is scoped by the
//! tenant id from this context.

use crate::error::{Error, Result};

/// Immutable tenant identity for request-scoped operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub trace_id: String,
}

impl TenantContext {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: Option<String>,
        trace_id: impl Into<String>,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        if tenant_id.is_empty() {
            return Err(Error::Unauthorized("missing tenant identification".into()));
        }
        Ok(Self {
            tenant_id,
            user_id,
            trace_id: trace_id.into(),
        })
    }

    /// The user id, or a placeholder for tenant-only calls.
    pub fn user_or_anonymous(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tenant_is_unauthorized() {
        let err = TenantContext::new("", None, "tr").unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn anonymous_fallback() {
        let ctx = TenantContext::new("t1", None, "tr").unwrap();
        assert_eq!(ctx.user_or_anonymous(), "anonymous");
        let ctx = TenantContext::new("t1", Some("u1".into()), "tr").unwrap();
        assert_eq!(ctx.user_or_anonymous(), "u1");
    }
}
