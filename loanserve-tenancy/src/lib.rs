#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

mod in_memory;

pub use crate::in_memory::InMemoryTenancyService;

pub type TenantId = Uuid;

/// Session variable name every scoped connection checkout sets before doing
/// any tenant-owned work (spec 4.10).
pub const TENANT_SESSION_VARIABLE: &str = "app.tenant_id";

pub type TenancyResult<T> = Result<T, TenancyError>;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantStatus::Active => write!(f, "active"),
            TenantStatus::Suspended => write!(f, "suspended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTenantRequest {
    pub name: String,
}

impl CreateTenantRequest {
    pub fn normalize(mut self) -> Result<Self, TenancyError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(TenancyError::Validation(
                "tenant name cannot be empty".into(),
            ));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait TenancyService: Send + Sync {
    async fn create_tenant(&self, request: CreateTenantRequest) -> TenancyResult<Tenant>;

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>>;

    async fn get_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant>;

    async fn suspend_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant>;

    async fn reactivate_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant>;
}

/// A live connection checkout with the tenant session variable already set.
///
/// Construction is the only way to obtain one, which is the point: nothing
/// downstream can run a query without a `TenantSession` in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantSession {
    tenant_id: TenantId,
}

impl TenantSession {
    /// Equivalent of `SET LOCAL app.tenant_id = <tenant_id>` on a checked-out
    /// connection. Fails fast on anything that is not a well-formed tenant id.
    pub fn open(tenant_id: TenantId) -> TenancyResult<Self> {
        if tenant_id.is_nil() {
            return Err(TenancyError::Validation(
                "tenant_id must not be the nil UUID".into(),
            ));
        }
        Ok(Self { tenant_id })
    }

    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Every service entry point calls this before touching tenant-owned rows.
pub fn assert_tenant_context(session: Option<&TenantSession>) -> TenancyResult<TenantSession> {
    session
        .copied()
        .ok_or_else(|| TenancyError::Policy("no tenant context set on this session".into()))
}

/// Maintenance/admin access path. Deliberately distinct from `TenantSession`
/// so it cannot be reached from a request handler by accident; every use
/// must carry a human-readable reason for the audit trail.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub reason: String,
    opened_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn open(reason: impl Into<String>) -> TenancyResult<Self> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(TenancyError::Policy(
                "admin session requires a logged reason".into(),
            ));
        }
        Ok(Self {
            reason,
            opened_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_status_display() {
        assert_eq!(TenantStatus::Active.to_string(), "active");
        assert_eq!(TenantStatus::Suspended.to_string(), "suspended");
    }

    #[test]
    fn create_request_normalizes() {
        let result = CreateTenantRequest {
            name: "  Example Servicer  ".into(),
        }
        .normalize()
        .expect("request should normalize");
        assert_eq!(result.name, "Example Servicer");
    }

    #[test]
    fn create_request_rejects_blank_name() {
        let err = CreateTenantRequest { name: "   ".into() }
            .normalize()
            .unwrap_err();
        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[test]
    fn tenant_session_rejects_nil_uuid() {
        let err = TenantSession::open(Uuid::nil()).unwrap_err();
        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[test]
    fn tenant_session_accepts_well_formed_uuid() {
        let session = TenantSession::open(Uuid::new_v4()).expect("session should open");
        assert!(!session.tenant_id().is_nil());
    }

    #[test]
    fn assert_tenant_context_requires_session() {
        let err = assert_tenant_context(None).unwrap_err();
        assert!(matches!(err, TenancyError::Policy(_)));
    }

    #[test]
    fn assert_tenant_context_passes_through_session() {
        let session = TenantSession::open(Uuid::new_v4()).expect("session should open");
        let asserted = assert_tenant_context(Some(&session)).expect("context should be present");
        assert_eq!(asserted.tenant_id(), session.tenant_id());
    }

    #[test]
    fn admin_session_requires_reason() {
        let err = AdminSession::open("  ").unwrap_err();
        assert!(matches!(err, TenancyError::Policy(_)));
    }

    #[test]
    fn admin_session_records_reason() {
        let session = AdminSession::open("quarterly migration backfill").expect("should open");
        assert_eq!(session.reason, "quarterly migration backfill");
    }
}
