use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::CreateTenantRequest;
use crate::Tenant;
use crate::TenancyError;
use crate::TenancyResult;
use crate::TenancyService;
use crate::TenantId;
use crate::TenantStatus;

#[derive(Default)]
struct TenancyState {
    tenants: HashMap<TenantId, Tenant>,
}

pub struct InMemoryTenancyService {
    state: RwLock<TenancyState>,
}

impl InMemoryTenancyService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TenancyState::default()),
        }
    }

    #[must_use]
    pub fn from_tenants(tenants: Vec<Tenant>) -> Self {
        let mut map = HashMap::new();
        for tenant in tenants {
            map.insert(tenant.id, tenant);
        }
        Self {
            state: RwLock::new(TenancyState { tenants: map }),
        }
    }

    pub async fn export_tenants(&self) -> Vec<Tenant> {
        self.state.read().await.tenants.values().cloned().collect()
    }

    fn ensure_unique_name(state: &TenancyState, name: &str) -> TenancyResult<()> {
        let normalized = name.trim().to_ascii_lowercase();
        let conflict = state
            .tenants
            .values()
            .any(|tenant| tenant.name.trim().to_ascii_lowercase() == normalized);
        if conflict {
            return Err(TenancyError::Conflict(format!(
                "tenant {name} already exists"
            )));
        }
        Ok(())
    }

    fn require_tenant<'a>(
        tenant_id: &TenantId,
        state: &'a TenancyState,
    ) -> TenancyResult<&'a Tenant> {
        state
            .tenants
            .get(tenant_id)
            .ok_or_else(|| TenancyError::NotFound(format!("tenant {tenant_id}")))
    }
}

impl Default for InMemoryTenancyService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenancyService for InMemoryTenancyService {
    async fn create_tenant(&self, request: CreateTenantRequest) -> TenancyResult<Tenant> {
        let request = request.normalize()?;
        let mut state = self.state.write().await;
        Self::ensure_unique_name(&state, &request.name)?;

        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: request.name,
            status: TenantStatus::Active,
            created_at: Utc::now(),
        };
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        let state = self.state.read().await;
        let mut tenants = state.tenants.values().cloned().collect::<Vec<_>>();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        let state = self.state.read().await;
        Self::require_tenant(tenant_id, &state).cloned()
    }

    async fn suspend_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        let mut state = self.state.write().await;
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TenancyError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.status = TenantStatus::Suspended;
        Ok(tenant.clone())
    }

    async fn reactivate_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        let mut state = self.state.write().await;
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TenancyError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.status = TenantStatus::Active;
        Ok(tenant.clone())
    }
}
