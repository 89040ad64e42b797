use std::sync::Arc;

use loanserve_tenancy::CreateTenantRequest;
use loanserve_tenancy::Tenant;
use loanserve_tenancy::TenancyResult;
use loanserve_tenancy::TenancyService;
use loanserve_tenancy::TenantId;

#[derive(Clone)]
pub struct TenancyFacade {
    service: Arc<dyn TenancyService>,
}

impl TenancyFacade {
    pub fn new(service: Arc<dyn TenancyService>) -> Self {
        Self { service }
    }

    pub async fn create_tenant(&self, request: CreateTenantRequest) -> TenancyResult<Tenant> {
        let request = request.normalize()?;
        self.service.create_tenant(request).await
    }

    pub async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        self.service.list_tenants().await
    }

    pub async fn get_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        self.service.get_tenant(tenant_id).await
    }

    pub async fn suspend_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        self.service.suspend_tenant(tenant_id).await
    }

    pub async fn reactivate_tenant(&self, tenant_id: &TenantId) -> TenancyResult<Tenant> {
        self.service.reactivate_tenant(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loanserve_tenancy::InMemoryTenancyService;
    use loanserve_tenancy::TenantStatus;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn facade_round_trips() {
        let service: Arc<dyn TenancyService> = Arc::new(InMemoryTenancyService::new());
        let facade = TenancyFacade::new(service);

        let tenant = facade
            .create_tenant(CreateTenantRequest {
                name: "  Example Servicer  ".into(),
            })
            .await
            .expect("tenant should be created");
        assert_eq!(tenant.name, "Example Servicer");
        assert_eq!(tenant.status, TenantStatus::Active);

        let listed = facade.list_tenants().await.expect("tenants should list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], tenant);

        let fetched = facade
            .get_tenant(&tenant.id)
            .await
            .expect("tenant should be fetched");
        assert_eq!(fetched, tenant);

        let suspended = facade
            .suspend_tenant(&tenant.id)
            .await
            .expect("tenant should be suspended");
        assert_eq!(suspended.status, TenantStatus::Suspended);

        let reactivated = facade
            .reactivate_tenant(&tenant.id)
            .await
            .expect("tenant should be reactivated");
        assert_eq!(reactivated.status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn facade_rejects_blank_tenant_name() {
        let service: Arc<dyn TenancyService> = Arc::new(InMemoryTenancyService::new());
        let facade = TenancyFacade::new(service);

        let err = facade
            .create_tenant(CreateTenantRequest { name: "   ".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, loanserve_tenancy::TenancyError::Validation(_)));
    }
}
