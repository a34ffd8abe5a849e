//! A provisioner that creates nothing.
//!
//! Hands out generated credentials and, when configured with a delay,
//! completes operations asynchronously through the completion channel. Lets
//! `broker serve` run end to end without a backing service.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    CompletionDetail, CompletionNotifier, OperationContext, Provisioner, ProvisionerError,
    ProvisionerOutcome,
};
use crate::request::{BindRequest, DeprovisionRequest, ProvisionRequest, UnbindRequest};

#[derive(Debug, Clone)]
pub struct SandboxProvisioner {
    notifier: CompletionNotifier,
    async_delay: Option<Duration>,
    dashboard_base: Option<String>,
}

impl SandboxProvisioner {
    pub fn new(notifier: CompletionNotifier) -> Self {
        Self {
            notifier,
            async_delay: None,
            dashboard_base: None,
        }
    }

    /// Complete every operation after `delay` when the caller accepts
    /// incomplete responses.
    pub fn with_async_delay(mut self, delay: Duration) -> Self {
        self.async_delay = Some(delay);
        self
    }

    pub fn with_dashboard_base(mut self, base: impl Into<String>) -> Self {
        self.dashboard_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    fn goes_async(&self, ctx: &OperationContext) -> bool {
        ctx.accepts_incomplete && (self.async_delay.is_some() || ctx.plan.requires_async)
    }

    /// Run to completion now, or hand `detail` to a delayed completion.
    fn settle(&self, ctx: &OperationContext, detail: CompletionDetail) -> ProvisionerOutcome {
        if !self.goes_async(ctx) {
            return ProvisionerOutcome::Immediate(detail);
        }
        let notifier = self.notifier.clone();
        let delay = self.async_delay.unwrap_or_default();
        let operation_id = ctx.operation_id.clone();
        tokio::spawn(async move {
            notifier.progress(&operation_id, "in progress");
            tokio::time::sleep(delay).await;
            notifier.succeed(&operation_id, detail);
        });
        ProvisionerOutcome::AsyncAccepted {
            description: Some("accepted".to_string()),
        }
    }
}

#[async_trait]
impl Provisioner for SandboxProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        let dashboard_url = self
            .dashboard_base
            .as_ref()
            .map(|base| format!("{base}/instances/{}", request.instance_id));
        Ok(self.settle(
            ctx,
            CompletionDetail {
                description: Some(format!("provisioned plan {}", ctx.plan.plan_name)),
                dashboard_url,
                credentials: None,
            },
        ))
    }

    async fn deprovision(
        &self,
        _request: &DeprovisionRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        Ok(self.settle(
            ctx,
            CompletionDetail {
                description: Some("deprovisioned".to_string()),
                ..Default::default()
            },
        ))
    }

    async fn bind(
        &self,
        request: &BindRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        let username: String = request
            .binding_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        let credentials = json!({
            "username": format!("u_{username}"),
            "password": uuid::Uuid::new_v4().to_string(),
        });
        Ok(self.settle(
            ctx,
            CompletionDetail {
                description: Some("bound".to_string()),
                dashboard_url: None,
                credentials: Some(credentials),
            },
        ))
    }

    async fn unbind(
        &self,
        _request: &UnbindRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        Ok(self.settle(
            ctx,
            CompletionDetail {
                description: Some("unbound".to_string()),
                ..Default::default()
            },
        ))
    }
}
