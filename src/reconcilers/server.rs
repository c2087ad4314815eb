//! PostgresqlServer reconciler

use std::time::Instant;

use tracing::{debug, info, warn};

use super::diff::only_action_label_removed;
use super::{update_status, ActionSlot, Command, Outcome, ReconcileContext, ReconcileRequest};
use crate::adapters::{Advisory, ResourceKind};
use crate::backends::{Selection, ServerRef};
use crate::credentials::{CredentialBundle, CredentialManager, HolderRole};
use crate::crd::{DeploymentPhase, PostgresqlServerSpec};
use crate::error::{Error, Result};
use crate::metrics;

/// Create or update a server
pub async fn apply(ctx: &ReconcileContext, request: ReconcileRequest<PostgresqlServerSpec>) -> Result<Outcome> {
    if only_action_label_removed(&request.diff) {
        debug!(name = %request.name, "Only the action label was removed, nothing to do");
        return Ok(Outcome::Unchanged);
    }

    let resource = request.resource(ResourceKind::Server);
    let server = ServerRef::new(&request.namespace, &request.name);
    let selection = select_backend(ctx, &request).await?;
    let backend_name = selection.kind.as_str();

    info!(server = %server, backend = backend_name, "Reconciling PostgresqlServer");

    if let Err(reason) = selection.backend.validate(&server, &request.spec) {
        warn!(server = %server, reason = %reason, "Validation failed");
        let message = format!("Validation failed: {}", reason);
        update_status(
            ctx.resources.as_ref(),
            &resource,
            request.status.as_ref(),
            DeploymentPhase::Failed,
            Some(message),
            None,
        )
        .await?;
        return Err(Error::validation(reason));
    }

    let secret_name = request.spec.credentials_secret.as_str();
    let holder = CredentialManager::holder_name(HolderRole::Server, &request.namespace, &request.name);
    let mut resolved = ctx
        .credentials
        .resolve(&request.namespace, secret_name, &holder)
        .await?;

    let slot = ActionSlot::from_labels(&request.labels);
    let mut confirmation = None;
    if slot.command() == Some(Command::ResetPassword) {
        if resolved.is_committed() {
            let previous = ctx
                .credentials
                .committed(&request.namespace, secret_name)
                .await?
                .map(|data| CredentialBundle::from_secret_data(secret_name, &data))
                .transpose()?;

            resolved = ctx
                .credentials
                .reset(&request.namespace, secret_name, &holder)
                .await?;

            if let Some(admin) = previous {
                if selection.backend.server_exists(&server).await? {
                    selection
                        .backend
                        .update_user_password(&server, &admin, &admin.username, &resolved.password)
                        .await?;
                }
            }
            metrics::PASSWORD_RESETS
                .with_label_values(&[ResourceKind::Server.as_str()])
                .inc();
        }
        confirmation = Some("Admin password reset");
    }
    slot.acknowledge(ctx.resources.as_ref(), &resource, confirmation)
        .await?;

    let password_changed = !resolved.is_committed();

    update_status(
        ctx.resources.as_ref(),
        &resource,
        request.status.as_ref(),
        DeploymentPhase::Working,
        None,
        Some(backend_name),
    )
    .await?;

    let started = Instant::now();
    let provisioned = selection
        .backend
        .create_or_update_server(&server, &request.spec, &resolved.password, password_changed)
        .await?;
    metrics::PROVISION_DURATION
        .with_label_values(&[ResourceKind::Server.as_str(), backend_name])
        .observe(started.elapsed().as_secs_f64());

    for message in &provisioned.warnings {
        ctx.resources
            .publish(&resource, &Advisory::warning("CloudProviderWarning", message))
            .await;
    }

    ctx.credentials
        .commit(
            &request.namespace,
            secret_name,
            &holder,
            &provisioned.credentials,
            !resolved.is_committed(),
        )
        .await?;

    update_status(
        ctx.resources.as_ref(),
        &resource,
        request.status.as_ref(),
        DeploymentPhase::Finished,
        Some("Database server created".to_string()),
        Some(backend_name),
    )
    .await?;

    info!(server = %server, backend = backend_name, "PostgresqlServer ready");
    Ok(Outcome::Finished)
}

/// Tear down a server and its credentials
pub async fn cleanup(ctx: &ReconcileContext, request: ReconcileRequest<PostgresqlServerSpec>) -> Result<()> {
    let server = ServerRef::new(&request.namespace, &request.name);
    let selection = select_backend(ctx, &request).await?;

    info!(server = %server, backend = selection.kind.as_str(), "Deleting PostgresqlServer");

    let deleted = delete_at_provider(&selection, &server).await;

    let holder = CredentialManager::holder_name(HolderRole::Server, &request.namespace, &request.name);
    ctx.credentials
        .discard(&request.namespace, &request.spec.credentials_secret, &holder)
        .await?;

    deleted
}

async fn delete_at_provider(selection: &Selection, server: &ServerRef) -> Result<()> {
    if selection.backend.server_exists(server).await? {
        selection.backend.delete_server(server).await
    } else {
        info!(server = %server, "Server already gone at the provider");
        Ok(())
    }
}

/// Pinned backend wins over the spec; fallbacks are reported as events
async fn select_backend(ctx: &ReconcileContext, request: &ReconcileRequest<PostgresqlServerSpec>) -> Result<Selection> {
    let requested = request.pinned_backend().or(request.spec.backend.as_deref());
    let selection = ctx.registry.select(requested)?;
    if let Some(message) = &selection.warning {
        warn!(name = %request.name, "{}", message);
        ctx.resources
            .publish(
                &request.resource(ResourceKind::Server),
                &Advisory::warning("BackendFallback", message),
            )
            .await;
    }
    Ok(selection)
}
