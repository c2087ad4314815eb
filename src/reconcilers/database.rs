//! PostgresqlDatabase reconciler

use tracing::{debug, info, warn};

use super::diff::only_action_label_removed;
use super::{
    canonical_identifier, dependency_backoff, update_status, ActionSlot, Command, Outcome, ReconcileContext,
    ReconcileRequest,
};
use crate::adapters::{Advisory, ResourceKind};
use crate::backends::{Selection, ServerRef};
use crate::credentials::{CredentialBundle, CredentialManager, HolderRole};
use crate::crd::{DeploymentPhase, PostgresqlDatabaseSpec, PostgresqlServer};
use crate::error::{Error, Result};
use crate::metrics;

/// A server that is ready to host databases
struct ReadyServer {
    server: ServerRef,
    selection: Selection,
    admin: CredentialBundle,
}

/// Create or update a database and its owner
pub async fn apply(ctx: &ReconcileContext, request: ReconcileRequest<PostgresqlDatabaseSpec>) -> Result<Outcome> {
    if only_action_label_removed(&request.diff) {
        debug!(name = %request.name, "Only the action label was removed, nothing to do");
        return Ok(Outcome::Unchanged);
    }

    let resource = request.resource(ResourceKind::Database);
    let identifier = canonical_identifier(&request.name);

    info!(
        name = %request.name,
        namespace = %request.namespace,
        server = %request.spec.server_ref.name,
        "Reconciling PostgresqlDatabase"
    );

    let ready = wait_for_server(ctx, &request).await?;
    let backend = ready.selection.backend.as_ref();
    let backend_name = ready.selection.kind.as_str();

    let secret_name = request.spec.credentials_secret.as_str();
    let holder = CredentialManager::holder_name(HolderRole::Database, &request.namespace, &request.name);
    let mut resolved = ctx
        .credentials
        .resolve(&request.namespace, secret_name, &holder)
        .await?;

    update_status(
        ctx.resources.as_ref(),
        &resource,
        request.status.as_ref(),
        DeploymentPhase::Working,
        None,
        Some(backend_name),
    )
    .await?;

    let options = request.spec.database.clone().unwrap_or_default();
    backend
        .create_or_update_database(&ready.server, &ready.admin, &identifier, &options)
        .await?;
    let user = backend
        .create_or_update_user(&ready.server, &ready.admin, &identifier, &identifier, &resolved.password)
        .await?;

    let slot = ActionSlot::from_labels(&request.labels);
    let mut confirmation = None;
    let mut password_applied = user.newly_created;
    if slot.command() == Some(Command::ResetPassword) {
        if resolved.is_committed() {
            resolved = ctx
                .credentials
                .reset(&request.namespace, secret_name, &holder)
                .await?;
        }
        backend
            .update_user_password(&ready.server, &ready.admin, &identifier, &resolved.password)
            .await?;
        password_applied = true;
        metrics::PASSWORD_RESETS
            .with_label_values(&[ResourceKind::Database.as_str()])
            .inc();
        confirmation = Some("Password for user reset");
    }
    slot.acknowledge(ctx.resources.as_ref(), &resource, confirmation)
        .await?;

    // An existing role whose password was never committed cannot be trusted
    if !password_applied && !resolved.is_committed() {
        info!(user = %identifier, "Recovering password for existing user");
        backend
            .update_user_password(&ready.server, &ready.admin, &identifier, &resolved.password)
            .await?;
    }

    let credentials = CredentialBundle {
        password: resolved.password.clone(),
        ..user.credentials
    };
    ctx.credentials
        .commit(
            &request.namespace,
            secret_name,
            &holder,
            &credentials,
            !resolved.is_committed() || user.newly_created,
        )
        .await?;

    update_status(
        ctx.resources.as_ref(),
        &resource,
        request.status.as_ref(),
        DeploymentPhase::Finished,
        Some("Database created".to_string()),
        Some(backend_name),
    )
    .await?;

    info!(name = %request.name, database = %identifier, "PostgresqlDatabase ready");
    Ok(Outcome::Finished)
}

/// Drop the database and its owner, then the credentials
pub async fn cleanup(ctx: &ReconcileContext, request: ReconcileRequest<PostgresqlDatabaseSpec>) -> Result<()> {
    info!(name = %request.name, namespace = %request.namespace, "Deleting PostgresqlDatabase");

    let dropped = drop_database(ctx, &request).await;

    let holder = CredentialManager::holder_name(HolderRole::Database, &request.namespace, &request.name);
    ctx.credentials
        .discard(&request.namespace, &request.spec.credentials_secret, &holder)
        .await?;

    dropped
}

/// Remove the database and role when the server is still there to hold them
async fn drop_database(ctx: &ReconcileContext, request: &ReconcileRequest<PostgresqlDatabaseSpec>) -> Result<()> {
    let resource = request.resource(ResourceKind::Database);
    let identifier = canonical_identifier(&request.name);
    let server_namespace = request.spec.server_namespace(&request.namespace);
    let server_name = request.spec.server_ref.name.as_str();

    let Some(server_obj) = ctx.resources.get_server(server_namespace, server_name).await? else {
        let message = format!(
            "Server {}/{} no longer exists, skipping database cleanup",
            server_namespace, server_name
        );
        warn!(name = %request.name, "{}", message);
        ctx.resources
            .publish(&resource, &Advisory::warning("ServerMissing", message))
            .await;
        return Ok(());
    };

    let server = ServerRef::new(server_namespace, server_name);
    let selection = ctx.registry.select(server_backend(&server_obj))?;
    let backend = selection.backend.as_ref();
    if !backend.server_exists(&server).await? {
        info!(server = %server, "Server already gone at the provider");
        return Ok(());
    }

    let Some(admin) = admin_credentials(ctx, server_namespace, &server_obj).await? else {
        warn!(server = %server, "Admin credentials missing, skipping database cleanup");
        return Ok(());
    };

    if backend.database_exists(&server, &admin, &identifier).await? {
        backend.delete_database(&server, &admin, &identifier).await?;
        backend.delete_user(&server, &admin, &identifier).await?;
    } else {
        debug!(database = %identifier, "Database already gone");
    }
    Ok(())
}

/// Block until the referenced server exists, is live at the provider and
/// has committed admin credentials
async fn wait_for_server(
    ctx: &ReconcileContext,
    request: &ReconcileRequest<PostgresqlDatabaseSpec>,
) -> Result<ReadyServer> {
    let namespace = request.spec.server_namespace(&request.namespace);
    let name = request.spec.server_ref.name.as_str();
    let delay = dependency_backoff(request.retry);

    let Some(server_obj) = ctx.resources.get_server(namespace, name).await? else {
        return Err(Error::temporary(
            format!("Server {}/{} does not exist yet", namespace, name),
            delay,
        ));
    };

    let server = ServerRef::new(namespace, name);
    let selection = ctx.registry.select(server_backend(&server_obj))?;
    if !selection.backend.server_exists(&server).await? {
        return Err(Error::temporary(format!("Server {} is not provisioned yet", server), delay));
    }

    let Some(admin) = admin_credentials(ctx, namespace, &server_obj).await? else {
        return Err(Error::temporary(
            format!("Admin credentials for server {} are not available yet", server),
            delay,
        ));
    };

    Ok(ReadyServer {
        server,
        selection,
        admin,
    })
}

/// Backend a server was provisioned with
fn server_backend(server: &PostgresqlServer) -> Option<&str> {
    server
        .status
        .as_ref()
        .and_then(|s| s.backend.as_deref())
        .or(server.spec.backend.as_deref())
}

async fn admin_credentials(
    ctx: &ReconcileContext,
    namespace: &str,
    server: &PostgresqlServer,
) -> Result<Option<CredentialBundle>> {
    let secret = server.spec.credentials_secret.as_str();
    ctx.credentials
        .committed(namespace, secret)
        .await?
        .map(|data| CredentialBundle::from_secret_data(secret, &data))
        .transpose()
}
