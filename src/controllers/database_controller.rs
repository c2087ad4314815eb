//! PostgresqlDatabase controller
//!
//! Watches PostgresqlDatabase resources and triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::{
    error_policy, is_finished, object_key, persist_handled, persisted_snapshot, request_for, snapshot, Context,
    Observed, Plan,
};
use crate::crd::PostgresqlDatabase;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::reconcilers::{database as database_reconciler, Outcome};

/// Finalizer name for PostgresqlDatabase resources
const FINALIZER_NAME: &str = "postgres.oso.sh/database-finalizer";

/// Run the PostgresqlDatabase controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PostgresqlDatabase> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("PostgresqlDatabase CRD not installed: {}", e);
        return;
    }

    info!("Starting PostgresqlDatabase controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy::<PostgresqlDatabase>, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled PostgresqlDatabase"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<PostgresqlDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[PostgresqlDatabase::KIND.as_str()])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&[PostgresqlDatabase::KIND.as_str()])
        .inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<PostgresqlDatabase> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(database) => apply(database, ctx.clone()).await,
            FinalizerEvent::Cleanup(database) => cleanup(database, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Apply reconciliation (create/update)
async fn apply(database: Arc<PostgresqlDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(database.as_ref());
    let state = snapshot(database.as_ref())?;

    let persisted = persisted_snapshot(database.as_ref());
    let plan = ctx.tracker.plan(
        &key,
        &state,
        persisted.as_ref(),
        is_finished(database.as_ref()),
        ctx.reconcile.settings.handler_on_resume,
    );

    match plan {
        Plan::Wait(delay) => Ok(Action::requeue(delay)),
        Plan::Skip => {
            debug!(name = %key.2, "No relevant changes");
            metrics::SKIPPED_RECONCILIATIONS
                .with_label_values(&[PostgresqlDatabase::KIND.as_str()])
                .inc();
            persist_handled(ctx.reconcile.resources.as_ref(), database.as_ref(), &state).await;
            ctx.tracker.record_handled(&key, state);
            Ok(Action::await_change())
        }
        Plan::Run { diff, retry } => {
            let request = request_for(database.as_ref(), diff, retry);
            match database_reconciler::apply(&ctx.reconcile, request).await {
                Ok(Outcome::Unchanged) => {
                    metrics::SKIPPED_RECONCILIATIONS
                        .with_label_values(&[PostgresqlDatabase::KIND.as_str()])
                        .inc();
                }
                Ok(Outcome::Finished) => {}
                Err(e) => {
                    // Permanent failures count as handled until the next change
                    if e.kind() == ErrorKind::Permanent {
                        persist_handled(ctx.reconcile.resources.as_ref(), database.as_ref(), &state).await;
                    }
                    return Err(e);
                }
            }
            persist_handled(ctx.reconcile.resources.as_ref(), database.as_ref(), &state).await;
            ctx.tracker.record_handled(&key, state);
            Ok(Action::await_change())
        }
    }
}

/// Cleanup when resource is being deleted
async fn cleanup(database: Arc<PostgresqlDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(database.as_ref());
    let state = snapshot(database.as_ref())?;
    if let Some(delay) = ctx.tracker.pending_wait(&key, &state) {
        return Ok(Action::requeue(delay));
    }

    info!(name = %key.2, "Cleaning up PostgresqlDatabase");

    let request = request_for(database.as_ref(), Vec::new(), ctx.tracker.attempts(&key));
    database_reconciler::cleanup(&ctx.reconcile, request).await?;

    ctx.tracker.forget(&key);
    metrics::CLEANUPS
        .with_label_values(&[PostgresqlDatabase::KIND.as_str()])
        .inc();

    Ok(Action::await_change())
}
