//! One reconciliation run for one mailing list.
//!
//! Steps run strictly in order; each intent's batch is awaited before the
//! next starts. The first failing step stops the run, and the error is
//! recorded in the result. Whatever happens, the list record ends with the
//! in-progress flag cleared and the result persisted.

use chrono::Utc;
use std::future::Future;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{BatchClient, PollOptions, SyncClient};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::diff::{self, Diff, RemoteSnapshot};
use crate::error::{Result, SyncError};
use crate::model::FieldDef;
use crate::remote::{MailchimpApi, MailingApi};
use crate::result::{BatchCounts, IntentKind, Outcome, SyncResult};

/// A run stopped by an error, with everything recorded up to that point.
#[derive(Debug)]
struct Aborted {
    result: SyncResult,
    error: SyncError,
}

pub struct Synchronizer<'a> {
    pool: &'a Pool,
    client: &'a dyn SyncClient,
    fields: &'a [FieldDef],
    raise_errors: bool,
}

impl<'a> Synchronizer<'a> {
    pub fn new(pool: &'a Pool, client: &'a dyn SyncClient, fields: &'a [FieldDef]) -> Self {
        Self {
            pool,
            client,
            fields,
            raise_errors: false,
        }
    }

    /// Return the captured error to the caller after finalizing, instead of
    /// only recording it.
    pub fn raise_errors(mut self, raise: bool) -> Self {
        self.raise_errors = raise;
        self
    }

    /// Reconcile one list. Refuses to start while another run holds the
    /// list's in-progress flag.
    pub async fn run(&self, list_id: i64) -> Result<SyncResult> {
        let run_id = Uuid::new_v4();
        self.run_guarded(list_id)
            .instrument(info_span!("sync", list_id, %run_id))
            .await
    }

    async fn run_guarded(&self, list_id: i64) -> Result<SyncResult> {
        db::begin_sync(self.pool, list_id).await?;
        let guard = SyncingGuard {
            pool: self.pool.clone(),
            list_id,
            armed: true,
        };

        let (result, failure) = match self.reconcile(list_id).await {
            Ok(result) => (result, None),
            Err(Aborted { result, error }) => (result.with_exception(&error), Some(error)),
        };
        let synced_at = failure.is_none().then(Utc::now);
        db::finish_sync(self.pool, list_id, &result, synced_at).await?;
        guard.disarm();

        info!(status = %result.status(), "sync finished");
        match failure {
            Some(error) if self.raise_errors => Err(error),
            Some(error) => {
                warn!(%error, "sync aborted");
                Ok(result)
            }
            None => Ok(result),
        }
    }

    async fn reconcile(&self, list_id: i64) -> std::result::Result<SyncResult, Aborted> {
        let result = SyncResult::new();

        let local = match db::list_subscribers(self.pool, list_id).await {
            Ok(local) => local,
            Err(error) => return Err(Aborted { result, error }),
        };
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => return Err(Aborted { result, error }),
        };
        let diff = Diff::compute(&local, &snapshot, self.fields);
        info!(
            local = local.len(),
            remote = snapshot.members.len(),
            subscribe = diff.to_subscribe.len(),
            delete = diff.to_delete.len(),
            changed = diff.changed_members.len(),
            "computed diff"
        );

        let result = step(
            result,
            IntentKind::MergeFields,
            self.client.create_fields(&diff.missing_fields),
        )
        .await?;

        let created = match self.client.create_segments(&diff.missing_segments).await {
            Ok(created) => created,
            Err(error) => return Err(Aborted { result, error }),
        };
        let created_outcome = (!created.is_empty())
            .then(|| Outcome::from_counts(BatchCounts::complete(created.len() as u64)));
        let result = result.record(IntentKind::Segments, created_outcome);
        let snapshot = snapshot.with_segments(created);

        let result = step(
            result,
            IntentKind::Subscribed,
            self.client.subscribe(&diff.to_subscribe),
        )
        .await?;
        let result = step(
            result,
            IntentKind::Deleted,
            self.client.delete(&diff.to_delete),
        )
        .await?;

        let segment_updates =
            diff::segment_changes(&diff.local_tags, &snapshot.segments, &snapshot.members);
        let result = step(
            result,
            IntentKind::Tags,
            self.client.update_segments(&segment_updates),
        )
        .await?;

        let result = step(
            result,
            IntentKind::Updates,
            self.client.update_members(&diff.changed_members),
        )
        .await?;

        step(
            result,
            IntentKind::DeletedSegments,
            self.client.delete_segments(&diff.obsolete_segments),
        )
        .await
    }

    /// Remote state, fetched once per run.
    async fn snapshot(&self) -> Result<RemoteSnapshot> {
        let fields = self.client.fetch_fields().await?;
        let segments = self.client.fetch_segments().await?;
        let members = self.client.fetch_members().await?;
        Ok(RemoteSnapshot {
            members,
            segments,
            fields,
        })
    }
}

async fn step<F>(
    result: SyncResult,
    kind: IntentKind,
    intent: F,
) -> std::result::Result<SyncResult, Aborted>
where
    F: Future<Output = Result<Option<Outcome>>>,
{
    match intent.await {
        Ok(outcome) => {
            if let Some(outcome) = &outcome {
                info!(intent = %kind, state = ?outcome.state(), "intent executed");
            }
            Ok(result.record(kind, outcome))
        }
        Err(error) => {
            error!(intent = %kind, %error, "intent failed");
            Err(Aborted { result, error })
        }
    }
}

/// Clears the in-progress flag if a run is dropped before it finalized.
struct SyncingGuard {
    pool: Pool,
    list_id: i64,
    armed: bool,
}

impl SyncingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = self.pool.clone();
        let list_id = self.list_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = db::clear_syncing(&pool, list_id).await {
                        error!(list_id, %err, "failed to clear sync flag");
                    }
                });
            }
            Err(_) => error!(list_id, "sync dropped outside a runtime; flag left set"),
        }
    }
}

/// Remote client for a list, from its stored credentials.
pub fn client_for(
    cfg: &Config,
    remote_list_id: &str,
    api_key: &str,
) -> Result<BatchClient<MailchimpApi>> {
    let api = match &cfg.remote.base_url {
        Some(url) => {
            let url = reqwest::Url::parse(url)
                .map_err(|err| SyncError::Invalid(format!("remote.base_url: {err}")))?;
            MailchimpApi::with_base_url(remote_list_id, api_key, url)?
        }
        None => MailchimpApi::new(remote_list_id, api_key)?,
    };
    Ok(BatchClient::new(api, cfg.fields.clone(), PollOptions::from(cfg)))
}

/// Load a list, build its remote client and run one reconciliation.
pub async fn synchronize_list(pool: &Pool, cfg: &Config, list_id: i64) -> Result<SyncResult> {
    let list = db::fetch_mailing_list(pool, list_id).await?;
    let (remote_list_id, api_key) = list.remote().ok_or(SyncError::NotConfigured(list_id))?;
    let client = client_for(cfg, remote_list_id, api_key)?;
    run_with(pool, cfg, &client, list_id).await
}

pub async fn run_with<A: MailingApi>(
    pool: &Pool,
    cfg: &Config,
    client: &BatchClient<A>,
    list_id: i64,
) -> Result<SyncResult> {
    Synchronizer::new(pool, client, &cfg.fields)
        .raise_errors(cfg.sync.raise_errors)
        .run(list_id)
        .await
}
