//! Intent-level client: turns "subscribe these people" into remote batch jobs
//! and waits for them to finish.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{Result, SyncError};
use crate::model::{FieldDef, RemoteField, RemoteMember, RemoteSegment, SegmentUpdate, Subscriber};
use crate::remote::{collect_pages, MailingApi, Operation};
use crate::result::{BatchCounts, Outcome};

/// Domain intents the synchronizer issues against the remote list.
///
/// Mutating intents return `None` when given nothing to do; no remote call is
/// made in that case.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn fetch_members(&self) -> Result<Vec<RemoteMember>>;

    async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>>;

    async fn fetch_fields(&self) -> Result<Vec<RemoteField>>;

    async fn create_fields(&self, fields: &[FieldDef]) -> Result<Option<Outcome>>;

    /// Creates one segment per name and returns them with their remote ids.
    async fn create_segments(&self, names: &[String]) -> Result<Vec<RemoteSegment>>;

    async fn subscribe(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>>;

    async fn delete(&self, emails: &[String]) -> Result<Option<Outcome>>;

    async fn update_segments(&self, updates: &[SegmentUpdate]) -> Result<Option<Outcome>>;

    async fn update_members(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>>;

    async fn delete_segments(&self, segment_ids: &[u64]) -> Result<Option<Outcome>>;
}

/// Polling policy for batch jobs.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Wait before poll `n` is `interval * n²`.
    pub interval: Duration,
    pub max_attempts: u32,
    /// Hard ceiling per batch job, independent of the attempt count.
    pub timeout: Duration,
    pub page_size: usize,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
            timeout: Duration::from_secs(600),
            page_size: 50,
        }
    }
}

impl From<&crate::config::Config> for PollOptions {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            interval: cfg.sync.poll_interval(),
            max_attempts: cfg.sync.max_poll_attempts,
            timeout: cfg.sync.poll_timeout(),
            page_size: cfg.remote.page_size,
        }
    }
}

pub struct BatchClient<A> {
    api: A,
    fields: Vec<FieldDef>,
    options: PollOptions,
}

impl<A: MailingApi> BatchClient<A> {
    pub fn new(api: A, fields: Vec<FieldDef>, options: PollOptions) -> Self {
        Self {
            api,
            fields,
            options,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    async fn execute_batch(&self, operations: Vec<Operation>) -> Result<Option<Outcome>> {
        if operations.is_empty() {
            return Ok(None);
        }
        let batch_id = self.api.submit_batch(&operations).await?;
        info!(batch_id = %batch_id, operations = operations.len(), "batch submitted");
        let counts = self.wait_for_finish(&batch_id).await?;
        Ok(Some(Outcome::from_counts(counts)))
    }

    /// Polls until the job reports `finished`, bounded by both the attempt
    /// count and the wall-clock ceiling.
    async fn wait_for_finish(&self, batch_id: &str) -> Result<BatchCounts> {
        match tokio::time::timeout(self.options.timeout, self.poll(batch_id)).await {
            Ok(counts) => counts,
            Err(_) => Err(SyncError::PollTimeout {
                batch_id: batch_id.to_string(),
                waited: self.options.timeout,
            }),
        }
    }

    async fn poll(&self, batch_id: &str) -> Result<BatchCounts> {
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(self.options.interval * attempt.saturating_mul(attempt)).await;
            let status = self.api.batch_status(batch_id).await?;
            info!(batch_id = %batch_id, attempt, status = %status.status, "batch status");

            if status.is_finished() {
                let counts = BatchCounts::new(
                    status.total_operations,
                    status.finished_operations,
                    status.errored_operations,
                );
                info!(
                    batch_id = %batch_id,
                    total = counts.total,
                    finished = counts.finished,
                    errored = counts.errored,
                    "batch finished"
                );
                return Ok(counts);
            }
            if attempt >= self.options.max_attempts {
                return Err(SyncError::BatchUnfinished {
                    batch_id: batch_id.to_string(),
                    attempts: attempt + 1,
                    status: status.status,
                });
            }
            attempt += 1;
        }
    }

    fn member_payloads<'a>(
        &'a self,
        subscribers: &'a [Subscriber],
    ) -> impl Iterator<Item = (String, std::collections::BTreeMap<String, String>)> + 'a {
        subscribers.iter().filter_map(move |s| {
            s.address()
                .map(|email| (email.to_string(), s.merge_fields(&self.fields)))
        })
    }
}

#[async_trait]
impl<A: MailingApi> SyncClient for BatchClient<A> {
    #[instrument(skip_all)]
    async fn fetch_members(&self) -> Result<Vec<RemoteMember>> {
        collect_pages(self.options.page_size, |offset, count| async move {
            let page = self.api.fetch_members_page(offset, count).await?;
            Ok::<_, SyncError>((page.members, page.total_items))
        })
        .await
    }

    async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>> {
        self.api.fetch_segments().await
    }

    async fn fetch_fields(&self) -> Result<Vec<RemoteField>> {
        self.api.fetch_fields().await
    }

    async fn create_fields(&self, fields: &[FieldDef]) -> Result<Option<Outcome>> {
        let ops = fields.iter().cloned().map(Operation::CreateField).collect();
        self.execute_batch(ops).await
    }

    async fn create_segments(&self, names: &[String]) -> Result<Vec<RemoteSegment>> {
        let mut created = Vec::with_capacity(names.len());
        for name in names {
            let segment = self.api.create_segment(name).await?;
            info!(id = segment.id, name = %segment.name, "segment created");
            created.push(segment);
        }
        Ok(created)
    }

    async fn subscribe(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>> {
        let ops = self
            .member_payloads(subscribers)
            .map(|(email, merge_fields)| Operation::Subscribe {
                email,
                merge_fields,
            })
            .collect();
        self.execute_batch(ops).await
    }

    async fn delete(&self, emails: &[String]) -> Result<Option<Outcome>> {
        let ops = emails
            .iter()
            .map(|email| Operation::Delete {
                email: email.clone(),
            })
            .collect();
        self.execute_batch(ops).await
    }

    async fn update_segments(&self, updates: &[SegmentUpdate]) -> Result<Option<Outcome>> {
        let ops = updates
            .iter()
            .map(|update| Operation::UpdateSegment {
                segment_id: update.segment_id,
                name: update.name.clone(),
                emails: update.emails.clone(),
            })
            .collect();
        self.execute_batch(ops).await
    }

    async fn update_members(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>> {
        let ops = self
            .member_payloads(subscribers)
            .map(|(email, merge_fields)| Operation::UpdateMember {
                email,
                merge_fields,
            })
            .collect();
        self.execute_batch(ops).await
    }

    async fn delete_segments(&self, segment_ids: &[u64]) -> Result<Option<Outcome>> {
        let ops = segment_ids
            .iter()
            .map(|&segment_id| Operation::DeleteSegment { segment_id })
            .collect();
        self.execute_batch(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, FieldSource};
    use crate::remote::{BatchStatus, MembersPage};
    use crate::result::OutcomeState;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct ScriptedApi {
        statuses: Arc<Mutex<VecDeque<BatchStatus>>>,
        batches: Arc<Mutex<Vec<Vec<Operation>>>>,
        polls: Arc<Mutex<u32>>,
        member_pages: Arc<Mutex<Vec<(usize, usize)>>>,
        total_members: usize,
    }

    impl ScriptedApi {
        fn with_statuses(statuses: Vec<BatchStatus>) -> Self {
            Self {
                statuses: Arc::new(Mutex::new(VecDeque::from(statuses))),
                ..Default::default()
            }
        }
    }

    fn status(status: &str, total: u64, finished: u64, errored: u64) -> BatchStatus {
        BatchStatus {
            id: "b1".into(),
            status: status.into(),
            total_operations: total,
            finished_operations: finished,
            errored_operations: errored,
        }
    }

    #[async_trait]
    impl MailingApi for ScriptedApi {
        async fn fetch_members_page(&self, offset: usize, count: usize) -> Result<MembersPage> {
            self.member_pages.lock().await.push((offset, count));
            let end = (offset + count).min(self.total_members);
            let members = (offset..end)
                .map(|i| RemoteMember {
                    email: format!("m{i}@example.com"),
                    status: "subscribed".into(),
                    ..Default::default()
                })
                .collect();
            Ok(MembersPage {
                members,
                total_items: self.total_members,
            })
        }

        async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>> {
            Ok(vec![])
        }

        async fn fetch_fields(&self) -> Result<Vec<RemoteField>> {
            Ok(vec![])
        }

        async fn create_segment(&self, name: &str) -> Result<RemoteSegment> {
            Ok(RemoteSegment {
                id: name.len() as u64,
                name: name.to_string(),
            })
        }

        async fn submit_batch(&self, operations: &[Operation]) -> Result<String> {
            self.batches.lock().await.push(operations.to_vec());
            Ok("b1".into())
        }

        async fn batch_status(&self, _batch_id: &str) -> Result<BatchStatus> {
            *self.polls.lock().await += 1;
            Ok(self
                .statuses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| status("started", 0, 0, 0)))
        }
    }

    fn fast() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(1),
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            page_size: 2,
        }
    }

    fn fields() -> Vec<FieldDef> {
        vec![FieldDef {
            tag: "FNAME".into(),
            name: "First Name".into(),
            kind: FieldKind::Text,
            source: FieldSource::FirstName,
            choices: vec![],
        }]
    }

    fn subscriber(email: Option<&str>) -> Subscriber {
        Subscriber {
            email: email.map(str::to_string),
            first_name: Some("Ada".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_intents_make_no_remote_calls() {
        let api = ScriptedApi::default();
        let client = BatchClient::new(api.clone(), fields(), fast());

        assert!(client.subscribe(&[]).await.unwrap().is_none());
        assert!(client.delete(&[]).await.unwrap().is_none());
        assert!(client.update_members(&[]).await.unwrap().is_none());
        assert!(client.update_segments(&[]).await.unwrap().is_none());
        assert!(client.delete_segments(&[]).await.unwrap().is_none());
        assert!(client.create_fields(&[]).await.unwrap().is_none());
        assert!(client.create_segments(&[]).await.unwrap().is_empty());

        assert!(api.batches.lock().await.is_empty());
        assert_eq!(*api.polls.lock().await, 0);
    }

    #[tokio::test]
    async fn polls_until_finished_and_reads_final_counters() {
        let api = ScriptedApi::with_statuses(vec![
            status("pending", 2, 0, 0),
            status("started", 2, 1, 0),
            status("finished", 2, 1, 1),
        ]);
        let client = BatchClient::new(api.clone(), fields(), fast());

        let outcome = client
            .delete(&["a@example.com".into(), "b@example.com".into()])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.state(), OutcomeState::Partial);
        assert_eq!(outcome.counts(), BatchCounts::new(2, 1, 1));
        assert_eq!(*api.polls.lock().await, 3);
        let batches = api.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let api = ScriptedApi::default();
        let client = BatchClient::new(api.clone(), fields(), fast());

        let err = client
            .delete(&["a@example.com".into()])
            .await
            .unwrap_err();
        match err {
            SyncError::BatchUnfinished {
                batch_id, attempts, ..
            } => {
                assert_eq!(batch_id, "b1");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*api.polls.lock().await, 4);
    }

    #[tokio::test]
    async fn wall_clock_ceiling_is_fatal() {
        let api = ScriptedApi::default();
        let options = PollOptions {
            interval: Duration::from_millis(50),
            max_attempts: 100,
            timeout: Duration::from_millis(120),
            page_size: 10,
        };
        let client = BatchClient::new(api, fields(), options);

        let err = client
            .delete(&["a@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PollTimeout { .. }));
    }

    #[tokio::test]
    async fn subscribe_skips_subscribers_without_address() {
        let api = ScriptedApi::with_statuses(vec![status("finished", 1, 1, 0)]);
        let client = BatchClient::new(api.clone(), fields(), fast());

        let outcome = client
            .subscribe(&[subscriber(Some("ada@example.com")), subscriber(None)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state(), OutcomeState::Success);

        let batches = api.batches.lock().await;
        match &batches[0][..] {
            [Operation::Subscribe {
                email,
                merge_fields,
            }] => {
                assert_eq!(email, "ada@example.com");
                assert_eq!(merge_fields.get("FNAME").map(String::as_str), Some("Ada"));
            }
            other => panic!("unexpected operations: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetches_all_member_pages() {
        let api = ScriptedApi {
            total_members: 5,
            ..Default::default()
        };
        let client = BatchClient::new(api.clone(), fields(), fast());

        let members = client.fetch_members().await.unwrap();
        assert_eq!(members.len(), 5);
        assert_eq!(
            *api.member_pages.lock().await,
            vec![(0, 2), (2, 2), (4, 2)]
        );
    }
}
