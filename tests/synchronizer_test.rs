use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mailsync::client::SyncClient;
use mailsync::db::{self, Pool};
use mailsync::error::{Result, SyncError};
use mailsync::model::{
    FieldDef, FieldKind, FieldSource, RemoteField, RemoteMember, RemoteSegment, SegmentUpdate,
    Subscriber,
};
use mailsync::result::{BatchCounts, IntentKind, Outcome, OutcomeState, SyncResult, SyncStatus};
use mailsync::Synchronizer;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn setup_list(pool: &Pool) -> i64 {
    db::create_mailing_list(pool, "Leaders", Some("abc123"), Some("key-us1"))
        .await
        .unwrap()
}

async fn add_subscriber(pool: &Pool, list_id: i64, email: Option<&str>, tags: &[&str]) -> i64 {
    let person = Subscriber {
        email: email.map(str::to_string),
        first_name: Some("Pia".into()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    };
    let id = db::insert_person(pool, &person).await.unwrap();
    db::subscribe_person(pool, list_id, id).await.unwrap();
    id
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

fn remote_fields() -> Vec<RemoteField> {
    vec![RemoteField {
        id: 1,
        tag: "FNAME".into(),
        name: "First Name".into(),
    }]
}

fn member(email: &str) -> RemoteMember {
    RemoteMember {
        email: email.into(),
        status: "subscribed".into(),
        tags: BTreeSet::new(),
        merge_fields: [("FNAME".to_string(), serde_json::json!("Pia"))]
            .into_iter()
            .collect(),
    }
}

/// Recorded intent call: intent name and the addresses/names it was given.
type Call = (&'static str, Vec<String>);

#[derive(Clone, Default)]
struct RecordingClient {
    members: Arc<Mutex<Vec<RemoteMember>>>,
    segments: Arc<Mutex<Vec<RemoteSegment>>>,
    fields: Arc<Mutex<Vec<RemoteField>>>,
    fail_fetch_fields: Arc<Mutex<bool>>,
    fail_on: Arc<Mutex<Option<&'static str>>>,
    counts: Arc<Mutex<HashMap<&'static str, VecDeque<BatchCounts>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    segment_updates: Arc<Mutex<Vec<SegmentUpdate>>>,
    next_segment_id: Arc<Mutex<u64>>,
}

impl RecordingClient {
    fn with_snapshot(members: Vec<RemoteMember>, segments: Vec<RemoteSegment>) -> Self {
        Self {
            members: Arc::new(Mutex::new(members)),
            segments: Arc::new(Mutex::new(segments)),
            fields: Arc::new(Mutex::new(remote_fields())),
            next_segment_id: Arc::new(Mutex::new(100)),
            ..Default::default()
        }
    }

    async fn script(&self, intent: &'static str, counts: BatchCounts) {
        self.counts
            .lock()
            .await
            .entry(intent)
            .or_default()
            .push_back(counts);
    }

    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    async fn call(&self, intent: &str) -> Option<Vec<String>> {
        self.calls
            .lock()
            .await
            .iter()
            .find(|(name, _)| *name == intent)
            .map(|(_, args)| args.clone())
    }

    async fn execute(&self, intent: &'static str, args: Vec<String>) -> Result<Option<Outcome>> {
        let n = args.len() as u64;
        self.calls.lock().await.push((intent, args));
        if *self.fail_on.lock().await == Some(intent) {
            return Err(SyncError::api(500, format!("{intent} exploded")));
        }
        if n == 0 {
            return Ok(None);
        }
        let counts = self
            .counts
            .lock()
            .await
            .get_mut(intent)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| BatchCounts::complete(n));
        Ok(Some(Outcome::from_counts(counts)))
    }
}

#[async_trait]
impl SyncClient for RecordingClient {
    async fn fetch_members(&self) -> Result<Vec<RemoteMember>> {
        Ok(self.members.lock().await.clone())
    }

    async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>> {
        Ok(self.segments.lock().await.clone())
    }

    async fn fetch_fields(&self) -> Result<Vec<RemoteField>> {
        if *self.fail_fetch_fields.lock().await {
            return Err(SyncError::api(401, "API Key Invalid"));
        }
        Ok(self.fields.lock().await.clone())
    }

    async fn create_fields(&self, fields: &[FieldDef]) -> Result<Option<Outcome>> {
        let tags = fields.iter().map(|f| f.tag.clone()).collect();
        self.execute("create_fields", tags).await
    }

    async fn create_segments(&self, names: &[String]) -> Result<Vec<RemoteSegment>> {
        self.calls
            .lock()
            .await
            .push(("create_segments", names.to_vec()));
        let mut next = self.next_segment_id.lock().await;
        Ok(names
            .iter()
            .map(|name| {
                *next += 1;
                RemoteSegment {
                    id: *next,
                    name: name.clone(),
                }
            })
            .collect())
    }

    async fn subscribe(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>> {
        let emails = subscribers
            .iter()
            .filter_map(|s| s.address().map(str::to_string))
            .collect();
        self.execute("subscribe", emails).await
    }

    async fn delete(&self, emails: &[String]) -> Result<Option<Outcome>> {
        self.execute("delete", emails.to_vec()).await
    }

    async fn update_segments(&self, updates: &[SegmentUpdate]) -> Result<Option<Outcome>> {
        self.segment_updates.lock().await.extend(updates.iter().cloned());
        let names = updates.iter().map(|u| u.name.clone()).collect();
        self.execute("update_segments", names).await
    }

    async fn update_members(&self, subscribers: &[Subscriber]) -> Result<Option<Outcome>> {
        let emails = subscribers
            .iter()
            .filter_map(|s| s.address().map(str::to_string))
            .collect();
        self.execute("update_members", emails).await
    }

    async fn delete_segments(&self, segment_ids: &[u64]) -> Result<Option<Outcome>> {
        let ids = segment_ids.iter().map(u64::to_string).collect();
        self.execute("delete_segments", ids).await
    }
}

async fn run(pool: &Pool, client: &RecordingClient, list_id: i64) -> SyncResult {
    let fields = fields();
    Synchronizer::new(pool, client, &fields)
        .run(list_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn subscribes_missing_address() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &[]).await;
    let client = RecordingClient::with_snapshot(vec![], vec![]);

    let result = run(&pool, &client, list_id).await;

    assert_eq!(
        client.call("subscribe").await.unwrap(),
        vec!["new@example.com".to_string()]
    );
    assert!(client.call("delete").await.unwrap().is_empty());
    assert_eq!(result.status(), SyncStatus::Success);
    let outcome = result.outcome(IntentKind::Subscribed).unwrap();
    assert_eq!(outcome.counts(), BatchCounts::new(1, 1, 0));
}

#[tokio::test]
async fn deletes_obsolete_address() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("stay@example.com"), &[]).await;
    let client = RecordingClient::with_snapshot(
        vec![member("stay@example.com"), member("gone@example.com")],
        vec![],
    );

    let result = run(&pool, &client, list_id).await;

    assert_eq!(
        client.call("delete").await.unwrap(),
        vec!["gone@example.com".to_string()]
    );
    assert!(client.call("subscribe").await.unwrap().is_empty());
    assert_eq!(result.status(), SyncStatus::Success);
    assert!(result.outcome(IntentKind::Subscribed).is_none());
}

#[tokio::test]
async fn partial_delete_marks_run_partial() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &[]).await;
    let client = RecordingClient::with_snapshot(
        vec![member("a@example.com"), member("b@example.com")],
        vec![],
    );
    client.script("delete", BatchCounts::new(2, 1, 1)).await;

    let result = run(&pool, &client, list_id).await;

    assert_eq!(
        result.outcome(IntentKind::Deleted).unwrap().state(),
        OutcomeState::Partial
    );
    assert_eq!(
        result.outcome(IntentKind::Subscribed).unwrap().state(),
        OutcomeState::Success
    );
    assert_eq!(result.status(), SyncStatus::Partial);

    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert_eq!(stored.sync_result.unwrap().status(), SyncStatus::Partial);
    assert!(stored.last_synced_at.is_some());
}

#[tokio::test]
async fn fetch_failure_is_captured_and_bookkeeping_done() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &[]).await;

    let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    db::begin_sync(&pool, list_id).await.unwrap();
    db::finish_sync(&pool, list_id, &SyncResult::new(), Some(earlier))
        .await
        .unwrap();

    let client = RecordingClient::with_snapshot(vec![], vec![]);
    *client.fail_fetch_fields.lock().await = true;

    let result = run(&pool, &client, list_id).await;

    assert_eq!(result.status(), SyncStatus::Failed);
    assert!(result.exception().unwrap().contains("API Key Invalid"));
    assert!(client.calls().await.is_empty(), "no mutation attempted");

    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert!(!stored.syncing);
    assert_eq!(stored.last_synced_at, Some(earlier));
    assert_eq!(stored.sync_result.unwrap().status(), SyncStatus::Failed);
}

#[tokio::test]
async fn creates_segments_for_new_tags() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("tagged@example.com"), &["Leiter", "Vorstand"]).await;
    let client = RecordingClient::with_snapshot(vec![], vec![]);

    let result = run(&pool, &client, list_id).await;

    let created: BTreeSet<String> = client
        .call("create_segments")
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(
        created,
        BTreeSet::from(["Leiter".to_string(), "Vorstand".to_string()])
    );

    let updates = client.segment_updates.lock().await.clone();
    assert_eq!(updates.len(), 2);
    for update in &updates {
        assert!(update.segment_id > 100);
        assert_eq!(update.emails, vec!["tagged@example.com".to_string()]);
    }
    assert_eq!(
        result.outcome(IntentKind::Segments).unwrap().counts(),
        BatchCounts::complete(2)
    );
    assert_eq!(result.status(), SyncStatus::Success);
}

#[tokio::test]
async fn steps_run_in_order() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &["Leiter"]).await;
    let client = RecordingClient::with_snapshot(
        vec![member("old@example.com")],
        vec![RemoteSegment {
            id: 7,
            name: "Stale".into(),
        }],
    );
    *client.fields.lock().await = vec![];

    run(&pool, &client, list_id).await;

    let order: Vec<&str> = client.calls().await.into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        order,
        vec![
            "create_fields",
            "create_segments",
            "subscribe",
            "delete",
            "update_segments",
            "update_members",
            "delete_segments",
        ]
    );
    assert_eq!(
        client.call("delete_segments").await.unwrap(),
        vec!["7".to_string()]
    );
}

#[tokio::test]
async fn failing_step_stops_the_run() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &[]).await;
    let client = RecordingClient::with_snapshot(vec![member("old@example.com")], vec![]);
    *client.fail_on.lock().await = Some("delete");

    let result = run(&pool, &client, list_id).await;

    let order: Vec<&str> = client.calls().await.into_iter().map(|(n, _)| n).collect();
    assert_eq!(order.last(), Some(&"delete"));
    assert!(result.outcome(IntentKind::Subscribed).is_some());
    assert!(result.outcome(IntentKind::Deleted).is_none());
    assert_eq!(result.status(), SyncStatus::Failed);

    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert!(!stored.syncing);
    assert!(stored.last_synced_at.is_none());
    assert_eq!(stored.sync_result, Some(result));
}

#[tokio::test]
async fn raise_errors_returns_error_after_finalizing() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    let client = RecordingClient::with_snapshot(vec![], vec![]);
    *client.fail_fetch_fields.lock().await = true;
    let fields = fields();

    let err = Synchronizer::new(&pool, &client, &fields)
        .raise_errors(true)
        .run(list_id)
        .await
        .unwrap_err();
    assert!(err.is_auth());

    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert!(!stored.syncing);
    let result = stored.sync_result.unwrap();
    assert_eq!(result.status(), SyncStatus::Failed);
    assert!(result.exception().is_some());
}

#[tokio::test]
async fn refuses_to_run_while_syncing() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    db::begin_sync(&pool, list_id).await.unwrap();
    let client = RecordingClient::with_snapshot(vec![], vec![]);
    let fields = fields();

    let err = Synchronizer::new(&pool, &client, &fields)
        .run(list_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadySyncing(id) if id == list_id));
    assert!(client.calls().await.is_empty());

    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert!(stored.syncing, "the running sync keeps its flag");
    assert!(stored.sync_result.is_none());
}

#[tokio::test]
async fn unknown_list_is_reported() {
    let pool = setup_pool().await;
    let client = RecordingClient::default();
    let fields = fields();

    let err = Synchronizer::new(&pool, &client, &fields)
        .run(42)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ListNotFound(42)));
}

#[tokio::test]
async fn noop_run_is_unchanged_and_stamps_time() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("stay@example.com"), &[]).await;
    add_subscriber(&pool, list_id, None, &["Leiter"]).await;
    let client = RecordingClient::with_snapshot(vec![member("stay@example.com")], vec![]);

    let result = run(&pool, &client, list_id).await;

    assert_eq!(result.status(), SyncStatus::Unchanged);
    assert!(client.calls().await.iter().all(|(_, args)| args.is_empty()));
    let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
    assert!(!stored.syncing);
    assert!(stored.last_synced_at.is_some());
    assert_eq!(stored.sync_result.unwrap().status(), SyncStatus::Unchanged);
}

#[tokio::test]
async fn flag_is_cleared_for_every_outcome() {
    let pool = setup_pool().await;
    let list_id = setup_list(&pool).await;
    add_subscriber(&pool, list_id, Some("new@example.com"), &["Leiter"]).await;

    let scenarios: Vec<(Option<&'static str>, Option<BatchCounts>)> = vec![
        (None, None),
        (None, Some(BatchCounts::new(1, 0, 1))),
        (Some("update_segments"), None),
    ];
    for (fail_on, subscribe_counts) in scenarios {
        let client = RecordingClient::with_snapshot(vec![], vec![]);
        *client.fail_on.lock().await = fail_on;
        if let Some(counts) = subscribe_counts {
            client.script("subscribe", counts).await;
        }

        run(&pool, &client, list_id).await;

        let stored = db::fetch_mailing_list(&pool, list_id).await.unwrap();
        assert!(!stored.syncing);
        assert!(stored.sync_result.is_some());
    }
}
