use async_trait::async_trait;
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::model::{address_key, FieldDef, RemoteField, RemoteMember, RemoteSegment};
use crate::remote::model::{
    CreateBatchResp, MembersResp, MergeFieldsResp, SegmentResp, SegmentsResp,
};

pub mod model;

static DATACENTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-zA-Z]+-([a-z]+[0-9]+)$").unwrap());

/// Page size for segment and field definition listings.
const DEFINITIONS_PAGE: usize = 1000;

/// One page of remote members.
#[derive(Debug, Clone, Default)]
pub struct MembersPage {
    pub members: Vec<RemoteMember>,
    pub total_items: usize,
}

/// Status of an asynchronous batch job as reported by the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BatchStatus {
    #[serde(default)]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub total_operations: u64,
    #[serde(default)]
    pub finished_operations: u64,
    #[serde(default)]
    pub errored_operations: u64,
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        self.status == "finished"
    }
}

/// A single mutation inside a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Subscribe {
        email: String,
        merge_fields: BTreeMap<String, String>,
    },
    Delete {
        email: String,
    },
    UpdateMember {
        email: String,
        merge_fields: BTreeMap<String, String>,
    },
    UpdateSegment {
        segment_id: u64,
        name: String,
        emails: Vec<String>,
    },
    DeleteSegment {
        segment_id: u64,
    },
    CreateField(FieldDef),
}

impl Operation {
    /// `{method, path, body}` entry of the batch request.
    pub fn to_wire(&self, list_id: &str) -> Value {
        match self {
            Operation::Subscribe {
                email,
                merge_fields,
            } => json!({
                "method": "POST",
                "path": format!("lists/{list_id}/members"),
                "body": json!({
                    "email_address": email,
                    "status": "subscribed",
                    "merge_fields": merge_fields,
                }).to_string(),
            }),
            Operation::Delete { email } => json!({
                "method": "DELETE",
                "path": format!("lists/{list_id}/members/{}", subscriber_hash(email)),
            }),
            Operation::UpdateMember {
                email,
                merge_fields,
            } => json!({
                "method": "PATCH",
                "path": format!("lists/{list_id}/members/{}", subscriber_hash(email)),
                "body": json!({ "merge_fields": merge_fields }).to_string(),
            }),
            Operation::UpdateSegment {
                segment_id,
                name,
                emails,
            } => json!({
                "method": "PATCH",
                "path": format!("lists/{list_id}/segments/{segment_id}"),
                "body": json!({ "name": name, "static_segment": emails }).to_string(),
            }),
            Operation::DeleteSegment { segment_id } => json!({
                "method": "DELETE",
                "path": format!("lists/{list_id}/segments/{segment_id}"),
            }),
            Operation::CreateField(field) => {
                let mut body = json!({
                    "tag": field.tag,
                    "name": field.name,
                    "type": field.kind.as_str(),
                });
                if !field.choices.is_empty() {
                    body["options"] = json!({ "choices": field.choices });
                }
                json!({
                    "method": "POST",
                    "path": format!("lists/{list_id}/merge-fields"),
                    "body": body.to_string(),
                })
            }
        }
    }
}

/// Fetch every item of a paged listing. `fetch(offset, count)` returns one
/// page and the total item count reported by the remote.
pub async fn collect_pages<T, F, Fut>(count: usize, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, usize)>>,
{
    let count = count.max(1);
    let mut items = Vec::new();
    let mut offset = 0;
    loop {
        let (page, total) = fetch(offset, count).await?;
        let received = page.len();
        items.extend(page);
        offset += count;
        debug!(received, total, offset, "fetched page");
        if total <= offset || received == 0 {
            break;
        }
    }
    Ok(items)
}

/// Stable remote identifier of a subscriber: hex MD5 of the lower-cased address.
pub fn subscriber_hash(email: &str) -> String {
    format!("{:x}", Md5::digest(address_key(email).as_bytes()))
}

/// API root for the datacenter encoded in an api key (`<key>-us12`).
pub fn base_url_for_key(api_key: &str) -> Result<Url> {
    let dc = DATACENTER
        .captures(api_key.trim())
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| SyncError::Invalid("api key carries no datacenter suffix".into()))?;
    Url::parse(&format!("https://{}.api.mailchimp.com/3.0/", dc.as_str()))
        .map_err(|err| SyncError::Invalid(format!("invalid api url: {err}")))
}

/// Raw remote protocol for one list. Credentials and transport are the
/// implementation's concern.
#[async_trait]
pub trait MailingApi: Send + Sync {
    async fn fetch_members_page(&self, offset: usize, count: usize) -> Result<MembersPage>;

    async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>>;

    async fn fetch_fields(&self) -> Result<Vec<RemoteField>>;

    async fn create_segment(&self, name: &str) -> Result<RemoteSegment>;

    /// Submit a batch job and return its id.
    async fn submit_batch(&self, operations: &[Operation]) -> Result<String>;

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus>;
}

/// HTTP implementation of [`MailingApi`] against the Mailchimp v3 API.
#[derive(Clone)]
pub struct MailchimpApi {
    http: Client,
    base_url: Url,
    list_id: String,
    api_key: String,
}

impl fmt::Debug for MailchimpApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailchimpApi")
            .field("base_url", &self.base_url)
            .field("list_id", &self.list_id)
            .finish_non_exhaustive()
    }
}

impl MailchimpApi {
    pub fn new(list_id: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url_for_key(&api_key)?;
        Self::with_base_url(list_id, api_key, base_url)
    }

    pub fn with_base_url(
        list_id: impl Into<String>,
        api_key: impl Into<String>,
        mut base_url: Url,
    ) -> Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder().user_agent("mailsync/0.1").build()?;
        Ok(Self {
            http,
            base_url,
            list_id: list_id.into(),
            api_key: api_key.into(),
        })
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| SyncError::Invalid(format!("invalid path {path}: {err}")))?;
        Ok(self
            .http
            .request(method, url)
            .basic_auth("mailsync", Some(&self.api_key)))
    }

    pub fn build_request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Request> {
        let mut builder = self.request(method, path)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let res = builder.send().await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by remote: {}", body);
            return Err(SyncError::RateLimited(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "remote error: {}", body);
            return Err(SyncError::api(status.as_u16(), body));
        }
        let text = res.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn list_path(&self, rest: &str) -> String {
        format!("lists/{}/{}", self.list_id, rest)
    }
}

#[async_trait]
impl MailingApi for MailchimpApi {
    async fn fetch_members_page(&self, offset: usize, count: usize) -> Result<MembersPage> {
        let req = self
            .request(Method::GET, &self.list_path("members"))?
            .query(&[("count", count), ("offset", offset)]);
        let body: MembersResp = self.send(req).await?;
        Ok(MembersPage {
            members: body.members.into_iter().map(RemoteMember::from).collect(),
            total_items: body.total_items,
        })
    }

    async fn fetch_segments(&self) -> Result<Vec<RemoteSegment>> {
        collect_pages(DEFINITIONS_PAGE, |offset, count| async move {
            let req = self
                .request(Method::GET, &self.list_path("segments"))?
                .query(&[("type", "static")])
                .query(&[("count", count), ("offset", offset)]);
            let body: SegmentsResp = self.send(req).await?;
            let segments = body.segments.into_iter().map(RemoteSegment::from).collect();
            Ok::<_, SyncError>((segments, body.total_items))
        })
        .await
    }

    async fn fetch_fields(&self) -> Result<Vec<RemoteField>> {
        collect_pages(DEFINITIONS_PAGE, |offset, count| async move {
            let req = self
                .request(Method::GET, &self.list_path("merge-fields"))?
                .query(&[("count", count), ("offset", offset)]);
            let body: MergeFieldsResp = self.send(req).await?;
            let fields = body.merge_fields.into_iter().map(RemoteField::from).collect();
            Ok::<_, SyncError>((fields, body.total_items))
        })
        .await
    }

    async fn create_segment(&self, name: &str) -> Result<RemoteSegment> {
        let req = self
            .request(Method::POST, &self.list_path("segments"))?
            .json(&json!({ "name": name, "static_segment": [] }));
        let body: SegmentResp = self.send(req).await?;
        Ok(body.into())
    }

    async fn submit_batch(&self, operations: &[Operation]) -> Result<String> {
        let wire: Vec<Value> = operations
            .iter()
            .map(|op| op.to_wire(&self.list_id))
            .collect();
        for op in &wire {
            debug!(list_id = %self.list_id, method = %op["method"], path = %op["path"], "batch operation");
        }
        let req = self
            .request(Method::POST, "batches")?
            .json(&json!({ "operations": wire }));
        let body: CreateBatchResp = self.send(req).await?;
        Ok(body.id)
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let req = self.request(Method::GET, &format!("batches/{batch_id}"))?;
        self.send(req).await
    }
}
