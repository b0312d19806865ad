use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::result::SyncResult;

/// A local person eligible for list membership, with their tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub company_name: Option<String>,
    pub gender: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Subscriber {
    /// The address if present and not blank.
    pub fn address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }

    /// Normalized address used to match this subscriber against remote members.
    pub fn address_key(&self) -> Option<String> {
        self.address().map(address_key)
    }

    pub fn attribute(&self, source: FieldSource) -> Option<&str> {
        match source {
            FieldSource::FirstName => self.first_name.as_deref(),
            FieldSource::LastName => self.last_name.as_deref(),
            FieldSource::Nickname => self.nickname.as_deref(),
            FieldSource::CompanyName => self.company_name.as_deref(),
            FieldSource::Gender => self.gender.as_deref(),
        }
    }

    /// Remote-shaped profile payload: one entry per configured field tag.
    pub fn merge_fields(&self, fields: &[FieldDef]) -> BTreeMap<String, String> {
        fields
            .iter()
            .map(|field| {
                let value = self.attribute(field.source).unwrap_or_default();
                (field.tag.clone(), value.to_string())
            })
            .collect()
    }
}

/// Remote identity of an address: trimmed and lower-cased.
pub fn address_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Which local attribute feeds a remote profile field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    FirstName,
    LastName,
    Nickname,
    CompanyName,
    Gender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Dropdown,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Dropdown => "dropdown",
        }
    }
}

/// Local definition of a remote profile field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub tag: String,
    pub name: String,
    pub kind: FieldKind,
    pub source: FieldSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

/// The remote service's view of one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMember {
    pub email: String,
    pub status: String,
    pub tags: BTreeSet<String>,
    pub merge_fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSegment {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteField {
    pub id: u64,
    pub tag: String,
    pub name: String,
}

/// Complete replacement member list for one remote segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUpdate {
    pub segment_id: u64,
    pub name: String,
    pub emails: Vec<String>,
}

/// Local mailing-list record, including the sync bookkeeping fields.
#[derive(Debug, Clone)]
pub struct MailingList {
    pub id: i64,
    pub name: String,
    pub remote_list_id: Option<String>,
    pub remote_api_key: Option<String>,
    pub syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_result: Option<SyncResult>,
}

impl MailingList {
    /// Remote coordinates, if both are configured.
    pub fn remote(&self) -> Option<(&str, &str)> {
        let list_id = self.remote_list_id.as_deref().filter(|s| !s.trim().is_empty())?;
        let api_key = self.remote_api_key.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((list_id, api_key))
    }
}
