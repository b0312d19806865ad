//! Pure diff computation between the local subscriber set and a remote
//! snapshot. Nothing here performs I/O or holds state across runs.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::model::{
    address_key, FieldDef, RemoteField, RemoteMember, RemoteSegment, SegmentUpdate, Subscriber,
};

/// Remote state fetched once at the start of a run.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub members: Vec<RemoteMember>,
    pub segments: Vec<RemoteSegment>,
    pub fields: Vec<RemoteField>,
}

impl RemoteSnapshot {
    /// Snapshot with freshly created segments appended.
    pub fn with_segments(mut self, created: Vec<RemoteSegment>) -> Self {
        self.segments.extend(created);
        self
    }
}

/// Mutations required to converge the remote list, except per-segment
/// membership which depends on segments created during the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub local_tags: BTreeMap<String, Vec<String>>,
    pub missing_fields: Vec<FieldDef>,
    pub missing_segments: Vec<String>,
    pub to_subscribe: Vec<Subscriber>,
    pub to_delete: Vec<String>,
    pub changed_members: Vec<Subscriber>,
    pub obsolete_segments: Vec<u64>,
}

impl Diff {
    pub fn compute(local: &[Subscriber], remote: &RemoteSnapshot, fields: &[FieldDef]) -> Self {
        let tags = local_tags(local);
        let unique = unique_addresses(local);
        Self {
            missing_fields: missing_fields(fields, &remote.fields),
            missing_segments: missing_segments(&tags, &remote.segments),
            to_subscribe: missing_subscribers(&unique, &remote.members),
            to_delete: obsolete_emails(&unique, &remote.members),
            changed_members: changed_members(&unique, &remote.members, fields),
            obsolete_segments: obsolete_segments(&tags, &remote.segments),
            local_tags: tags,
        }
    }

    /// True when no mutation is required.
    pub fn is_noop(&self) -> bool {
        self.missing_fields.is_empty()
            && self.missing_segments.is_empty()
            && self.to_subscribe.is_empty()
            && self.to_delete.is_empty()
            && self.changed_members.is_empty()
            && self.obsolete_segments.is_empty()
    }
}

/// One subscriber per normalized address, the lowest id winning. Subscribers
/// without an address are dropped.
pub fn unique_addresses(local: &[Subscriber]) -> Vec<Subscriber> {
    let mut by_key: BTreeMap<String, &Subscriber> = BTreeMap::new();
    for subscriber in local {
        let Some(key) = subscriber.address_key() else {
            continue;
        };
        by_key
            .entry(key)
            .and_modify(|kept| {
                if subscriber.id < kept.id {
                    *kept = subscriber;
                }
            })
            .or_insert(subscriber);
    }
    let mut unique: Vec<Subscriber> = by_key.into_values().cloned().collect();
    unique.sort_by_key(|s| s.id);
    unique
}

/// Local subscribers with an address that the remote does not know yet.
pub fn missing_subscribers(local: &[Subscriber], remote: &[RemoteMember]) -> Vec<Subscriber> {
    let remote: HashSet<String> = remote.iter().map(|m| address_key(&m.email)).collect();
    local
        .iter()
        .filter(|s| matches!(s.address_key(), Some(key) if !remote.contains(&key)))
        .cloned()
        .collect()
}

/// Remote addresses no longer present locally.
pub fn obsolete_emails(local: &[Subscriber], remote: &[RemoteMember]) -> Vec<String> {
    let local: HashSet<String> = local.iter().filter_map(Subscriber::address_key).collect();
    remote
        .iter()
        .filter(|m| !local.contains(&address_key(&m.email)))
        .map(|m| m.email.clone())
        .collect()
}

/// Tag name → sorted normalized addresses of the local subscribers carrying
/// it. Subscribers without an address contribute no tags; subscribers sharing
/// an address contribute the union of their tags.
pub fn local_tags(local: &[Subscriber]) -> BTreeMap<String, Vec<String>> {
    let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for subscriber in local {
        let Some(key) = subscriber.address_key() else {
            continue;
        };
        for tag in &subscriber.tags {
            tags.entry(tag.clone()).or_default().insert(key.clone());
        }
    }
    tags.into_iter()
        .map(|(tag, emails)| (tag, emails.into_iter().collect()))
        .collect()
}

pub fn missing_segments(
    local_tags: &BTreeMap<String, Vec<String>>,
    segments: &[RemoteSegment],
) -> Vec<String> {
    let remote: HashSet<&str> = segments.iter().map(|s| s.name.as_str()).collect();
    local_tags
        .keys()
        .filter(|tag| !remote.contains(tag.as_str()))
        .cloned()
        .collect()
}

pub fn obsolete_segments(
    local_tags: &BTreeMap<String, Vec<String>>,
    segments: &[RemoteSegment],
) -> Vec<u64> {
    segments
        .iter()
        .filter(|s| !local_tags.contains_key(&s.name))
        .map(|s| s.id)
        .collect()
}

/// Full replacement member lists for segments whose membership differs from
/// the local tag assignment.
pub fn segment_changes(
    local_tags: &BTreeMap<String, Vec<String>>,
    segments: &[RemoteSegment],
    members: &[RemoteMember],
) -> Vec<SegmentUpdate> {
    let by_name: HashMap<&str, &RemoteSegment> =
        segments.iter().map(|s| (s.name.as_str(), s)).collect();

    local_tags
        .iter()
        .filter_map(|(tag, emails)| {
            let segment = by_name.get(tag.as_str())?;
            if *emails == tagged_emails(members, tag) {
                return None;
            }
            Some(SegmentUpdate {
                segment_id: segment.id,
                name: segment.name.clone(),
                emails: emails.clone(),
            })
        })
        .collect()
}

fn tagged_emails(members: &[RemoteMember], tag: &str) -> Vec<String> {
    let mut emails: Vec<String> = members
        .iter()
        .filter(|m| m.tags.contains(tag))
        .map(|m| address_key(&m.email))
        .collect();
    emails.sort();
    emails.dedup();
    emails
}

/// Subscribers known remotely whose profile payload would change the stored
/// remote payload. Extra remote fields are ignored.
pub fn changed_members(
    local: &[Subscriber],
    remote: &[RemoteMember],
    fields: &[FieldDef],
) -> Vec<Subscriber> {
    let by_key: HashMap<String, &RemoteMember> =
        remote.iter().map(|m| (address_key(&m.email), m)).collect();

    local
        .iter()
        .filter(|subscriber| {
            let Some(member) = subscriber.address_key().and_then(|k| by_key.get(&k)) else {
                return false;
            };
            subscriber
                .merge_fields(fields)
                .iter()
                .any(|(tag, value)| !stored_value_matches(member.merge_fields.get(tag), value))
        })
        .cloned()
        .collect()
}

fn stored_value_matches(stored: Option<&Value>, local: &str) -> bool {
    match stored {
        Some(Value::String(remote)) => remote == local,
        Some(Value::Number(n)) => n.to_string() == local,
        _ => false,
    }
}

pub fn missing_fields(fields: &[FieldDef], remote: &[RemoteField]) -> Vec<FieldDef> {
    let remote: HashSet<&str> = remote.iter().map(|f| f.tag.as_str()).collect();
    fields
        .iter()
        .filter(|f| !remote.contains(f.tag.as_str()))
        .cloned()
        .collect()
}
