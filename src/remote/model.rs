//! Response bodies of the remote list API.
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{RemoteField, RemoteMember, RemoteSegment};

#[derive(Deserialize, Debug)]
pub struct MembersResp {
    #[serde(default)]
    pub members: Vec<MemberResp>,
    #[serde(default)]
    pub total_items: usize,
}

#[derive(Deserialize, Debug)]
pub struct MemberResp {
    pub email_address: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub merge_fields: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<MemberTagResp>,
}

#[derive(Deserialize, Debug)]
pub struct MemberTagResp {
    pub name: String,
}

impl From<MemberResp> for RemoteMember {
    fn from(resp: MemberResp) -> Self {
        RemoteMember {
            email: resp.email_address,
            status: resp.status,
            tags: resp.tags.into_iter().map(|t| t.name).collect(),
            merge_fields: resp.merge_fields.into_iter().collect(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct SegmentsResp {
    #[serde(default)]
    pub segments: Vec<SegmentResp>,
    #[serde(default)]
    pub total_items: usize,
}

#[derive(Deserialize, Debug)]
pub struct SegmentResp {
    pub id: u64,
    pub name: String,
}

impl From<SegmentResp> for RemoteSegment {
    fn from(resp: SegmentResp) -> Self {
        RemoteSegment {
            id: resp.id,
            name: resp.name,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct MergeFieldsResp {
    #[serde(default)]
    pub merge_fields: Vec<MergeFieldResp>,
    #[serde(default)]
    pub total_items: usize,
}

#[derive(Deserialize, Debug)]
pub struct MergeFieldResp {
    pub merge_id: u64,
    pub tag: String,
    #[serde(default)]
    pub name: String,
}

impl From<MergeFieldResp> for RemoteField {
    fn from(resp: MergeFieldResp) -> Self {
        RemoteField {
            id: resp.merge_id,
            tag: resp.tag,
            name: resp.name,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct CreateBatchResp {
    pub id: String,
}
