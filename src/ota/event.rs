use serde::{Deserialize, Serialize};

use super::request::{OtaRejection, TransferPlan};
use crate::codec::SCHEMA_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaStatus {
    Started,
    Progress,
    Verified,
    Error,
}

/// Lifecycle event published on `event/ota`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaEvent {
    pub schema: String,
    pub status: OtaStatus,
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl OtaEvent {
    fn new(status: OtaStatus) -> Self {
        Self {
            schema: SCHEMA_VERSION.to_string(),
            status,
            req_id: None,
            size: None,
            progress: None,
            crc: None,
            reason: None,
            detail: None,
            url: None,
            msg: None,
        }
    }

    fn for_plan(status: OtaStatus, plan: &TransferPlan, progress: u8) -> Self {
        Self {
            req_id: Some(plan.req_id.clone()),
            size: Some(plan.size).filter(|size| *size > 0),
            progress: Some(progress),
            url: plan.url.clone(),
            ..Self::new(status)
        }
    }

    pub fn started(plan: &TransferPlan) -> Self {
        Self {
            msg: Some("OTA command accepted".to_string()),
            ..Self::for_plan(OtaStatus::Started, plan, 0)
        }
    }

    pub fn progress(plan: &TransferPlan, mark: u8) -> Self {
        Self::for_plan(OtaStatus::Progress, plan, mark)
    }

    pub fn verified(plan: &TransferPlan, crc: &str) -> Self {
        Self {
            crc: Some(crc.to_string()),
            msg: Some("CRC verified".to_string()),
            ..Self::for_plan(OtaStatus::Verified, plan, 100)
        }
    }

    pub fn rejected(rejection: &OtaRejection) -> Self {
        Self {
            req_id: rejection.req_id.clone(),
            reason: Some(rejection.reason.clone()),
            detail: Some(rejection.detail.clone()).filter(|d| !d.is_empty()),
            ..Self::new(OtaStatus::Error)
        }
    }

    pub fn aborted(plan: &TransferPlan, detail: &str) -> Self {
        Self {
            req_id: Some(plan.req_id.clone()),
            size: Some(plan.size),
            reason: Some("aborted".to_string()),
            detail: Some(detail.to_string()),
            url: plan.url.clone(),
            ..Self::new(OtaStatus::Error)
        }
    }
}
