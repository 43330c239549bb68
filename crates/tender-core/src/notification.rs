//! Typed notification produced by a [`NotificationParser`](crate::NotificationParser).
//!
//! The shape follows the registry export: a root wrapper holding at most one
//! notification, a common block with the identifying fields, the attachment
//! list, and the procedure/requirements section. Every field is optional
//! because registry payloads routinely omit blocks; the ingestor decides what
//! is mandatory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Root of a parsed export document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    #[serde(default, alias = "epNotificationEF2020")]
    pub notification: Option<Notification>,
}

/// One purchase notification (a single version of it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub version_number: Option<i32>,
    #[serde(default)]
    pub scheme_version: Option<String>,
    #[serde(default)]
    pub common_info: Option<CommonInfo>,
    #[serde(default, alias = "attachmentsInfo")]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(default)]
    pub notification_info: Option<NotificationInfo>,
}

/// Identifying and descriptive fields shared by every notification type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonInfo {
    #[serde(default)]
    pub purchase_number: Option<String>,
    #[serde(default)]
    pub doc_number: Option<String>,
    #[serde(default)]
    pub publish_dt_in_eis: Option<DateTime<Utc>>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub placing_way: Option<CodeName>,
    #[serde(default)]
    pub etp: Option<Etp>,
    #[serde(default)]
    pub contract_conclusion_on_st83_ch2: Option<bool>,
    #[serde(default)]
    pub purchase_object_info: Option<String>,
}

/// A `{code, name}` pair used by registry dictionaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeName {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CodeName {
    /// The trimmed code, if present and non-empty.
    pub fn non_empty_code(&self) -> Option<&str> {
        self.code.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// Electronic trading platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Etp {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One published attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    #[serde(default)]
    pub published_content_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub doc_description: Option<String>,
    #[serde(default)]
    pub doc_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "docKindInfo")]
    pub doc_kind: Option<CodeName>,
    #[serde(default)]
    pub crypto_signs: Vec<SignatureInfo>,
}

/// Cryptographic signature attached to an attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureInfo {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Procedure, price and requirements section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationInfo {
    #[serde(default)]
    pub procedure_info: Option<ProcedureInfo>,
    #[serde(default, alias = "maxPriceInfo")]
    pub max_price: Option<MaxPrice>,
    #[serde(default, alias = "customerRequirementsInfo")]
    pub customer_requirements: Vec<CustomerRequirement>,
    #[serde(default, alias = "purchaseObjectsInfo")]
    pub purchase_objects: Vec<PurchaseObject>,
}

/// Bid collection window and procedure dates.
///
/// Bidding and summarizing dates are kept raw: the registry mixes date and
/// date-time formats for them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureInfo {
    #[serde(default)]
    pub collecting_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collecting_end: Option<DateTime<Utc>>,
    #[serde(default, alias = "biddingDateRaw")]
    pub bidding_date: Option<String>,
    #[serde(default, alias = "summarizingDateRaw")]
    pub summarizing_date: Option<String>,
}

/// Initial (maximum) contract price.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxPrice {
    #[serde(default, alias = "maxPrice")]
    pub amount: Option<f64>,
    #[serde(default, alias = "currency")]
    pub currency_code: Option<String>,
}

/// Customer requirement with nested classification candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRequirement {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub okpd2: Vec<CodeName>,
    #[serde(default)]
    pub kvr: Vec<CodeName>,
}

/// Purchase object line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseObject {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub okpd2: Option<CodeName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_notification() {
        let json = r#"{
            "notification": {
                "externalId": "ext-1",
                "versionNumber": 2,
                "commonInfo": { "purchaseNumber": "0373100000124000001" }
            }
        }"#;
        let doc: ExportDocument = serde_json::from_str(json).unwrap();
        let n = doc.notification.unwrap();
        assert_eq!(n.external_id.as_deref(), Some("ext-1"));
        assert_eq!(n.version_number, Some(2));
        assert!(n.attachments.is_empty());
        assert_eq!(
            n.common_info.unwrap().purchase_number.as_deref(),
            Some("0373100000124000001")
        );
    }

    #[test]
    fn test_registry_root_alias() {
        let json = r#"{ "epNotificationEF2020": { "id": "42" } }"#;
        let doc: ExportDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.notification.unwrap().id.as_deref(), Some("42"));
    }

    #[test]
    fn test_missing_root_is_none() {
        let doc: ExportDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.notification.is_none());
    }

    #[test]
    fn test_signature_type_field() {
        let json = r#"{ "type": "CAdES-BES", "value": "MIIB" }"#;
        let sig: SignatureInfo = serde_json::from_str(json).unwrap();
        assert_eq!(sig.kind.as_deref(), Some("CAdES-BES"));
        assert_eq!(sig.value.as_deref(), Some("MIIB"));
    }

    #[test]
    fn test_code_name_blank_code_is_empty() {
        let blank = CodeName {
            code: Some("  ".into()),
            name: None,
        };
        assert_eq!(blank.non_empty_code(), None);
        let set = CodeName {
            code: Some(" 41.20 ".into()),
            name: None,
        };
        assert_eq!(set.non_empty_code(), Some("41.20"));
    }
}
