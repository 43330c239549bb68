//! JSON notification parser for payloads already converted from registry XML.

use tender_core::{Error, ExportDocument, NotificationParser, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonNotificationParser;

impl JsonNotificationParser {
    pub fn new() -> Self {
        Self
    }
}

impl NotificationParser for JsonNotificationParser {
    fn parse(&self, content: &[u8]) -> Result<ExportDocument> {
        let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
        serde_json::from_slice(content).map_err(|e| Error::Parse(e.to_string()))
    }

    fn file_extension(&self) -> &str {
        "json"
    }
}
