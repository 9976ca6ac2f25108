use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emails::NewEmail;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub size_estimate: Option<i64>,
    /// Epoch milliseconds as a string, per the vendor wire format.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

impl GmailMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|payload| {
            payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.internal_date.as_deref()?.parse().ok()?;
        DateTime::from_timestamp_millis(millis)
    }

    fn part_has_attachment(part: &MessagePart) -> bool {
        if part.filename.as_deref().is_some_and(|name| !name.is_empty()) {
            return true;
        }
        part.parts.iter().any(Self::part_has_attachment)
    }

    pub fn has_attachments(&self) -> bool {
        self.payload
            .as_ref()
            .is_some_and(Self::part_has_attachment)
    }

    /// Project the vendor shape onto the index row the rest of the system
    /// works with.
    pub fn to_new_email(&self) -> NewEmail {
        let recipients = self
            .header("To")
            .map(|to| {
                to.split(',')
                    .map(|addr| addr.trim().to_string())
                    .filter(|addr| !addr.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        NewEmail {
            id: self.id.clone(),
            thread_id: self.thread_id.clone(),
            sender: self.header("From").map(|s| s.to_string()),
            recipients,
            subject: self.header("Subject").map(|s| s.to_string()),
            snippet: self.snippet.clone(),
            labels: self.label_ids.clone(),
            has_attachments: self.has_attachments(),
            date: self.date(),
            size_bytes: self.size_estimate.unwrap_or(0),
        }
    }
}
