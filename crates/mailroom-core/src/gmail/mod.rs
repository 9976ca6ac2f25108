pub mod client;
pub mod types;

pub use client::{GmailRestClient, MailApi, MailApiError, fetch_batch, with_backoff};
pub use types::{GmailMessage, Header, MessageList, MessagePart, MessageRef};
