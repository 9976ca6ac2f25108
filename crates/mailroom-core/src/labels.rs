use serde::{Deserialize, Serialize};

/// Gmail system labels recognized by the rule engine and the label
/// classifier. User-defined labels pass through as plain strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemLabel {
    Inbox,
    Sent,
    Draft,
    Spam,
    Trash,
    Unread,
    Starred,
    Important,
    CategoryPersonal,
    CategorySocial,
    CategoryPromotions,
    CategoryUpdates,
    CategoryForums,
}

impl SystemLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemLabel::Inbox => "INBOX",
            SystemLabel::Sent => "SENT",
            SystemLabel::Draft => "DRAFT",
            SystemLabel::Spam => "SPAM",
            SystemLabel::Trash => "TRASH",
            SystemLabel::Unread => "UNREAD",
            SystemLabel::Starred => "STARRED",
            SystemLabel::Important => "IMPORTANT",
            SystemLabel::CategoryPersonal => "CATEGORY_PERSONAL",
            SystemLabel::CategorySocial => "CATEGORY_SOCIAL",
            SystemLabel::CategoryPromotions => "CATEGORY_PROMOTIONS",
            SystemLabel::CategoryUpdates => "CATEGORY_UPDATES",
            SystemLabel::CategoryForums => "CATEGORY_FORUMS",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INBOX" => Some(Self::Inbox),
            "SENT" => Some(Self::Sent),
            "DRAFT" => Some(Self::Draft),
            "SPAM" => Some(Self::Spam),
            "TRASH" => Some(Self::Trash),
            "UNREAD" => Some(Self::Unread),
            "STARRED" => Some(Self::Starred),
            "IMPORTANT" => Some(Self::Important),
            "CATEGORY_PERSONAL" => Some(Self::CategoryPersonal),
            "CATEGORY_SOCIAL" => Some(Self::CategorySocial),
            "CATEGORY_PROMOTIONS" => Some(Self::CategoryPromotions),
            "CATEGORY_UPDATES" => Some(Self::CategoryUpdates),
            "CATEGORY_FORUMS" => Some(Self::CategoryForums),
            _ => None,
        }
    }
}

/// Semantic bucket a label maps into. This is the `gmail_category` value
/// stored on an email after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticBucket {
    Important,
    Spam,
    Promotions,
    Social,
    Updates,
    Forums,
    Primary,
}

impl SemanticBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticBucket::Important => "important",
            SemanticBucket::Spam => "spam",
            SemanticBucket::Promotions => "promotions",
            SemanticBucket::Social => "social",
            SemanticBucket::Updates => "updates",
            SemanticBucket::Forums => "forums",
            SemanticBucket::Primary => "primary",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "important" => Some(Self::Important),
            "spam" => Some(Self::Spam),
            "promotions" => Some(Self::Promotions),
            "social" => Some(Self::Social),
            "updates" => Some(Self::Updates),
            "forums" => Some(Self::Forums),
            "primary" => Some(Self::Primary),
            _ => None,
        }
    }

    /// Tie-break precedence when several buckets score equally.
    pub fn precedence(&self) -> u8 {
        match self {
            SemanticBucket::Important => 0,
            SemanticBucket::Spam => 1,
            SemanticBucket::Promotions => 2,
            SemanticBucket::Social => 3,
            SemanticBucket::Updates => 4,
            SemanticBucket::Forums => 5,
            SemanticBucket::Primary => 6,
        }
    }
}

/// Bucket a system label classifies into directly.
pub fn bucket_for(label: SystemLabel) -> Option<SemanticBucket> {
    match label {
        SystemLabel::Important | SystemLabel::Starred => Some(SemanticBucket::Important),
        SystemLabel::Spam => Some(SemanticBucket::Spam),
        SystemLabel::CategoryPromotions => Some(SemanticBucket::Promotions),
        SystemLabel::CategorySocial => Some(SemanticBucket::Social),
        SystemLabel::CategoryUpdates => Some(SemanticBucket::Updates),
        SystemLabel::CategoryForums => Some(SemanticBucket::Forums),
        SystemLabel::CategoryPersonal => Some(SemanticBucket::Primary),
        SystemLabel::Inbox
        | SystemLabel::Sent
        | SystemLabel::Draft
        | SystemLabel::Trash
        | SystemLabel::Unread => None,
    }
}
