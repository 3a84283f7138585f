//! Prefixed ID generation for Grove entities.
//!
//! All IDs use a `gr_` brand prefix so they can never be mistaken for a
//! payment provider's transaction or subscription identifiers.
//!
//! Format: `gr_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

const ALL_PREFIXES: &[&str] = &[
    "gr_usr_",
    "gr_prj_",
    "gr_pay_",
    "gr_sub_",
    "gr_don_",
    "gr_ach_",
    "gr_whe_",
];

/// Validate that a string is a Grove prefixed ID.
///
/// Cheap format check used before trusting ids that arrive in metadata or
/// provider payloads.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };

    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    User,
    Project,
    Payment,
    Subscription,
    Donation,
    Achievement,
    WebhookEvent,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::User => "gr_usr",
            Self::Project => "gr_prj",
            Self::Payment => "gr_pay",
            Self::Subscription => "gr_sub",
            Self::Donation => "gr_don",
            Self::Achievement => "gr_ach",
            Self::WebhookEvent => "gr_whe",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
