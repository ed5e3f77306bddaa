//! Seam between the coordinator and the vendor's recovery endpoints.

use async_trait::async_trait;

use super::request::RecoveryScope;
use crate::error::ApiError;

/// One `initiate_request` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCall {
    pub product: String,
    pub scope: RecoveryScope,
    pub request_id: u64,
    pub node_id: u32,
    pub after: Option<i64>,
}

impl RecoveryCall {
    /// Path relative to the API base URL.
    pub fn path(&self) -> String {
        match &self.scope {
            RecoveryScope::Product => format!("/{}/recovery/initiate_request", self.product),
            RecoveryScope::Event { entity_id } => format!(
                "/{}/odds/events/{}/initiate_request",
                self.product, entity_id
            ),
            RecoveryScope::StatefulMessages { entity_id } => format!(
                "/{}/stateful_messages/events/{}/initiate_request",
                self.product, entity_id
            ),
        }
    }

    /// Query parameters in the order the vendor documents them.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::with_capacity(3);
        if let Some(after) = self.after {
            query.push(("after", after.to_string()));
        }
        query.push(("request_id", self.request_id.to_string()));
        query.push(("node_id", self.node_id.to_string()));
        query
    }
}

/// Raw vendor answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply {
    pub status: u16,
    pub body: String,
}

/// How the coordinator should treat a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Accepted,
    RateLimited,
    Rejected,
}

impl ApiReply {
    /// Any 2xx accepts; 429, or 403 with "Too many requests", is a rate limit.
    pub fn class(&self) -> ReplyClass {
        match self.status {
            200..=299 => ReplyClass::Accepted,
            429 => ReplyClass::RateLimited,
            403 if self.body.contains("Too many requests") => ReplyClass::RateLimited,
            _ => ReplyClass::Rejected,
        }
    }
}

/// Issues recovery calls against the vendor.
#[async_trait]
pub trait RecoveryApi: Send + Sync {
    /// Perform the call. Non-2xx statuses are returned as replies, not errors.
    async fn initiate(&self, call: &RecoveryCall) -> Result<ApiReply, ApiError>;
}
