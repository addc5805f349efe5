//! Structured request/response types for whatever transport fronts the matcher.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MatchError;
use crate::service::{MatchResult, Matcher, RecordStatus};
use crate::storage::Record;

pub const MSG_MATCH_FOUND: &str = "Match found";
pub const MSG_MATCH_DEGRADED: &str = "Match found; record details unavailable";
pub const MSG_NO_MATCH: &str = "No match found";
pub const MSG_FILE_NOT_FOUND: &str = "File not found";
pub const MSG_UNREADABLE: &str = "Unreadable image";
pub const MSG_INTERNAL: &str = "Internal error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub image_path: PathBuf,
    /// Opaque caller tag echoed back in the payload.
    #[serde(default)]
    pub requester_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordAvailability {
    Found,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPayload {
    pub requester_tag: Option<String>,
    pub identity_id: String,
    pub similarity: f64,
    pub record_status: RecordAvailability,
    pub details: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MatchPayload>,
    /// Suggested transport status code.
    #[serde(skip)]
    pub status: u16,
}

impl MatchResponse {
    fn failure(message: &str, status: u16) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
            status,
        }
    }

    /// Map a pipeline outcome to a response. Only confirmed matches carry a
    /// payload; the message never includes paths or internal detail.
    pub fn from_outcome(
        outcome: Result<MatchResult, MatchError>,
        requester_tag: Option<String>,
    ) -> Self {
        let result = match outcome {
            Ok(result) => result,
            Err(MatchError::InputNotFound) => return Self::failure(MSG_FILE_NOT_FOUND, 400),
            Err(MatchError::InputUnreadable(_)) => return Self::failure(MSG_UNREADABLE, 400),
            Err(e) => {
                log::error!("match request failed: {e}");
                return Self::failure(MSG_INTERNAL, 500);
            }
        };

        let (Some(identity_id), true) = (result.candidate_id.clone(), result.confirmed) else {
            return Self::failure(MSG_NO_MATCH, 200);
        };

        let (message, record_status, details) = match result.record {
            RecordStatus::Found(record) => (MSG_MATCH_FOUND, RecordAvailability::Found, Some(record)),
            RecordStatus::Unavailable(_) => {
                (MSG_MATCH_DEGRADED, RecordAvailability::Unavailable, None)
            }
            RecordStatus::Missing | RecordStatus::NotRequested => {
                return Self::failure(MSG_NO_MATCH, 200)
            }
        };

        Self {
            success: true,
            message: message.to_string(),
            data: Some(MatchPayload {
                requester_tag,
                identity_id,
                similarity: result.similarity,
                record_status,
                details,
            }),
            status: 200,
        }
    }
}

/// Serve one request against a loaded matcher.
pub fn handle(matcher: &Matcher, request: MatchRequest) -> MatchResponse {
    let outcome = matcher.match_path(&request.image_path);
    MatchResponse::from_outcome(outcome, request.requester_tag)
}
