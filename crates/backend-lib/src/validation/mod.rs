// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.

use protv_common::{ClientToServer, MatchFilters, Profile};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_ROOM_ID_LENGTH: usize = 64;
const MAX_CHAT_MESSAGE_LENGTH: usize = 2000;
const MAX_REPORT_REASON_LENGTH: usize = 1000;
const MAX_NAME_LENGTH: usize = 100;
const MAX_MAJOR_LENGTH: usize = 100;
const MAX_MAJOR_FILTERS: usize = 10;
const MAX_CLASS_YEAR_FILTERS: usize = 10;
const MAX_INTERESTS: usize = 20;
const MAX_INTEREST_LENGTH: usize = 50;
const MIN_CLASS_YEAR: i32 = 1950;
const MAX_CLASS_YEAR: i32 = 2100;

static ROOM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^room_[0-9]+_[a-z0-9]+$").unwrap());
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^<>/\\{}\[\];]*$").unwrap());

/// Possible validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid filters: {0}")]
    InvalidFilters(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Report reason must not be empty")]
    EmptyReportReason,

    #[error("Report reason cannot exceed {MAX_REPORT_REASON_LENGTH} characters")]
    ReportReasonTooLong,

    #[error("Message must not be empty")]
    EmptyChatMessage,

    #[error("Message cannot exceed {MAX_CHAT_MESSAGE_LENGTH} characters")]
    ChatMessageTooLong,
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a room identifier (`room_<millis>_<suffix>`)
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if room_id.is_empty() {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must not be empty".to_string(),
        ));
    }

    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(ValidationError::InvalidRoomId(format!(
            "Room ID cannot exceed {MAX_ROOM_ID_LENGTH} characters"
        )));
    }

    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must look like room_<timestamp>_<suffix>".to_string(),
        ));
    }

    Ok(room_id)
}

fn validate_class_year(year: i32) -> bool {
    (MIN_CLASS_YEAR..=MAX_CLASS_YEAR).contains(&year)
}

/// Validate queue filters
pub fn validate_filters(filters: &MatchFilters) -> ValidationResult<()> {
    if filters.class_years.len() > MAX_CLASS_YEAR_FILTERS {
        return Err(ValidationError::InvalidFilters(format!(
            "At most {MAX_CLASS_YEAR_FILTERS} class years can be selected"
        )));
    }

    if let Some(year) = filters.class_years.iter().find(|y| !validate_class_year(**y)) {
        return Err(ValidationError::InvalidFilters(format!(
            "Class year {year} is out of range"
        )));
    }

    if filters.majors.len() > MAX_MAJOR_FILTERS {
        return Err(ValidationError::InvalidFilters(format!(
            "At most {MAX_MAJOR_FILTERS} majors can be selected"
        )));
    }

    for major in &filters.majors {
        let trimmed = major.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::InvalidFilters(
                "Major filter must not be blank".to_string(),
            ));
        }
        if trimmed.len() > MAX_MAJOR_LENGTH {
            return Err(ValidationError::InvalidFilters(format!(
                "Major filter cannot exceed {MAX_MAJOR_LENGTH} characters"
            )));
        }
    }

    Ok(())
}

/// Deduplicate and trim filters so the pool stores a canonical form
pub fn normalize_filters(filters: MatchFilters) -> MatchFilters {
    let mut schools = filters.schools;
    schools.sort();
    schools.dedup();

    let mut class_years = filters.class_years;
    class_years.sort_unstable();
    class_years.dedup();

    let mut majors: Vec<String> = Vec::with_capacity(filters.majors.len());
    for major in filters.majors {
        let major = major.trim().to_string();
        if !majors.iter().any(|m| m.eq_ignore_ascii_case(&major)) {
            majors.push(major);
        }
    }

    MatchFilters {
        schools,
        class_years,
        majors,
    }
}

/// Validate a report reason; blank reasons never reach the store
pub fn validate_report_reason(reason: &str) -> ValidationResult<&str> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyReportReason);
    }
    if trimmed.len() > MAX_REPORT_REASON_LENGTH {
        return Err(ValidationError::ReportReasonTooLong);
    }
    Ok(trimmed)
}

/// Validate a chat message body
pub fn validate_chat_body(body: &str) -> ValidationResult<&str> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyChatMessage);
    }
    if trimmed.len() > MAX_CHAT_MESSAGE_LENGTH {
        return Err(ValidationError::ChatMessageTooLong);
    }
    Ok(trimmed)
}

/// Validate a profile before it enters the directory
pub fn validate_profile(profile: &Profile) -> ValidationResult<()> {
    let name = profile.full_name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::InvalidProfile(format!(
            "Full name must be between 1 and {MAX_NAME_LENGTH} characters"
        )));
    }

    if !NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidProfile(
            "Full name contains invalid characters".to_string(),
        ));
    }

    let major = profile.major.trim();
    if major.is_empty() || major.len() > MAX_MAJOR_LENGTH {
        return Err(ValidationError::InvalidProfile(format!(
            "Major must be between 1 and {MAX_MAJOR_LENGTH} characters"
        )));
    }

    if !validate_class_year(profile.class_year) {
        return Err(ValidationError::InvalidProfile(format!(
            "Class year {} is out of range",
            profile.class_year
        )));
    }

    if profile.interests.len() > MAX_INTERESTS
        || profile.interests.iter().any(|i| i.len() > MAX_INTEREST_LENGTH)
    {
        return Err(ValidationError::InvalidProfile(format!(
            "At most {MAX_INTERESTS} interests of up to {MAX_INTEREST_LENGTH} characters"
        )));
    }

    Ok(())
}

/// Validates a client message
pub fn validate_client_message(message: &ClientToServer) -> ValidationResult<()> {
    match message {
        ClientToServer::EnterQueue { filters } => validate_filters(filters)?,
        ClientToServer::JoinRoom { room_id } => {
            validate_room_id(room_id)?;
        },
        ClientToServer::SendChat { body } => {
            validate_chat_body(body)?;
        },
        ClientToServer::Report { reason } => {
            validate_report_reason(reason)?;
        },
        ClientToServer::Identify { .. }
        | ClientToServer::LeaveQueue
        | ClientToServer::ExtendTime
        | ClientToServer::Connect
        | ClientToServer::Skip
        | ClientToServer::WatchMessages { .. }
        | ClientToServer::UnwatchMessages => {},
    }

    Ok(())
}
