// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const QUEUE_SIZE: &str = "queue.size";
pub const QUEUE_ENTERED: &str = "queue.entered";
pub const MATCH_CREATED: &str = "match.created";
pub const MATCH_ROLLBACK: &str = "match.rollback";
pub const MATCH_ENDED: &str = "match.ended";
pub const REPORT_FILED: &str = "report.filed";
pub const CHAT_SENT: &str = "chat.sent";
pub const TRANSPORT_FAILED: &str = "transport.failed";
