// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between the `ProTV` client and server.
//! This module defines the stored records of the matchmaking core and the
//! WebSocket protocol messages built on top of them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a user; also the profile's primary key
pub type UserId = Uuid;

/// Schools a profile can belong to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum School {
    #[serde(rename = "Princeton University")]
    Princeton,
    #[serde(rename = "Harvard University")]
    Harvard,
    #[serde(rename = "Yale University")]
    Yale,
    #[serde(rename = "Columbia University")]
    Columbia,
    #[serde(rename = "Cornell University")]
    Cornell,
    #[serde(rename = "Dartmouth College")]
    Dartmouth,
    #[serde(rename = "Brown University")]
    Brown,
    #[serde(rename = "University of Pennsylvania")]
    Penn,
}

impl School {
    pub const ALL: [School; 8] = [
        School::Princeton,
        School::Harvard,
        School::Yale,
        School::Columbia,
        School::Cornell,
        School::Dartmouth,
        School::Brown,
        School::Penn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            School::Princeton => "Princeton University",
            School::Harvard => "Harvard University",
            School::Yale => "Yale University",
            School::Columbia => "Columbia University",
            School::Cornell => "Cornell University",
            School::Dartmouth => "Dartmouth College",
            School::Brown => "Brown University",
            School::Penn => "University of Pennsylvania",
        }
    }
}

impl fmt::Display for School {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A user's profile, the source of every matching criterion
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: UserId,
    pub full_name: String,
    pub school: School,
    pub major: String,
    pub class_year: i32,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Optional matching criteria carried by a waiting ticket.
///
/// An empty list on a dimension means "no restriction" on that dimension.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchFilters {
    #[serde(default)]
    pub schools: Vec<School>,
    #[serde(default)]
    pub class_years: Vec<i32>,
    #[serde(default)]
    pub majors: Vec<String>,
}

impl MatchFilters {
    /// True when no dimension restricts anything
    pub fn is_open(&self) -> bool {
        self.schools.is_empty() && self.class_years.is_empty() && self.majors.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Waiting,
}

/// One user's entry in the waiting pool
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WaitingTicket {
    pub user_id: UserId,
    pub filters: MatchFilters,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

impl WaitingTicket {
    pub fn new(user_id: UserId, filters: MatchFilters) -> Self {
        Self {
            user_id,
            filters,
            status: TicketStatus::Waiting,
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Active,
    Ended,
}

/// A committed two-party session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub id: Uuid,
    pub room_id: String,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl MatchRecord {
    pub fn new(room_id: String, user1_id: UserId, user2_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            user1_id,
            user2_id,
            status: MatchStatus::Active,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MatchStatus::Active
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The other participant, or `None` if `user_id` is not part of this match
    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

/// A text message exchanged inside (or after) a match
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub match_id: Uuid,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Accepted,
}

/// A post-match relationship between two users
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: Uuid,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Same unordered pair, regardless of which side asked first
    pub fn links(&self, a: UserId, b: UserId) -> bool {
        (self.user1_id == a && self.user2_id == b) || (self.user1_id == b && self.user2_id == a)
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The other side of the connection for `user_id`
    pub fn partner_of(&self, user_id: UserId) -> Option<UserId> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

/// A connection as listed for one of its users, with the match to message through
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionSummary {
    #[serde(flatten)]
    pub connection: Connection,
    pub partner_id: UserId,
    /// Latest match between the pair
    pub match_id: Option<Uuid>,
}

/// Append-only moderation record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Report {
    pub id: Uuid,
    pub reporter_id: UserId,
    pub reported_user_id: UserId,
    pub match_id: Option<Uuid>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Why a room session finished
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Skipped,
    Reported,
    Left,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ClientToServer {
    /// Bind this connection to a user
    Identify { user_id: UserId },
    /// Enter the waiting pool, replacing any previous ticket
    EnterQueue {
        #[serde(default)]
        filters: MatchFilters,
    },
    /// Leave the waiting pool
    LeaveQueue,
    /// Open the room session for a match
    JoinRoom { room_id: String },
    /// One-time countdown extension
    ExtendTime,
    /// In-room chat
    SendChat { body: String },
    /// Connect with the current partner
    Connect,
    /// Report the current partner and leave
    Report { reason: String },
    /// End the match and go back to the queue screen
    Skip,
    /// Follow the messages of a match outside its room
    WatchMessages { match_id: Uuid },
    /// Stop following messages
    UnwatchMessages,
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ServerToClient {
    /// Response to `Identify`
    Identified {
        user_id: UserId,
        queue_count: usize,
        /// Present when the user already holds a ticket
        waiting: Option<WaitingTicket>,
    },
    /// Live size of the waiting pool
    QueueCount { count: usize },
    /// Ticket accepted into the pool
    QueueEntered { ticket: WaitingTicket },
    /// Ticket removed from the pool
    QueueLeft,
    /// The user has been paired; navigate to the room
    MatchFound {
        match_id: Uuid,
        room_id: String,
        partner_id: UserId,
    },
    /// Room session opened
    RoomJoined {
        match_record: MatchRecord,
        partner: Option<Profile>,
        remaining_secs: u32,
        extended: bool,
        /// Set when the pair is already connected
        connection: Option<Connection>,
    },
    /// The video room is ready to be joined
    TransportReady { url: String },
    /// Video room allocation failed; skip and report still work
    TransportFailed { message: String },
    /// Countdown update
    TimerTick { remaining_secs: u32 },
    /// Countdown reached zero
    TimeUp,
    /// Extension accepted
    TimeExtended { remaining_secs: u32 },
    /// Extension already used
    ExtendRejected,
    /// A chat message in the current match
    Chat { message: ChatMessage },
    /// The pair is now connected
    ConnectionAccepted { connection: Connection },
    /// The other participant ended the match
    PartnerLeft { match_id: Uuid },
    /// Pushed to everything following a match once it is over
    MatchEnded {
        match_id: Uuid,
        ended_by: UserId,
        reason: CloseReason,
    },
    /// Response to `WatchMessages`: history so far; new messages follow as `Chat`
    MessageHistory {
        match_id: Uuid,
        messages: Vec<ChatMessage>,
    },
    /// The local room session is over
    RoomClosed {
        reason: CloseReason,
        navigate_to: String,
    },
    /// Non-fatal, user-visible notice
    Notice {
        code: String,
        message: String,
        navigate_to: Option<String>,
    },
    /// Error response for malformed messages
    MalformedMessage { err_msg: String },
    /// Error response for failed operations
    Error { code: String, message: String },
}
