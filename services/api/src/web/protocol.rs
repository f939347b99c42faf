//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the API
//! server for the live roster and profile views.

use serde::{Deserialize, Serialize};

use crate::web::rest::{FilterStatus, RosterStatsDto, StudentDto};

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Which live view a connection mirrors.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Roster,
    Profile,
}

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Selects the view. This must be the first message sent on the connection.
    Init {
        view: ViewKind,
        #[serde(default)]
        search: String,
        #[serde(default)]
        status: FilterStatus,
    },

    /// Changes the roster projection. The cache itself is untouched.
    SetFilter {
        #[serde(default)]
        search: String,
        #[serde(default)]
        status: FilterStatus,
    },

    /// Edits the caller's profile (profile view only).
    UpdateProfile { name: String, email: String },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The current roster projection. `live` is false once updates have stopped.
    Roster {
        students: Vec<StudentDto>,
        stats: RosterStatsDto,
        live: bool,
    },

    /// The caller's student record.
    Profile {
        student: Option<StudentDto>,
        live: bool,
    },

    /// A recoverable problem the client should display inline.
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
