//! The ids for messages exchanged on a session stream. They are used consistently
//! across the gateway and any terminal front-end.
//! Also contains the attach request structure for joining a session stream.

use serde::{Deserialize, Serialize};

/// The buffer size for the per-connection channels inside the gateway.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

// Client -> Server.

/// The first message on a fresh stream socket, followed by a postcard encoded [`AttachRequest`].
pub const ATTACH_REQUEST: u8 = 0;

/// User keystrokes for the hosted program, followed by the raw bytes.
pub const PLAYER_INPUT: u8 = 1;

/// Terminal window change, followed by u16 cols and u16 rows.
pub const RESIZE_TERMINAL: u8 = 2;
/// The resize message size (Header + cols + rows) (u8 + u16 + u16)
pub const RESIZE_MSG_SIZE: usize = 5;

/// The client detaches from the stream. The session itself keeps running.
pub const CLIENT_DETACH: u8 = 3;

// Server -> Client.

/// Positive attach response, followed by u16 cols and u16 rows of the session terminal.
pub const ATTACH_OK: u8 = 0;
/// The attach response size (Header + cols + rows) (u8 + u16 + u16)
pub const ATTACH_OK_SIZE: usize = 5;

/// One frame of program output, followed by u64 frame id, i64 unix timestamp in
/// nanoseconds and the payload bytes.
pub const OUTPUT_FRAME: u8 = 1;
/// The fixed prefix of an output frame (Header + frame id + timestamp) (u8 + u64 + i64)
pub const FRAME_HEADER_SIZE: usize = 17;

/// An error message from the gateway, followed by a utf-8 description. The socket
/// closes afterwards.
pub const GATEWAY_ERROR: u8 = 2;

/// The session behind this stream has ended. The socket closes afterwards.
pub const SESSION_CLOSED: u8 = 3;
/// The session closed message is just the byte itself.
pub const SESSION_CLOSED_MSG_SIZE: usize = 1;

/// The attach request. This struct is used on the gateway and on the client.
#[derive(Deserialize, Serialize)]
pub struct AttachRequest {
    /// The bearer token obtained from the credential service.
    pub token: String,
    /// Attach as a spectator instead of the playing user.
    pub spectate: bool,
}
