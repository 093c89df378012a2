//! Peer-to-peer UDP session layer.
//!
//! Wire format: one tag byte followed by the payload. Only lifecycle packets
//! (connect, disconnect, heartbeat) get an acknowledgement; application
//! payloads are fire-and-forget.
//!
//! | Tag | Packet | Payload |
//! |---|---|---|
//! | 0 | HeartbeatRequest | requester-assigned client ID |
//! | 1 | HeartbeatAcknowledge | responder's client ID |
//! | 2 | ConnectionRequest | empty |
//! | 3 | ConnectionAcknowledge | newly assigned client ID |
//! | 4 | DisconnectRequest | empty |
//! | 5 | DisconnectAcknowledge | empty |
//! | 6 | ClientDisconnectAlert | ID of the client that left |

pub mod heartbeat;
pub mod hooks;
pub mod packet;
pub mod packet_type;
pub mod removal;
pub mod session;

pub use hooks::{Lifecycle, SessionHooks};
pub use packet::{Packet, PacketKind};
pub use packet_type::{PacketTypeError, PacketTypeTable};
pub use session::{
    PeerState, SessionError, SessionManager, WeakSession, HOST_CLIENT_ID, MAX_CLIENT_ID,
};
