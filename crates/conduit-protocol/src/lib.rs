pub mod codec;
pub mod frame;
pub mod packet;
pub mod registry;
pub mod state;
pub mod version;

pub use codec::*;
pub use frame::{
    Connection, FrameError, FrameReader, FrameWriter, InitialFrame, LegacyPingFormat,
    MAX_FRAME_LEN,
};
pub use packet::Packet;
pub use registry::{table, Direction, PacketKind, PacketTable};
pub use state::ConnectionState;
pub use version::{ProtocolVersion, SUPPORTED_VERSIONS};
