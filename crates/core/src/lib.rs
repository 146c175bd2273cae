pub mod actions;
pub mod codec;
pub mod config;
pub mod error;
pub mod paths;
pub mod pending;
pub mod protocol;

pub use actions::{validate_params, ActionKind, ALL_ACTIONS};
pub use codec::{decode_frame, encode_frame, FrameBuffer, MAX_FRAME_BYTES};
pub use config::Config;
pub use error::{wire, Error, Result};
pub use paths::Paths;
pub use pending::{PendingTable, RequestOutcome};
pub use protocol::{Frame, RequestFrame, ResponseFrame};
