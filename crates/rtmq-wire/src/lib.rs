mod control;
mod error;
mod frame;

pub use control::{AuthAck, AuthReq, AuthStatus, CTRL_TYPE_MAX, CtrlType, SubReq, is_ctrl};
pub use error::WireError;
pub use frame::{
    Decoded, FRAME_CHECKSUM, FRAME_MAGIC, FrameFlags, FrameHeader, MAX_FRAME_BODY, decode,
    encode_frame,
};
