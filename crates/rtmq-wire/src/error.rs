use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WireError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("bad checksum 0x{0:08x}")]
    BadChecksum(u32),
    #[error("body length {0} exceeds maximum")]
    Oversize(u32),
    #[error("truncated control body")]
    Truncated,
    #[error("control string is not utf-8")]
    BadUtf8,
    #[error("unknown control type {0}")]
    UnknownCtrl(u16),
    #[error("unknown auth status {0}")]
    BadStatus(u32),
}
