use crate::error::WireError;

/// Message types below this value are broker control traffic and are handled
/// inline by the receive server; application types live at or above it.
pub const CTRL_TYPE_MAX: u16 = 0x0010;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CtrlType {
    Auth = 0x0001,
    AuthAck = 0x0002,
    Keepalive = 0x0003,
    Sub = 0x0004,
    Unsub = 0x0005,
    Ping = 0x0006,
    Pong = 0x0007,
}

impl CtrlType {
    pub fn from_u16(raw: u16) -> Result<Self, WireError> {
        Ok(match raw {
            0x0001 => Self::Auth,
            0x0002 => Self::AuthAck,
            0x0003 => Self::Keepalive,
            0x0004 => Self::Sub,
            0x0005 => Self::Unsub,
            0x0006 => Self::Ping,
            0x0007 => Self::Pong,
            other => return Err(WireError::UnknownCtrl(other)),
        })
    }
}

#[inline]
pub fn is_ctrl(msg_type: u16) -> bool {
    msg_type < CTRL_TYPE_MAX
}

/// AUTH body: `{node_id, username, password}` with u32-length-prefixed
/// strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthReq {
    pub node_id: u32,
    pub username: String,
    pub password: String,
}

impl AuthReq {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.node_id.to_be_bytes());
        put_str(out, &self.username);
        put_str(out, &self.password);
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor { body, pos: 0 };
        let node_id = cur.take_u32()?;
        let username = cur.take_str()?;
        let password = cur.take_str()?;
        Ok(Self { node_id, username, password })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthStatus {
    Ok = 0,
    BadCred = 1,
    DupNode = 2,
}

/// AUTH_ACK body: a single status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthAck {
    pub status: AuthStatus,
}

impl AuthAck {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.status as u32).to_be_bytes());
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor { body, pos: 0 };
        let status = match cur.take_u32()? {
            0 => AuthStatus::Ok,
            1 => AuthStatus::BadCred,
            2 => AuthStatus::DupNode,
            other => return Err(WireError::BadStatus(other)),
        };
        Ok(Self { status })
    }
}

/// SUB / UNSUB body: the message type being (un)subscribed, widened to u32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubReq {
    pub msg_type: u16,
}

impl SubReq {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::from(self.msg_type).to_be_bytes());
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor { body, pos: 0 };
        Ok(Self { msg_type: cur.take_u32()? as u16 })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take_u32(&mut self) -> Result<u32, WireError> {
        let end = self.pos + 4;
        if end > self.body.len() {
            return Err(WireError::Truncated);
        }
        let v = u32::from_be_bytes(self.body[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(v)
    }

    fn take_str(&mut self) -> Result<String, WireError> {
        let len = self.take_u32()? as usize;
        let end = self.pos + len;
        if end > self.body.len() {
            return Err(WireError::Truncated);
        }
        let s = std::str::from_utf8(&self.body[self.pos..end]).map_err(|_| WireError::BadUtf8)?;
        self.pos = end;
        Ok(s.to_owned())
    }
}
