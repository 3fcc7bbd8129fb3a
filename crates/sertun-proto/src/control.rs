//! The control channel's RPC envelope: a thin, typed view over a
//! [`PayloadMap`] carried as the payload of channel-0 frames.
//!
//! Reserved keys: `Tk` (correlation token), `Cmd` (what this message asks
//! for or announces), `Flag` (control vs. callback), `Data` (a nested map of
//! command-specific arguments or results).

use uuid::Uuid;

use crate::{
    errors::{ProtocolError, Result},
    payload_map::PayloadMap,
    value::Value,
};

/// Reserved key for the correlation token.
pub const KEY_TOKEN: &str = "Tk";
/// Reserved key for the command.
pub const KEY_CMD: &str = "Cmd";
/// Reserved key for the message flag.
pub const KEY_FLAG: &str = "Flag";
/// Reserved key for the command-specific result or argument (a scalar for
/// `Establish`/`Connect`'s channel id, or a nested map for richer replies).
pub const KEY_DATA: &str = "Data";
/// `Connect` key: the destination hostname or address.
pub const KEY_HOST: &str = "host";
/// `Connect` key: the destination TCP port.
pub const KEY_PORT: &str = "port";
/// `Connect` key: which local front-end protocol originated the request.
pub const KEY_V: &str = "v";

/// Which local front-end protocol asked for a `Connect`. Carried in the `v`
/// key so the proxy side can log it; the proxy's behavior does not otherwise
/// depend on which front-end is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrontEnd {
    /// HTTP CONNECT tunneling.
    HttpConnect = 0,
    /// SOCKS5 (RFC 1928).
    Socks5 = 5,
}

impl FrontEnd {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::HttpConnect),
            5 => Ok(Self::Socks5),
            other => Err(ProtocolError::MalformedPayload(format!("unknown front-end marker {other}"))),
        }
    }
}

/// What a control message asks the peer to do, or announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Reserved; never sent.
    Unset = 0,
    /// Request that the peer allocate and bind a new virtual channel.
    Establish = 1,
    /// Announce that a virtual channel has been (or should be) torn down.
    Dispose = 2,
    /// Ask the peer to dial a real TCP destination on behalf of a channel.
    Connect = 3,
    /// A generic request/response not covered by the above.
    Request = 4,
}

impl Cmd {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Unset,
            1 => Self::Establish,
            2 => Self::Dispose,
            3 => Self::Connect,
            4 => Self::Request,
            other => {
                return Err(ProtocolError::MalformedPayload(format!("unknown Cmd value {other}")));
            },
        })
    }
}

/// Whether a control message is an initiating control message or a callback
/// responding to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    /// Reserved; never sent.
    Unset = 0,
    /// Initiates an operation.
    Control = 1,
    /// Responds to a previously sent [`Flag::Control`] message with the same
    /// `Tk`.
    Callback = 2,
}

impl Flag {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Unset,
            1 => Self::Control,
            2 => Self::Callback,
            other => {
                return Err(ProtocolError::MalformedPayload(format!("unknown Flag value {other}")));
            },
        })
    }
}

/// The correlation token that pairs a [`Flag::Callback`] with the
/// [`Flag::Control`] message it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A monotonically allocated integer token.
    Sequence(i64),
    /// A GUID token, used by peers that mint tokens independently.
    Guid(Uuid),
}

impl From<Token> for Value {
    fn from(t: Token) -> Self {
        match t {
            Token::Sequence(n) => Value::I64(n),
            Token::Guid(g) => Value::Guid(g),
        }
    }
}

/// A parsed control-channel message: a typed view over a [`PayloadMap`].
#[derive(Debug, Clone)]
pub struct ControlMessage {
    map: PayloadMap,
}

impl ControlMessage {
    /// Builds a new control message with the required fields set.
    ///
    /// # Errors
    ///
    /// Propagates any [`PayloadMap::set`] failure, though none are expected
    /// for these scalar-only assignments.
    pub fn new(token: Token, cmd: Cmd, flag: Flag) -> Result<Self> {
        let map = PayloadMap::new();
        map.set(KEY_TOKEN, token)?;
        map.set(KEY_CMD, Value::U8(cmd as u8))?;
        map.set(KEY_FLAG, Value::U8(flag as u8))?;
        Ok(Self { map })
    }

    /// Convenience constructor for an `Establish` request: asks the peer to
    /// allocate a new virtual channel.
    ///
    /// # Errors
    ///
    /// See [`ControlMessage::new`].
    pub fn establish(token: Token) -> Result<Self> {
        Self::new(token, Cmd::Establish, Flag::Control)
    }

    /// Convenience constructor for a `Connect` request: asks the peer to dial
    /// `host:port` on behalf of the already-[`Cmd::Establish`]ed channel
    /// `cid`. `front_end` records which local protocol (SOCKS5 or
    /// HTTP-CONNECT) originated the request.
    ///
    /// # Errors
    ///
    /// See [`ControlMessage::new`].
    pub fn connect(token: Token, cid: i64, host: &str, port: u16, front_end: FrontEnd) -> Result<Self> {
        let msg = Self::new(token, Cmd::Connect, Flag::Control)?;
        msg.map.set(KEY_DATA, Value::I64(cid))?;
        msg.map.set(KEY_HOST, host)?;
        msg.map.set(KEY_PORT, i64::from(port))?;
        msg.map.set(KEY_V, Value::U8(front_end as u8))?;
        Ok(msg)
    }

    /// Convenience constructor for an `Establish` callback reply. `cid` is
    /// the newly allocated channel id, or `None` if allocation failed (the
    /// wire encodes failure as `-1`).
    ///
    /// # Errors
    ///
    /// See [`ControlMessage::new`].
    pub fn establish_reply(&self, cid: Option<i64>) -> Result<Self> {
        let msg = Self::new(self.token()?, Cmd::Unset, Flag::Callback)?;
        msg.map.set(KEY_DATA, Value::I64(cid.unwrap_or(-1)))?;
        Ok(msg)
    }

    /// The channel id carried in `Data` of a `Connect` request or an
    /// `Establish` reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `Data` is absent or not an
    /// integer.
    pub fn cid(&self) -> Result<i64> {
        match self.map.get(KEY_DATA) {
            Some(Value::I64(n)) => Ok(n),
            _ => Err(ProtocolError::TypeMismatch { key: KEY_DATA.to_owned() }),
        }
    }

    /// The destination host of a `Connect` request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `host` is absent or not a
    /// string.
    pub fn host(&self) -> Result<String> {
        self.map.get_as(KEY_HOST)
    }

    /// The destination port of a `Connect` request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `port` is absent or out of
    /// range for `u16`.
    pub fn port(&self) -> Result<u16> {
        self.map.get_as(KEY_PORT)
    }

    /// The front-end protocol marker of a `Connect` request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] or
    /// [`ProtocolError::MalformedPayload`] if `v` is absent or unrecognized.
    pub fn front_end(&self) -> Result<FrontEnd> {
        match self.map.get(KEY_V) {
            Some(Value::U8(b)) => FrontEnd::from_u8(b),
            _ => Err(ProtocolError::TypeMismatch { key: KEY_V.to_owned() }),
        }
    }

    /// Convenience constructor for a `Dispose` announcement naming the
    /// channel the peer should close, if still present.
    ///
    /// # Errors
    ///
    /// See [`ControlMessage::new`].
    pub fn dispose_for(token: Token, cid: i64) -> Result<Self> {
        let msg = Self::new(token, Cmd::Dispose, Flag::Control)?;
        msg.map.set(KEY_DATA, Value::I64(cid))?;
        Ok(msg)
    }

    /// Builds a `Callback` reply to `self`, carrying `data` as the result.
    ///
    /// # Errors
    ///
    /// See [`ControlMessage::new`].
    pub fn reply(&self, data: Option<PayloadMap>) -> Result<Self> {
        let msg = Self::new(self.token()?, Cmd::Unset, Flag::Callback)?;
        if let Some(data) = data {
            msg.map.set(KEY_DATA, data)?;
        }
        Ok(msg)
    }

    /// The correlation token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `Tk` is missing or not an
    /// integer/GUID.
    pub fn token(&self) -> Result<Token> {
        match self.map.get(KEY_TOKEN) {
            Some(Value::I64(n)) => Ok(Token::Sequence(n)),
            Some(Value::Guid(g)) => Ok(Token::Guid(g)),
            _ => Err(ProtocolError::TypeMismatch { key: KEY_TOKEN.to_owned() }),
        }
    }

    /// The command this message carries.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `Cmd` is missing or not a
    /// recognized value.
    pub fn cmd(&self) -> Result<Cmd> {
        match self.map.get(KEY_CMD) {
            Some(Value::U8(b)) => Cmd::from_u8(b),
            _ => Err(ProtocolError::TypeMismatch { key: KEY_CMD.to_owned() }),
        }
    }

    /// The control/callback flag.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `Flag` is missing or not a
    /// recognized value.
    pub fn flag(&self) -> Result<Flag> {
        match self.map.get(KEY_FLAG) {
            Some(Value::U8(b)) => Flag::from_u8(b),
            _ => Err(ProtocolError::TypeMismatch { key: KEY_FLAG.to_owned() }),
        }
    }

    /// The command-specific data map, if present.
    #[must_use]
    pub fn data(&self) -> Option<PayloadMap> {
        match self.map.get(KEY_DATA) {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }

    /// Borrows the underlying map, for callers that need raw field access
    /// beyond the reserved keys.
    #[must_use]
    pub fn as_map(&self) -> &PayloadMap {
        &self.map
    }

    /// Serializes this message to its wire form (a plain [`PayloadMap`]
    /// encoding; framing into a [`crate::frame::Frame`] is the caller's
    /// concern).
    ///
    /// # Errors
    ///
    /// See [`PayloadMap::encode`].
    pub fn encode(&self) -> Result<bytes::BytesMut> {
        self.map.encode()
    }

    /// Parses a control message from a decoded [`PayloadMap`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if `Tk`, `Cmd`, or `Flag` are
    /// missing or malformed.
    pub fn from_map(map: PayloadMap) -> Result<Self> {
        let msg = Self { map };
        msg.token()?;
        msg.cmd()?;
        msg.flag()?;
        Ok(msg)
    }

    /// Parses a control message from its wire form.
    ///
    /// # Errors
    ///
    /// See [`PayloadMap::decode`] and [`ControlMessage::from_map`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_map(PayloadMap::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn establish_round_trips_through_the_wire() {
        let msg = ControlMessage::establish(Token::Sequence(42)).expect("build");
        let encoded = msg.encode().expect("encode");
        let decoded = ControlMessage::decode(&encoded).expect("decode");

        assert_eq!(decoded.token().expect("token"), Token::Sequence(42));
        assert_eq!(decoded.cmd().expect("cmd"), Cmd::Establish);
        assert_eq!(decoded.flag().expect("flag"), Flag::Control);
    }

    #[test]
    fn connect_carries_cid_host_port_and_front_end() {
        let msg = ControlMessage::connect(Token::Sequence(1), 7, "example.com", 443, FrontEnd::HttpConnect)
            .expect("build");
        assert_eq!(msg.cid().expect("cid"), 7);
        assert_eq!(msg.host().expect("host"), "example.com");
        assert_eq!(msg.port().expect("port"), 443);
        assert_eq!(msg.front_end().expect("front-end"), FrontEnd::HttpConnect);
    }

    #[test]
    fn establish_reply_carries_allocated_cid() {
        let request = ControlMessage::establish(Token::Sequence(9)).expect("build");
        let reply = request.establish_reply(Some(3)).expect("reply");
        assert_eq!(reply.flag().expect("flag"), Flag::Callback);
        assert_eq!(reply.cid().expect("cid"), 3);
    }

    #[test]
    fn establish_reply_encodes_failure_as_negative_one() {
        let request = ControlMessage::establish(Token::Sequence(9)).expect("build");
        let reply = request.establish_reply(None).expect("reply");
        assert_eq!(reply.cid().expect("cid"), -1);
    }

    #[test]
    fn reply_preserves_token_and_switches_to_callback() {
        let request = ControlMessage::establish(Token::Sequence(7)).expect("build");
        let reply = request.reply(None).expect("reply");

        assert_eq!(reply.token().expect("token"), Token::Sequence(7));
        assert_eq!(reply.cmd().expect("cmd"), Cmd::Unset);
        assert_eq!(reply.flag().expect("flag"), Flag::Callback);
    }

    #[test]
    fn guid_token_round_trips() {
        let guid = Uuid::new_v4();
        let msg = ControlMessage::dispose_for(Token::Guid(guid), 4).expect("build");
        let encoded = msg.encode().expect("encode");
        let decoded = ControlMessage::decode(&encoded).expect("decode");
        assert_eq!(decoded.token().expect("token"), Token::Guid(guid));
        assert_eq!(decoded.cid().expect("cid"), 4);
    }

    #[test]
    fn missing_cmd_is_rejected() {
        let map = PayloadMap::new();
        map.set(KEY_TOKEN, 1i64).expect("set");
        map.set(KEY_FLAG, Value::U8(Flag::Control as u8)).expect("set");
        assert!(matches!(
            ControlMessage::from_map(map),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }
}
