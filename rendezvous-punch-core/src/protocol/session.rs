use std::fmt;
use std::str::FromStr;

/// Token generated fresh for every connection attempt.
///
/// Two attempts made under the same identity always carry different session
/// ids, which is what lets a peer tell a restarted instance apart from a
/// rendezvous record that simply has not expired yet.
///
/// # Examples
///
/// ```rust
/// use rendezvous_punch_core::protocol::SessionId;
///
/// let id = SessionId::new(0x1f);
/// assert_eq!(id.to_string(), "000000000000001f");
/// assert_eq!("000000000000001f".parse::<SessionId>().unwrap(), id);
/// ```
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> SessionId {
        SessionId(value)
    }
    pub fn random() -> SessionId {
        SessionId(rand::random())
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
    pub fn from_be_bytes(bytes: [u8; 8]) -> SessionId {
        SessionId(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value)
    }
}

impl From<SessionId> for u64 {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 16 {
            return Err(format!("not a session id: '{s}'"));
        }
        u64::from_str_radix(s, 16)
            .map(SessionId)
            .map_err(|e| format!("not a session id: '{s}', {e}"))
    }
}
