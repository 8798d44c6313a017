//! Shared scalar types: ids, labels, result flags

use crate::constants::MAX_LABEL_BYTES;
use crate::errors::{Error, Result};
use crate::helpers::label_cmp;
use std::cmp::Ordering;
use std::fmt;

/// Numeric entity id, unique for the lifetime of the owning context.
pub type EntId = u64;

/// Hit counter type.
pub type HitCount = u64;

/// Event priority; lower values sort first.
pub type Priority = u16;

/// Monotonic time in microseconds, as produced by a [`crate::capabilities::Clock`].
pub type Time = i64;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Action = 1,
    Event = 2,
    Route = 3,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Action => "action",
            ObjectType::Event => "event",
            ObjectType::Route => "route",
        }
    }
}

bitflags::bitflags! {
    /// Result word threaded through dispatch. Handlers read and mutate it;
    /// [`ActionRes::STOP`] halts the current walk.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionRes: u32 {
        const ACCEPT = 1 << 0;
        const REJECT = 1 << 1;
        const CONNECT = 1 << 2;
        const DISCONNECT = 1 << 3;
        const DEROGATORY = 1 << 4;
        const COMMENDABLE = 1 << 5;
        /// No further actions run for the current decision.
        const STOP = 1 << 6;
        /// Set by drop operations when the entity was released.
        const DEALLOCATED = 1 << 7;
        const INSERTED = 1 << 8;
        const ERROR = 1 << 9;
        const FALLTHROUGH = 1 << 10;
        const UPDATE = 1 << 11;
        const PORT_RESET = 1 << 12;
        const USER0 = 1 << 24;
        const USER1 = 1 << 25;
        const USER2 = 1 << 26;
        const USER3 = 1 << 27;
        const USER4 = 1 << 28;
        const USER5 = 1 << 29;
        const USER6 = 1 << 30;
        const USER7 = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Per-route flags. The `*_WILDCARD` and `TCPLIKE_PORT_NUMBERS` bits are
    /// part of the route key; the rest are state.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
    pub struct RouteFlags: u32 {
        const SA_FAMILY_WILDCARD = 1 << 0;
        const SA_PROTO_WILDCARD = 1 << 1;
        const SA_REMOTE_ADDR_WILDCARD = 1 << 2;
        const SA_LOCAL_ADDR_WILDCARD = 1 << 3;
        const SA_REMOTE_PORT_WILDCARD = 1 << 4;
        const SA_LOCAL_PORT_WILDCARD = 1 << 5;
        const REMOTE_INTERFACE_WILDCARD = 1 << 6;
        const LOCAL_INTERFACE_WILDCARD = 1 << 7;
        const TCPLIKE_PORT_NUMBERS = 1 << 8;
        const DIRECTION_IN = 1 << 9;
        const DIRECTION_OUT = 1 << 10;
        const PENALTYBOXED = 1 << 16;
        const GREENLISTED = 1 << 17;
        /// Dispatch over this route leaves action and route hit counts untouched.
        const DONT_COUNT_HITS = 1 << 18;
        const DONT_COUNT_CURRENT_CONNECTIONS = 1 << 19;
        const IN_TABLE = 1 << 20;
    }
}

impl RouteFlags {
    /// Bits that take part in route key comparison.
    pub const KEY_MASK: RouteFlags = RouteFlags::from_bits_truncate(
        RouteFlags::SA_FAMILY_WILDCARD.bits()
            | RouteFlags::SA_PROTO_WILDCARD.bits()
            | RouteFlags::SA_REMOTE_ADDR_WILDCARD.bits()
            | RouteFlags::SA_LOCAL_ADDR_WILDCARD.bits()
            | RouteFlags::SA_REMOTE_PORT_WILDCARD.bits()
            | RouteFlags::SA_LOCAL_PORT_WILDCARD.bits()
            | RouteFlags::REMOTE_INTERFACE_WILDCARD.bits()
            | RouteFlags::LOCAL_INTERFACE_WILDCARD.bits()
            | RouteFlags::TCPLIKE_PORT_NUMBERS.bits()
            | RouteFlags::DIRECTION_IN.bits()
            | RouteFlags::DIRECTION_OUT.bits(),
    );
}

/// Fixed-capacity inline label. Ordering is length-first: a longer label is
/// always greater, equal lengths compare bytewise.
#[derive(Clone, Copy)]
pub struct Label {
    len: u8,
    bytes: [u8; MAX_LABEL_BYTES],
}

impl Label {
    pub fn new(label: impl AsRef<[u8]>) -> Result<Self> {
        let src = label.as_ref();
        if src.is_empty() {
            return Err(Error::InvalidArg("empty label"));
        }
        if src.len() > MAX_LABEL_BYTES {
            return Err(Error::StringArgTooLong {
                len: src.len(),
                max: MAX_LABEL_BYTES,
            });
        }
        let mut bytes = [0u8; MAX_LABEL_BYTES];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            len: src.len() as u8,
            bytes,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the label into `buf`, returning the number of bytes written.
    pub fn copy_to(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.len();
        if buf.len() < n {
            return Err(Error::BufferTooSmall {
                needed: n,
                available: buf.len(),
            });
        }
        buf[..n].copy_from_slice(self.as_bytes());
        Ok(n)
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Label {}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        label_cmp(self.as_bytes(), other.as_bytes())
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_bounds() {
        assert_eq!(Label::new(""), Err(Error::InvalidArg("empty label")));
        let long = [b'a'; MAX_LABEL_BYTES + 1];
        assert_eq!(
            Label::new(long),
            Err(Error::StringArgTooLong {
                len: MAX_LABEL_BYTES + 1,
                max: MAX_LABEL_BYTES
            })
        );
        assert!(Label::new([b'a'; MAX_LABEL_BYTES]).is_ok());
    }

    #[test]
    fn longer_label_sorts_after() {
        let a = Label::new("zz").unwrap();
        let b = Label::new("aaa").unwrap();
        assert!(a < b);
        assert_eq!(Label::new("log").unwrap(), Label::new(b"log").unwrap());
    }

    #[test]
    fn copy_to_short_buffer() {
        let l = Label::new("block").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            l.copy_to(&mut buf),
            Err(Error::BufferTooSmall {
                needed: 5,
                available: 3
            })
        );
        let mut buf = [0u8; 8];
        assert_eq!(l.copy_to(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"block");
    }
}
