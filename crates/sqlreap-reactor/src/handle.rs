//! Handles and interest sets.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};

use mio::Token;

/// An OS socket descriptor the loop can watch.
///
/// Handles are plain descriptors; the loop never owns or closes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(RawFd);

impl Handle {
    pub const fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub const fn raw(self) -> RawFd {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0 as RawFd)
    }
}

impl From<RawFd> for Handle {
    fn from(fd: RawFd) -> Self {
        Self(fd)
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Which readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interest {
    #[default]
    Readable,
    Writable,
    Both,
}

impl From<Interest> for mio::Interest {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
            Interest::Both => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let handle = Handle::new(17);
        assert_eq!(handle.token(), Token(17));
        assert_eq!(Handle::from_token(handle.token()), handle);
        assert_eq!(Handle::from(17).as_raw_fd(), 17);
        assert_eq!(handle.to_string(), "fd 17");
    }

    #[test]
    fn test_interest_mapping() {
        assert_eq!(Interest::default(), Interest::Readable);
        assert!(mio::Interest::from(Interest::Readable).is_readable());
        assert!(!mio::Interest::from(Interest::Readable).is_writable());
        let both = mio::Interest::from(Interest::Both);
        assert!(both.is_readable() && both.is_writable());
    }
}
