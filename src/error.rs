//! Closed error taxonomy shared by every component.
//!
//! `kind` is the only field matched on by calling code; `detail` exists for
//! `tracing` output and is never compared.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    InvalidSocket,
    InvalidAddress,
    WouldBlock,
    InProgress,
    Already,
    Timeout,
    NetUnreach,
    HostUnreach,
    ConnRefused,
    UnsupportedBackend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Generic => "generic",
            ErrorKind::InvalidSocket => "invalid socket",
            ErrorKind::InvalidAddress => "invalid address",
            ErrorKind::WouldBlock => "would block",
            ErrorKind::InProgress => "in progress",
            ErrorKind::Already => "already in progress",
            ErrorKind::Timeout => "timed out",
            ErrorKind::NetUnreach => "network unreachable",
            ErrorKind::HostUnreach => "host unreachable",
            ErrorKind::ConnRefused => "connection refused",
            ErrorKind::UnsupportedBackend => "unsupported backend",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_address(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidAddress, detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Error {}

/// Maps a raw OS errno to the closed `ErrorKind` taxonomy per spec §7.
fn kind_from_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::EAGAIN | libc::EWOULDBLOCK | libc::EINTR => ErrorKind::WouldBlock,
        libc::EINPROGRESS => ErrorKind::InProgress,
        libc::EALREADY => ErrorKind::Already,
        libc::EBADF | libc::ENOTSOCK => ErrorKind::InvalidSocket,
        libc::ETIMEDOUT => ErrorKind::Timeout,
        libc::ENETUNREACH => ErrorKind::NetUnreach,
        libc::EHOSTUNREACH => ErrorKind::HostUnreach,
        libc::ECONNREFUSED => ErrorKind::ConnRefused,
        _ => ErrorKind::Generic,
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.raw_os_error() {
            Some(errno) => kind_from_errno(errno),
            None => match e.kind() {
                std::io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Generic,
            },
        };
        Error::new(kind, e.to_string())
    }
}

/// SOCKS5 reply code for a dial failure, per spec §4.5's tie table.
pub fn socks_reply_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::ConnRefused => 0x05,
        ErrorKind::NetUnreach => 0x03,
        ErrorKind::HostUnreach => 0x04,
        ErrorKind::Timeout => 0x06,
        _ => 0x01,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_errnos() {
        assert_eq!(kind_from_errno(libc::EAGAIN), ErrorKind::WouldBlock);
        assert_eq!(kind_from_errno(libc::EWOULDBLOCK), ErrorKind::WouldBlock);
        assert_eq!(kind_from_errno(libc::EINPROGRESS), ErrorKind::InProgress);
        assert_eq!(kind_from_errno(libc::EALREADY), ErrorKind::Already);
        assert_eq!(kind_from_errno(libc::EBADF), ErrorKind::InvalidSocket);
        assert_eq!(kind_from_errno(libc::ENOTSOCK), ErrorKind::InvalidSocket);
        assert_eq!(kind_from_errno(libc::ETIMEDOUT), ErrorKind::Timeout);
        assert_eq!(kind_from_errno(libc::ENETUNREACH), ErrorKind::NetUnreach);
        assert_eq!(kind_from_errno(libc::EHOSTUNREACH), ErrorKind::HostUnreach);
        assert_eq!(kind_from_errno(libc::ECONNREFUSED), ErrorKind::ConnRefused);
    }

    #[test]
    fn unknown_errno_is_generic() {
        assert_eq!(kind_from_errno(libc::EPERM), ErrorKind::Generic);
    }

    #[test]
    fn reply_code_mapping() {
        assert_eq!(socks_reply_code(ErrorKind::ConnRefused), 0x05);
        assert_eq!(socks_reply_code(ErrorKind::NetUnreach), 0x03);
        assert_eq!(socks_reply_code(ErrorKind::HostUnreach), 0x04);
        assert_eq!(socks_reply_code(ErrorKind::Timeout), 0x06);
        assert_eq!(socks_reply_code(ErrorKind::Generic), 0x01);
        assert_eq!(socks_reply_code(ErrorKind::InvalidSocket), 0x01);
    }

    #[test]
    fn detail_is_not_part_of_equality() {
        let kind = ErrorKind::ConnRefused;
        let a = Error::new(kind, "peer closed");
        let b = Error::new(kind, "totally different text");
        assert_eq!(a.kind, b.kind);
    }
}
