//! Error codes shared by every layer of the stack.
//!
//! The kernel substrate, the IP plumbing and the protocol layers all report
//! failures through the same flat enumeration, so a code produced deep in the
//! substrate (for example `AddressUnreachable`) can be stored as a socket's
//! sticky error or answered on the wire without translation.

use thiserror::Error;

/// Every failure the stack can report
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("out of memory")]
    OutOfMemory,
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("queue full")]
    QueueFull,
    #[error("queue empty")]
    QueueEmpty,
    #[error("yielded to a blocked context")]
    YieldedToBlocked,
    #[error("context finished")]
    ContextFinished,
    #[error("context yielded back")]
    ContextYieldedBack,
    #[error("does not exist")]
    DoesNotExist,
    #[error("not implemented")]
    NotImplemented,
    #[error("no route to host")]
    NoRouteToHost,
    #[error("header out of order")]
    HeaderOutOfOrder,
    #[error("wrong protocol")]
    WrongProtocol,
    #[error("no destination port")]
    NoDestPort,
    #[error("port already bound")]
    PortAlreadyBound,
    #[error("all anonymous ports bound")]
    AllAnonPortsBound,
    #[error("stopped for another socket's packet")]
    StoppedForOtherSocket,
    #[error("packet filtered out")]
    PacketFilteredOut,
    #[error("option not supported")]
    OptionNotSupported,
    #[error("routing headers not supported")]
    RoutingNotSupported,
    #[error("fragments not supported")]
    FragmentsNotSupported,
    #[error("hop limit exceeded")]
    HopLimitExceeded,
    #[error("interface already registered")]
    IfaceAlreadyRegistered,
    #[error("interface not registered")]
    IfaceNotRegistered,
    #[error("socket already in use")]
    SocketAlreadyInUse,
    #[error("socket not listening")]
    SocketNotListening,
    #[error("socket not bound")]
    SocketNotBound,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("destination unreachable")]
    DestinationUnreachable,
    #[error("wrong protocol version")]
    WrongProtocolVersion,
    #[error("bad protocol command")]
    BadProtocolCmd,
    #[error("packet too short")]
    PacketTooShort,
    #[error("tasks stalled")]
    Stalled,
    #[error("unknown error")]
    UnknownError,
}

impl Error {
    /// Codes that only mean "nothing for you yet"
    ///
    /// Blocking loops swallow these and go round again after yielding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::QueueEmpty
                | Error::StoppedForOtherSocket
                | Error::PacketFilteredOut
                | Error::ContextYieldedBack
        )
    }

    /// Stable numeric code, as carried in timer replies
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidArg => 1,
            Error::OutOfMemory => 2,
            Error::AddressUnreachable => 3,
            Error::QueueFull => 4,
            Error::QueueEmpty => 5,
            Error::YieldedToBlocked => 6,
            Error::ContextFinished => 7,
            Error::ContextYieldedBack => 8,
            Error::DoesNotExist => 9,
            Error::NotImplemented => 10,
            Error::NoRouteToHost => 11,
            Error::HeaderOutOfOrder => 12,
            Error::WrongProtocol => 13,
            Error::NoDestPort => 14,
            Error::PortAlreadyBound => 15,
            Error::AllAnonPortsBound => 16,
            Error::StoppedForOtherSocket => 17,
            Error::PacketFilteredOut => 18,
            Error::OptionNotSupported => 19,
            Error::RoutingNotSupported => 20,
            Error::FragmentsNotSupported => 21,
            Error::HopLimitExceeded => 22,
            Error::IfaceAlreadyRegistered => 23,
            Error::IfaceNotRegistered => 24,
            Error::SocketAlreadyInUse => 25,
            Error::SocketNotListening => 26,
            Error::SocketNotBound => 27,
            Error::ConnectionClosed => 28,
            Error::ConnectionResetByPeer => 29,
            Error::DestinationUnreachable => 30,
            Error::WrongProtocolVersion => 31,
            Error::BadProtocolCmd => 32,
            Error::PacketTooShort => 33,
            Error::UnknownError => 34,
            Error::Stalled => 35,
        }
    }

    /// Inverse of [`Error::code`]; `0` means success and maps to `None`
    pub fn from_code(code: u32) -> Option<Self> {
        let error = match code {
            0 => return None,
            1 => Error::InvalidArg,
            2 => Error::OutOfMemory,
            3 => Error::AddressUnreachable,
            4 => Error::QueueFull,
            5 => Error::QueueEmpty,
            6 => Error::YieldedToBlocked,
            7 => Error::ContextFinished,
            8 => Error::ContextYieldedBack,
            9 => Error::DoesNotExist,
            10 => Error::NotImplemented,
            11 => Error::NoRouteToHost,
            12 => Error::HeaderOutOfOrder,
            13 => Error::WrongProtocol,
            14 => Error::NoDestPort,
            15 => Error::PortAlreadyBound,
            16 => Error::AllAnonPortsBound,
            17 => Error::StoppedForOtherSocket,
            18 => Error::PacketFilteredOut,
            19 => Error::OptionNotSupported,
            20 => Error::RoutingNotSupported,
            21 => Error::FragmentsNotSupported,
            22 => Error::HopLimitExceeded,
            23 => Error::IfaceAlreadyRegistered,
            24 => Error::IfaceNotRegistered,
            25 => Error::SocketAlreadyInUse,
            26 => Error::SocketNotListening,
            27 => Error::SocketNotBound,
            28 => Error::ConnectionClosed,
            29 => Error::ConnectionResetByPeer,
            30 => Error::DestinationUnreachable,
            31 => Error::WrongProtocolVersion,
            32 => Error::BadProtocolCmd,
            33 => Error::PacketTooShort,
            35 => Error::Stalled,
            _ => Error::UnknownError,
        };
        Some(error)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for error in [
            Error::InvalidArg,
            Error::NoRouteToHost,
            Error::WrongProtocolVersion,
            Error::PacketTooShort,
        ] {
            assert_eq!(Error::from_code(error.code()), Some(error));
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(9999), Some(Error::UnknownError));
    }

    #[test]
    fn test_transient_codes() {
        assert!(Error::QueueEmpty.is_transient());
        assert!(Error::PacketFilteredOut.is_transient());
        assert!(!Error::ConnectionResetByPeer.is_transient());
    }
}
