use core::fmt;

/// TCP Connection State (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection; a fresh or deleted socket
    Closed,
    /// Waiting for connection request
    Listen,
    /// Sent SYN, waiting for SYN-ACK
    SynSent,
    /// Received SYN, sent SYN-ACK, waiting for ACK
    SynReceived,
    /// Connection established, data transfer
    Established,
    /// Sent FIN, waiting for ACK
    FinWait1,
    /// Received ACK of FIN, waiting for FIN
    FinWait2,
    /// Received FIN, waiting for the local close
    CloseWait,
    /// Both sides sent FIN at once; waiting for the ACK of ours
    Closing,
    /// Sent FIN after receiving FIN, waiting for ACK
    LastAck,
    /// Both FINs acknowledged, waiting for stray segments to die out
    TimeWait,
}

impl TcpState {
    /// Data can still be sent and received
    pub fn is_open(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Inbound data is still delivered to the receive queue
    pub(super) fn accepts_data(self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// Our FIN goes out with the next transmission
    pub(super) fn sends_fin(self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynReceived => "SYN-RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST-ACK",
            TcpState::TimeWait => "TIME-WAIT",
        };
        f.write_str(name)
    }
}
