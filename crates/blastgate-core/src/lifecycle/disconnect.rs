//! Classification of connection closures.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closures after which the stored credentials are useless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalReason {
    /// The account removed this linked device.
    LoggedOut,
    /// The stored session could not be decrypted or is corrupt.
    BadSession,
    /// Another session opened with the same credentials.
    ConnectionReplaced,
    /// The account and the stored session disagree on multi-device state.
    MultideviceMismatch,
}

impl TerminalReason {
    /// Status code the transport reports for this reason.
    pub fn code(&self) -> u16 {
        match self {
            TerminalReason::LoggedOut => 401,
            TerminalReason::MultideviceMismatch => 411,
            TerminalReason::ConnectionReplaced => 440,
            TerminalReason::BadSession => 500,
        }
    }

    /// Reason string used in outbound status notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::LoggedOut => "loggedOut",
            TerminalReason::BadSession => "badSession",
            TerminalReason::ConnectionReplaced => "connectionReplaced",
            TerminalReason::MultideviceMismatch => "multideviceMismatch",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Why a session closed, as far as the lifecycle manager cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    Terminal(TerminalReason),
    /// Anything else, including codes this build does not know about.
    Transient { code: u16 },
}

impl DisconnectReason {
    /// Classifies a transport status code.  Unknown codes (and `0`, used when
    /// no code was reported) are transient.
    pub fn classify(code: u16) -> Self {
        match code {
            401 => DisconnectReason::Terminal(TerminalReason::LoggedOut),
            411 => DisconnectReason::Terminal(TerminalReason::MultideviceMismatch),
            440 => DisconnectReason::Terminal(TerminalReason::ConnectionReplaced),
            500 => DisconnectReason::Terminal(TerminalReason::BadSession),
            other => DisconnectReason::Transient { code: other },
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::Terminal(reason) => reason.code(),
            DisconnectReason::Transient { code } => *code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::Terminal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_codes() {
        for (code, reason) in [
            (401, TerminalReason::LoggedOut),
            (411, TerminalReason::MultideviceMismatch),
            (440, TerminalReason::ConnectionReplaced),
            (500, TerminalReason::BadSession),
        ] {
            // Act
            let classified = DisconnectReason::classify(code);

            // Assert
            assert_eq!(classified, DisconnectReason::Terminal(reason));
            assert_eq!(classified.code(), code);
        }
    }

    #[test]
    fn test_known_and_unknown_transient_codes() {
        for code in [0, 408, 428, 503, 515, 999] {
            let classified = DisconnectReason::classify(code);
            assert!(!classified.is_terminal(), "code {code} must be transient");
            assert_eq!(classified.code(), code);
        }
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(TerminalReason::LoggedOut.as_str(), "loggedOut");
        assert_eq!(
            TerminalReason::ConnectionReplaced.to_string(),
            "connectionReplaced (440)"
        );
    }
}
