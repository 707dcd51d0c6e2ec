//! IRC numeric replies used by the plugin suite

use crate::{Message, MessageType};

/// Numeric reply codes the plugins send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NumericReply {
    // Errors
    ErrNoSuchServer = 402,
    ErrNeedMoreParams = 461,
    ErrCannotDoCommand = 972,

    // SASL (IRCv3)
    RplLoggedIn = 900,
    RplSaslSuccess = 903,
    ErrSaslFail = 904,
    ErrSaslTooLong = 905,
    ErrSaslAborted = 906,
    RplSaslMechs = 908,
}

impl NumericReply {
    /// Numeric code
    pub fn numeric_code(&self) -> u16 {
        *self as u16
    }

    /// Zero-padded wire form of the code
    pub fn code(&self) -> String {
        format!("{:03}", self.numeric_code())
    }

    /// Build a numeric reply message for a target
    pub fn reply(&self, target: &str, params: Vec<String>) -> Message {
        let mut all_params = vec![target.to_string()];
        all_params.extend(params);
        Message::new(MessageType::Custom(self.code()), all_params)
    }
}
