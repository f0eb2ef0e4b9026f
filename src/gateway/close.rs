//! Close code classification.
//!
//! The retry decision for every close code lives in this one table; the
//! reconnect loop never inspects individual codes itself.

/// authentication failed
pub const AUTHENTICATION_FAILED: u16 = 4004;
/// gateway rate limit exceeded
pub const RATE_LIMITED: u16 = 4008;
/// invalid shard id/count pair sent in identify
pub const INVALID_SHARD: u16 = 4010;
/// the account requires sharding but identify carried none
pub const SHARDING_REQUIRED: u16 = 4011;

/// What the reconnect loop may do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// reconnect (resume or identify) is worth attempting
    Retryable,
    /// retrying cannot succeed, the connection must terminate
    Fatal,
}

/// Classify a close code, absent codes included.
pub fn classify(code: Option<u16>) -> CloseBehavior {
    match code {
        Some(AUTHENTICATION_FAILED)
        | Some(RATE_LIMITED)
        | Some(INVALID_SHARD)
        | Some(SHARDING_REQUIRED) => CloseBehavior::Fatal,
        _ => CloseBehavior::Retryable,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fatal_codes() {
        for code in [
            AUTHENTICATION_FAILED,
            RATE_LIMITED,
            INVALID_SHARD,
            SHARDING_REQUIRED,
        ] {
            assert_eq!(classify(Some(code)), CloseBehavior::Fatal);
        }
    }

    #[test]
    fn test_other_codes_are_retryable() {
        for code in [1000, 1001, 1006, 4000, 4003, 4007, 4009] {
            assert_eq!(classify(Some(code)), CloseBehavior::Retryable);
        }
    }

    #[test]
    fn test_absent_code_is_retryable() {
        assert_eq!(classify(None), CloseBehavior::Retryable);
    }
}
