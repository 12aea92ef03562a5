//! Per-call API version negotiation.

use crate::types::Error;

/// Outcome of a failed negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMismatch {
    /// Client version below the minimum supported one.
    ClientTooOld { client: u32, min: u32, current: u32 },
    /// Client version above the current one.
    ServerTooOld { client: u32, current: u32 },
}

impl From<VersionMismatch> for Error {
    fn from(mismatch: VersionMismatch) -> Self {
        match mismatch {
            VersionMismatch::ClientTooOld { client, min, current } => {
                Error::ClientTooOld { client, min, current }
            }
            VersionMismatch::ServerTooOld { client, current } => Error::ServerTooOld { client, current },
        }
    }
}

/// Check a client-declared version against the server `[min, current]` range.
///
/// Version 0 means "unknown" and is rejected unless `min` is 0 as well.
pub fn negotiate(min: u32, current: u32, client: u32) -> Result<(), VersionMismatch> {
    if client < min {
        Err(VersionMismatch::ClientTooOld { client, min, current })
    } else if client > current {
        Err(VersionMismatch::ServerTooOld { client, current })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;
    use proptest::prelude::*;

    #[test]
    fn test_unknown_version() {
        assert_eq!(
            negotiate(1, 3, 0),
            Err(VersionMismatch::ClientTooOld { client: 0, min: 1, current: 3 })
        );
        assert!(negotiate(0, 3, 0).is_ok());
    }

    #[test]
    fn test_error_codes() {
        let err: Error = negotiate(2, 3, 1).unwrap_err().into();
        assert_eq!(err.code(), ResultCode::ErrorApiClientTooOld);
        let err: Error = negotiate(2, 3, 4).unwrap_err().into();
        assert_eq!(err.code(), ResultCode::ErrorApiServerTooOld);
    }

    proptest! {
        #[test]
        fn prop_negotiation_partitions_versions(min in 0u32..50, span in 0u32..50, client in 0u32..120) {
            let current = min + span;
            match negotiate(min, current, client) {
                Ok(()) => prop_assert!(min <= client && client <= current),
                Err(VersionMismatch::ClientTooOld { .. }) => prop_assert!(client < min),
                Err(VersionMismatch::ServerTooOld { .. }) => prop_assert!(client > current),
            }
        }
    }
}
