//! Error types for the fabric completion core.

use thiserror::Error;

use crate::buffer::BufferId;

/// Result type alias for fabric core operations.
pub type FabricResult<T> = Result<T, FabricError>;

/// Error variants for fabric core operations.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Growing the buffer event queue failed.
    #[error("out of memory: cannot grow event queue to {requested} entries (limit {limit})")]
    OutOfMemory {
        /// Queue capacity that was requested.
        requested: usize,
        /// Configured or allocator-imposed ceiling.
        limit: usize,
    },

    /// A bulk transfer descriptor or wire address failed validation.
    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor {
        /// Description of the failed check.
        reason: String,
    },

    /// An endpoint address string could not be parsed.
    #[error("invalid endpoint address {addr:?}: {reason}")]
    InvalidAddress {
        /// The offending address string.
        addr: String,
        /// Description of the parse failure.
        reason: String,
    },

    /// Another started endpoint already owns this address.
    #[error("endpoint address already in use: {addr}")]
    AddressInUse {
        /// The conflicting address.
        addr: String,
    },

    /// No free transfer machine identifier is left for dynamic assignment.
    #[error("no free transfer machine identifier available")]
    TmidExhausted,

    /// The wait deadline passed before any event became available.
    #[error("timed out waiting for buffer events")]
    Timeout,

    /// The provisioning discipline was broken; the endpoint is unusable.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// The buffer already has an operation in flight.
    #[error("buffer {buffer_id} already has an operation in flight")]
    BufferBusy {
        /// The busy buffer.
        buffer_id: BufferId,
    },

    /// The buffer has no operation in flight on this endpoint.
    #[error("buffer {buffer_id} is not queued")]
    BufferNotQueued {
        /// The idle buffer.
        buffer_id: BufferId,
    },

    /// Operation arguments are inconsistent with the buffer.
    #[error("invalid buffer operation: {reason}")]
    InvalidBuffer {
        /// Description of the inconsistency.
        reason: String,
    },

    /// The endpoint is stopped or has failed.
    #[error("endpoint is stopped")]
    EndpointStopped,

    /// The endpoint still has outstanding operations.
    #[error("endpoint has {outstanding} outstanding operations")]
    EndpointBusy {
        /// Number of buffers still in flight.
        outstanding: usize,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the invalid setting.
        reason: String,
    },

    /// The underlying fabric rejected an operation.
    #[error("fabric error: {reason}")]
    Fabric {
        /// Description reported by the fabric.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// Returns true for the expected, non-failure outcome of a timed wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FabricError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_result_alias() {
        let ok: FabricResult<u32> = Ok(7);
        assert!(ok.is_ok());

        let err: FabricResult<u32> = Err(FabricError::TmidExhausted);
        assert!(err.is_err());
    }

    #[test]
    fn test_out_of_memory_message() {
        let err = FabricError::OutOfMemory {
            requested: 17,
            limit: 16,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: cannot grow event queue to 17 entries (limit 16)"
        );
    }

    #[test]
    fn test_invalid_address_message() {
        let err = FabricError::InvalidAddress {
            addr: "notnid:1:2:3".to_string(),
            reason: "missing network".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("notnid:1:2:3"));
        assert!(msg.contains("missing network"));
    }

    #[test]
    fn test_buffer_busy_message() {
        let err = FabricError::BufferBusy {
            buffer_id: BufferId(42),
        };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_timeout_is_timeout() {
        assert!(FabricError::Timeout.is_timeout());
        assert!(!FabricError::EndpointStopped.is_timeout());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::Other, "spawn failed");
        let err: FabricError = std_err.into();
        assert!(matches!(err, FabricError::Io(_)));
    }
}
