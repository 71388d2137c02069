//! Error taxonomy and cancellation for support generation.
//!
//! Errors local to one element or one layer are handled in place (retry with a
//! polyline widening, fall back to the error strategy, delete the element).
//! Only two conditions abort the whole run: a coordinate leaving the range the
//! polygon engine is trusted with, and cancellation.

use crate::geometry::Point;
use crate::{Coord, MAX_COORD};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by tree support generation.
#[derive(Debug, Error)]
pub enum TreeSupportError {
    /// A point left the signed coordinate range the polygon engine supports.
    #[error("coordinate ({0}, {1}) outside the supported range")]
    CoordinateOverflow(Coord, Coord),

    /// The run was cancelled through its [`CancellationToken`].
    #[error("support generation cancelled")]
    Cancelled,
}

/// Shared cancellation probe, polled at layer boundaries and major loop steps.
///
/// The default token never cancels, so the pipeline compiles and runs with the
/// collaborator stubbed out.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All in-progress work unwinds at its next probe.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Probe the token, failing with [`TreeSupportError::Cancelled`] if set.
    pub fn check(&self) -> Result<(), TreeSupportError> {
        if self.is_cancelled() {
            Err(TreeSupportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Validate that a point is within the coordinate range of the polygon engine.
pub fn validate_range(p: Point) -> Result<(), TreeSupportError> {
    if p.x.abs() > MAX_COORD || p.y.abs() > MAX_COORD {
        Err(TreeSupportError::CoordinateOverflow(p.x, p.y))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(TreeSupportError::Cancelled)));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(Point::new(0, 0)).is_ok());
        assert!(validate_range(Point::new(MAX_COORD, -MAX_COORD)).is_ok());
        assert!(validate_range(Point::new(MAX_COORD + 1, 0)).is_err());
    }
}
