//! Status codes for navigation queries
//!
//! Mirrors the classic high-level/detail split: one of SUCCESS, FAILURE or
//! IN_PROGRESS plus any number of detail bits.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryStatus: u32 {
        /// Operation failed
        const FAILURE = 1 << 31;
        /// Operation succeeded
        const SUCCESS = 1 << 30;
        /// Operation still in progress
        const IN_PROGRESS = 1 << 29;

        /// An input parameter was invalid
        const INVALID_PARAM = 1 << 3;
        /// Result buffer for the query was too small to store all results
        const BUFFER_TOO_SMALL = 1 << 4;
        /// Query ran out of nodes during search
        const OUT_OF_NODES = 1 << 5;
        /// Query did not reach the end location, returning best guess
        const PARTIAL_RESULT = 1 << 6;
    }
}

impl QueryStatus {
    /// Mask selecting the detail bits
    pub const DETAIL_MASK: u32 = 0x00ff_ffff;

    pub fn is_success(self) -> bool {
        self.contains(Self::SUCCESS)
    }

    pub fn is_failure(self) -> bool {
        self.contains(Self::FAILURE)
    }

    pub fn is_in_progress(self) -> bool {
        self.contains(Self::IN_PROGRESS)
    }

    /// True for a status that is neither empty nor in progress
    pub fn is_complete(self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_partial(self) -> bool {
        self.contains(Self::PARTIAL_RESULT)
    }

    /// Detail bits only
    pub fn detail(self) -> QueryStatus {
        QueryStatus::from_bits_truncate(self.bits() & Self::DETAIL_MASK)
    }

    pub fn failure_with(detail: QueryStatus) -> QueryStatus {
        QueryStatus::FAILURE | detail.detail()
    }

    pub fn success_with(detail: QueryStatus) -> QueryStatus {
        QueryStatus::SUCCESS | detail.detail()
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Success")?;
        } else if self.is_failure() {
            write!(f, "Failure")?;
        } else if self.is_in_progress() {
            write!(f, "In Progress")?;
        } else {
            write!(f, "Empty")?;
        }

        let mut details = Vec::new();
        if self.contains(Self::INVALID_PARAM) {
            details.push("Invalid Param");
        }
        if self.contains(Self::BUFFER_TOO_SMALL) {
            details.push("Buffer Too Small");
        }
        if self.contains(Self::OUT_OF_NODES) {
            details.push("Out of Nodes");
        }
        if self.contains(Self::PARTIAL_RESULT) {
            details.push("Partial Result");
        }
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_bits_survive_high_level_change() {
        let status = QueryStatus::IN_PROGRESS | QueryStatus::OUT_OF_NODES;
        let done = QueryStatus::success_with(status);
        assert!(done.is_success());
        assert!(!done.is_in_progress());
        assert!(done.contains(QueryStatus::OUT_OF_NODES));
        assert_eq!(done.detail(), QueryStatus::OUT_OF_NODES);
    }

    #[test]
    fn display_lists_details() {
        let status = QueryStatus::SUCCESS | QueryStatus::PARTIAL_RESULT;
        assert_eq!(status.to_string(), "Success (Partial Result)");
        assert_eq!(QueryStatus::empty().to_string(), "Empty");
        assert!(!QueryStatus::empty().is_complete());
    }
}
