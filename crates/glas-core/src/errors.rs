use std::fmt;

use thiserror::Error;

pub const ERROR_TAG: &str = "\x1b[31m[ERROR]\x1b[0m";
pub const WARN_TAG: &str = "\x1b[33m[WARN]\x1b[0m";

/// True when `GLAS_DEBUG` is set; gates optional diagnostics.
pub fn debug_enabled() -> bool {
    std::env::var_os("GLAS_DEBUG").is_some()
}

/// The per-step error register. Bits accumulate monotonically within a
/// step; any non-zero mask prevents commit. `abort` clears every bit
/// except the unrecoverable ones.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorBits(u32);

impl ErrorBits {
    pub const NONE: ErrorBits = ErrorBits(0);
    pub const UNRECOVERABLE: ErrorBits = ErrorBits(1 << 0);
    pub const CONFLICT: ErrorBits = ErrorBits(1 << 1);
    pub const UNCREATED: ErrorBits = ErrorBits(1 << 2);
    pub const QUOTA: ErrorBits = ErrorBits(1 << 3);
    pub const CLIENT: ErrorBits = ErrorBits(1 << 4);
    pub const ERROR_OP: ErrorBits = ErrorBits(1 << 5);
    pub const LINEARITY: ErrorBits = ErrorBits(1 << 6);
    pub const DATA_SEALED: ErrorBits = ErrorBits(1 << 7);
    pub const NAME_UNDEF: ErrorBits = ErrorBits(1 << 8);
    pub const EPHEMERALITY: ErrorBits = ErrorBits(1 << 9);
    pub const ATOMICITY: ErrorBits = ErrorBits(1 << 10);
    pub const ASSERT: ErrorBits = ErrorBits(1 << 11);
    pub const DATA_TYPE: ErrorBits = ErrorBits(1 << 12);
    pub const DATA_QTY: ErrorBits = ErrorBits(1 << 13);
    pub const UNDERFLOW: ErrorBits = ErrorBits(1 << 14);
    pub const ARITY: ErrorBits = ErrorBits(1 << 15);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ErrorBits) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: ErrorBits) {
        self.0 |= other.0;
    }

    pub fn union(self, other: ErrorBits) -> ErrorBits {
        ErrorBits(self.0 | other.0)
    }

    /// The bits that survive an abort.
    pub fn retained_on_abort(self) -> ErrorBits {
        ErrorBits(self.0 & Self::UNRECOVERABLE.0)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn names(self) -> Vec<&'static str> {
        const TABLE: &[(ErrorBits, &str)] = &[
            (ErrorBits::UNRECOVERABLE, "unrecoverable"),
            (ErrorBits::CONFLICT, "conflict"),
            (ErrorBits::UNCREATED, "uncreated"),
            (ErrorBits::QUOTA, "quota"),
            (ErrorBits::CLIENT, "client"),
            (ErrorBits::ERROR_OP, "error-op"),
            (ErrorBits::LINEARITY, "linearity"),
            (ErrorBits::DATA_SEALED, "data-sealed"),
            (ErrorBits::NAME_UNDEF, "name-undef"),
            (ErrorBits::EPHEMERALITY, "ephemerality"),
            (ErrorBits::ATOMICITY, "atomicity"),
            (ErrorBits::ASSERT, "assert"),
            (ErrorBits::DATA_TYPE, "data-type"),
            (ErrorBits::DATA_QTY, "data-qty"),
            (ErrorBits::UNDERFLOW, "underflow"),
            (ErrorBits::ARITY, "arity"),
        ];
        TABLE
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Debug for ErrorBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorBits({})", self.names().join("|"))
    }
}

impl fmt::Display for ErrorBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "ok")
        } else {
            write!(f, "{}", self.names().join("|"))
        }
    }
}

impl std::ops::BitOr for ErrorBits {
    type Output = ErrorBits;
    fn bitor(self, rhs: ErrorBits) -> ErrorBits {
        self.union(rhs)
    }
}

/// Host-facing error type. Every variant maps onto one bit of the step
/// error register; operations that fail both return the error and mark
/// the owning thread's register.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GlasError {
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("uncreated: {0}")]
    Uncreated(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("operation error: {0}")]
    ErrorOp(String),

    #[error("linearity violation: {0}")]
    Linearity(String),

    #[error("sealed data: {0}")]
    Sealed(String),

    #[error("undefined name: {0}")]
    Undefined(String),

    #[error("ephemerality violation: {0}")]
    Ephemerality(String),

    #[error("atomicity violation: {0}")]
    Atomicity(String),

    #[error("assertion failed: {0}")]
    Assert(String),

    #[error("type mismatch: {0}")]
    DataType(String),

    #[error("insufficient data: {0}")]
    DataQty(String),

    #[error("underflow: {0}")]
    Underflow(String),

    #[error("arity violation: {0}")]
    Arity(String),
}

impl GlasError {
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        GlasError::Unrecoverable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GlasError::Conflict(msg.into())
    }

    pub fn uncreated(msg: impl Into<String>) -> Self {
        GlasError::Uncreated(msg.into())
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        GlasError::Quota(msg.into())
    }

    pub fn client(msg: impl Into<String>) -> Self {
        GlasError::Client(msg.into())
    }

    pub fn error_op(msg: impl Into<String>) -> Self {
        GlasError::ErrorOp(msg.into())
    }

    pub fn linearity(msg: impl Into<String>) -> Self {
        GlasError::Linearity(msg.into())
    }

    pub fn sealed(msg: impl Into<String>) -> Self {
        GlasError::Sealed(msg.into())
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        GlasError::Undefined(name.into())
    }

    pub fn ephemerality(msg: impl Into<String>) -> Self {
        GlasError::Ephemerality(msg.into())
    }

    pub fn atomicity(msg: impl Into<String>) -> Self {
        GlasError::Atomicity(msg.into())
    }

    pub fn assert(msg: impl Into<String>) -> Self {
        GlasError::Assert(msg.into())
    }

    pub fn data_type(msg: impl Into<String>) -> Self {
        GlasError::DataType(msg.into())
    }

    pub fn data_qty(msg: impl Into<String>) -> Self {
        GlasError::DataQty(msg.into())
    }

    pub fn underflow(msg: impl Into<String>) -> Self {
        GlasError::Underflow(msg.into())
    }

    pub fn arity(msg: impl Into<String>) -> Self {
        GlasError::Arity(msg.into())
    }

    /// The step-register bit this error contributes.
    pub fn bits(&self) -> ErrorBits {
        match self {
            GlasError::Unrecoverable(_) => ErrorBits::UNRECOVERABLE,
            GlasError::Conflict(_) => ErrorBits::CONFLICT,
            GlasError::Uncreated(_) => ErrorBits::UNCREATED,
            GlasError::Quota(_) => ErrorBits::QUOTA,
            GlasError::Client(_) => ErrorBits::CLIENT,
            GlasError::ErrorOp(_) => ErrorBits::ERROR_OP,
            GlasError::Linearity(_) => ErrorBits::LINEARITY,
            GlasError::Sealed(_) => ErrorBits::DATA_SEALED,
            GlasError::Undefined(_) => ErrorBits::NAME_UNDEF,
            GlasError::Ephemerality(_) => ErrorBits::EPHEMERALITY,
            GlasError::Atomicity(_) => ErrorBits::ATOMICITY,
            GlasError::Assert(_) => ErrorBits::ASSERT,
            GlasError::DataType(_) => ErrorBits::DATA_TYPE,
            GlasError::DataQty(_) => ErrorBits::DATA_QTY,
            GlasError::Underflow(_) => ErrorBits::UNDERFLOW,
            GlasError::Arity(_) => ErrorBits::ARITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_accumulate_and_abort_retains_unrecoverable() {
        let mut bits = ErrorBits::NONE;
        bits.insert(ErrorBits::CONFLICT);
        bits.insert(ErrorBits::UNRECOVERABLE);
        assert!(bits.contains(ErrorBits::CONFLICT));
        let kept = bits.retained_on_abort();
        assert!(kept.contains(ErrorBits::UNRECOVERABLE));
        assert!(!kept.contains(ErrorBits::CONFLICT));
    }

    #[test]
    fn error_maps_to_bit() {
        assert_eq!(
            GlasError::data_qty("queue empty").bits(),
            ErrorBits::DATA_QTY
        );
        assert_eq!(GlasError::linearity("copy").bits(), ErrorBits::LINEARITY);
    }
}
