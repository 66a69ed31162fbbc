use std::borrow::Cow;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to tag errors with information that classifies them.
///
/// The msg is the developer-facing description carried with the error.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg TabletDropped
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    /// Eg "Tablet 4a6f was deleted while a backfill chunk was in flight"
    pub msg: Cow<'static, str>,
}

/// Classification of remote-call and catalog failures. Every error that
/// crosses a task boundary is resolved into one of these before any
/// coordination logic sees it; the coordinator never inspects raw transport
/// errors.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request itself was malformed. Never retried.
    BadRequest,

    /// Timeout, leader movement, or general unavailability. Retried with
    /// backoff by the task layer and never surfaced past it.
    Unavailable,
    /// The tablet no longer exists (table dropped or repartitioned). Never
    /// retried.
    TabletNotFound,
    /// The requested read timestamp can no longer be served by the tablet.
    /// Retrying at the same timestamp cannot succeed.
    SnapshotTooOld,
    /// A compare-and-set against the catalog observed a schema version other
    /// than the expected one: a concurrent alter superseded this operation.
    VersionMismatch,
    /// The operation was cancelled from the outside.
    Aborted,

    /// A worker or collaborator violated its contract.
    Internal,
}

impl ErrorMetadata {
    /// Malformed request.
    ///
    /// The short_msg should be CapitalCamelCase describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Transient failure: timeout, leader moved, service overloaded. Safe to
    /// retry with backoff.
    pub fn unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The tablet is gone. Retrying cannot succeed; the caller must abandon
    /// all remaining work against this tablet.
    pub fn tablet_not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::TabletNotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The read timestamp is below the tablet's retention horizon. Retrying
    /// at the same timestamp cannot succeed.
    pub fn snapshot_too_old(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::SnapshotTooOld,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The persisted schema version did not match the expected one. A
    /// concurrent alter has acted; the caller's intent is superseded and the
    /// write was not applied.
    pub fn version_mismatch(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::VersionMismatch,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The surrounding operation was cancelled.
    pub fn aborted(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Aborted,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A collaborator broke its contract (e.g. a worker answered a safe-time
    /// probe with a timestamp below the requested cutoff).
    pub fn internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == ErrorCode::Unavailable
    }

    pub fn is_tablet_not_found(&self) -> bool {
        self.code == ErrorCode::TabletNotFound
    }

    pub fn is_snapshot_too_old(&self) -> bool {
        self.code == ErrorCode::SnapshotTooOld
    }

    pub fn is_version_mismatch(&self) -> bool {
        self.code == ErrorCode::VersionMismatch
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }
}

impl ErrorCode {
    /// Whether the task layer may retry an error with this code at all.
    /// Unclassified errors are treated as retriable too; the fail-fast set
    /// below is the exhaustive list of codes that can never be fixed by
    /// trying again.
    pub fn is_retriable(&self) -> bool {
        match self {
            ErrorCode::Unavailable | ErrorCode::Internal => true,
            ErrorCode::BadRequest
            | ErrorCode::TabletNotFound
            | ErrorCode::SnapshotTooOld
            | ErrorCode::VersionMismatch
            | ErrorCode::Aborted => false,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_unavailable(&self) -> bool;
    fn is_tablet_not_found(&self) -> bool;
    fn is_snapshot_too_old(&self) -> bool;
    fn is_version_mismatch(&self) -> bool;
    fn is_aborted(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    /// Whether retrying could ever help. See [`ErrorCode::is_retriable`].
    fn is_retriable(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as Unavailable
    fn is_unavailable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_unavailable();
        }
        false
    }

    /// Returns true if error is tagged as TabletNotFound
    fn is_tablet_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_tablet_not_found();
        }
        false
    }

    /// Returns true if error is tagged as SnapshotTooOld
    fn is_snapshot_too_old(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_snapshot_too_old();
        }
        false
    }

    /// Returns true if error is tagged as VersionMismatch
    fn is_version_mismatch(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_version_mismatch();
        }
        false
    }

    /// Returns true if error is tagged as Aborted
    fn is_aborted(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_aborted();
        }
        false
    }

    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    fn is_retriable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code.is_retriable();
        }
        // Untagged errors are almost always transport-level; treat them the
        // way the taxonomy treats general unavailability.
        true
    }

    /// If there's an ErrorMetadata in the chain, returns its short_msg.
    /// Otherwise returns "InternalError".
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        "InternalError"
    }

    /// If there's an ErrorMetadata in the chain, returns its msg. Otherwise
    /// renders the outermost error.
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        "Internal error"
    }
}
