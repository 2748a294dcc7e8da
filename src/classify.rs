//! Error classifier: raw transport failures in, [`ClassifiedError`] out.
//!
//! The mapping is total and pure. Every [`RawError`] maps to exactly one [`ErrorKind`]:
//!
//! | raw failure                                  | kind            | recoverable |
//! |----------------------------------------------|-----------------|-------------|
//! | timeout, abort, 408, deadline exceeded       | `timeout`       | yes         |
//! | DNS / refused / reset / opaque, no response  | `network`       | yes         |
//! | 400, 409, 422, other 4xx, malformed          | `validation`    | no          |
//! | 401 / unauthenticated                        | `authorization` | yes         |
//! | 403 / permission denied                      | `authorization` | no          |
//! | 429 / resource exhausted                     | `service`       | yes (60s)   |
//! | 5xx / internal / unavailable                 | `service`       | yes         |
//! | already classified                           | unchanged       | unchanged   |

use crate::error::{
    ClassifiedError, ConnectionFailure, ErrorContext, ErrorKind, RawError, RpcCode,
};
use serde_json::Value;

/// Retry hint attached to rate-limit errors that carry no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_RETRY_AFTER_SECS: u64 = 60;

/// Retry hint attached to service errors that carry no `Retry-After`.
pub const DEFAULT_SERVICE_RETRY_AFTER_SECS: u64 = 5;

/// Classify a raw failure, folding `context` into the error details.
pub fn classify(raw: &RawError, context: Option<&ErrorContext>) -> ClassifiedError {
    let classified = match raw {
        RawError::Classified(existing) => return existing.clone(),
        RawError::Status { status, message, retry_after, details } => {
            let mut err = classify_status(*status, message, *retry_after);
            if let Some(details) = details {
                for (k, v) in details {
                    err = err.with_detail(k.clone(), v.clone());
                }
            }
            err
        }
        RawError::Rpc { code, message, retry_after } => classify_rpc(*code, message, *retry_after),
        RawError::Timeout(message) => {
            ClassifiedError::new(ErrorKind::Timeout, "TIMEOUT", message.clone(), true)
        }
        RawError::Aborted => {
            ClassifiedError::new(ErrorKind::Timeout, "ABORTED", "request aborted", true)
        }
        RawError::Connection { kind, message } => {
            let code = match kind {
                ConnectionFailure::Dns => "DNS_FAILURE",
                ConnectionFailure::Refused => "CONNECTION_REFUSED",
                ConnectionFailure::Reset => "CONNECTION_RESET",
                ConnectionFailure::Other => "NETWORK_ERROR",
            };
            ClassifiedError::new(ErrorKind::Network, code, message.clone(), true)
        }
        RawError::Malformed(message) => {
            ClassifiedError::new(ErrorKind::Validation, "MALFORMED", message.clone(), false)
        }
        RawError::Other(message) => {
            ClassifiedError::new(ErrorKind::Network, "NETWORK_ERROR", message.clone(), true)
        }
    };
    apply_context(classified, context)
}

/// Shorthand for anything convertible into a [`RawError`].
pub fn classify_into<E: Into<RawError>>(err: E, context: Option<&ErrorContext>) -> ClassifiedError {
    classify(&err.into(), context)
}

fn classify_status(status: u16, message: &str, retry_after: Option<u64>) -> ClassifiedError {
    let code = format!("HTTP_{status}");
    match status {
        408 => ClassifiedError::new(ErrorKind::Timeout, code, message, true),
        401 => ClassifiedError::new(ErrorKind::Authorization, code, message, true),
        403 => ClassifiedError::new(ErrorKind::Authorization, code, message, false),
        429 => ClassifiedError::new(ErrorKind::Service, "RATE_LIMITED", message, true)
            .with_retry_after(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_RETRY_AFTER_SECS))
            .with_detail("status", status),
        400..=499 => ClassifiedError::new(ErrorKind::Validation, code, message, false),
        500..=599 => ClassifiedError::new(ErrorKind::Service, code, message, true)
            .with_retry_after(retry_after.unwrap_or(DEFAULT_SERVICE_RETRY_AFTER_SECS)),
        // Anything else reported as a failure is a protocol surprise, not something retry fixes.
        _ => ClassifiedError::new(ErrorKind::Service, code, message, false),
    }
}

fn classify_rpc(code: RpcCode, message: &str, retry_after: Option<u64>) -> ClassifiedError {
    let name = format!("RPC_{}", rpc_name(code));
    match code {
        RpcCode::DeadlineExceeded | RpcCode::Cancelled => {
            ClassifiedError::new(ErrorKind::Timeout, name, message, true)
        }
        RpcCode::Unauthenticated => {
            ClassifiedError::new(ErrorKind::Authorization, name, message, true)
        }
        RpcCode::PermissionDenied => {
            ClassifiedError::new(ErrorKind::Authorization, name, message, false)
        }
        RpcCode::InvalidArgument
        | RpcCode::NotFound
        | RpcCode::AlreadyExists
        | RpcCode::FailedPrecondition
        | RpcCode::Aborted
        | RpcCode::OutOfRange
        | RpcCode::Unimplemented => {
            ClassifiedError::new(ErrorKind::Validation, name, message, false)
        }
        RpcCode::ResourceExhausted => ClassifiedError::new(ErrorKind::Service, name, message, true)
            .with_retry_after(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_RETRY_AFTER_SECS)),
        RpcCode::Internal | RpcCode::Unavailable | RpcCode::DataLoss | RpcCode::Unknown => {
            ClassifiedError::new(ErrorKind::Service, name, message, true)
                .with_retry_after(retry_after.unwrap_or(DEFAULT_SERVICE_RETRY_AFTER_SECS))
        }
    }
}

fn rpc_name(code: RpcCode) -> &'static str {
    match code {
        RpcCode::Cancelled => "CANCELLED",
        RpcCode::InvalidArgument => "INVALID_ARGUMENT",
        RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        RpcCode::NotFound => "NOT_FOUND",
        RpcCode::AlreadyExists => "ALREADY_EXISTS",
        RpcCode::PermissionDenied => "PERMISSION_DENIED",
        RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
        RpcCode::Aborted => "ABORTED",
        RpcCode::OutOfRange => "OUT_OF_RANGE",
        RpcCode::Unimplemented => "UNIMPLEMENTED",
        RpcCode::Internal => "INTERNAL",
        RpcCode::Unavailable => "UNAVAILABLE",
        RpcCode::DataLoss => "DATA_LOSS",
        RpcCode::Unauthenticated => "UNAUTHENTICATED",
        RpcCode::Unknown => "UNKNOWN",
    }
}

fn apply_context(err: ClassifiedError, context: Option<&ErrorContext>) -> ClassifiedError {
    let Some(context) = context else {
        return err;
    };
    let err = match &context.operation {
        Some(op) => err.with_detail("operation", Value::from(op.as_str())),
        None => err,
    };
    match &context.context_key {
        Some(key) => err.with_detail("context_key", Value::from(key.as_str())),
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(raw: RawError) -> (ErrorKind, bool) {
        let err = classify(&raw, None);
        (err.kind(), err.is_recoverable())
    }

    #[test]
    fn transport_level_failures() {
        assert_eq!(kind_of(RawError::Timeout("slow".into())), (ErrorKind::Timeout, true));
        assert_eq!(kind_of(RawError::Aborted), (ErrorKind::Timeout, true));
        assert_eq!(
            kind_of(RawError::connection(ConnectionFailure::Dns, "no such host")),
            (ErrorKind::Network, true)
        );
        assert_eq!(kind_of(RawError::Other("boom".into())), (ErrorKind::Network, true));
    }

    #[test]
    fn validation_statuses_are_not_recoverable() {
        for status in [400, 404, 409, 422] {
            assert_eq!(kind_of(RawError::status(status, "bad")), (ErrorKind::Validation, false));
        }
        assert_eq!(kind_of(RawError::Malformed("shape".into())), (ErrorKind::Validation, false));
    }

    #[test]
    fn authorization_recoverable_only_for_401() {
        assert_eq!(kind_of(RawError::status(401, "expired")), (ErrorKind::Authorization, true));
        assert_eq!(kind_of(RawError::status(403, "nope")), (ErrorKind::Authorization, false));
    }

    #[test]
    fn service_errors_use_retry_after_or_default_seed() {
        let err = classify(&RawError::status_with_retry_after(503, "busy", 12), None);
        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(err.retry_after_seconds(), Some(12));

        let err = classify(&RawError::status(500, "oops"), None);
        assert_eq!(err.retry_after_seconds(), Some(DEFAULT_SERVICE_RETRY_AFTER_SECS));
        assert_eq!(err.code(), "HTTP_500");
    }

    #[test]
    fn rate_limit_defaults_to_sixty_seconds() {
        let err = classify(&RawError::status(429, "slow down"), None);
        assert_eq!(err.kind(), ErrorKind::Service);
        assert!(err.is_recoverable());
        assert_eq!(err.retry_after_seconds(), Some(60));
        assert_eq!(err.code(), "RATE_LIMITED");

        let err = classify(
            &RawError::Rpc {
                code: RpcCode::ResourceExhausted,
                message: "quota".into(),
                retry_after: Some(7),
            },
            None,
        );
        assert_eq!(err.retry_after_seconds(), Some(7));
    }

    #[test]
    fn rpc_equivalents() {
        let rpc = |code| RawError::Rpc { code, message: "x".into(), retry_after: None };
        assert_eq!(kind_of(rpc(RpcCode::Unavailable)), (ErrorKind::Service, true));
        assert_eq!(kind_of(rpc(RpcCode::Unauthenticated)), (ErrorKind::Authorization, true));
        assert_eq!(kind_of(rpc(RpcCode::PermissionDenied)), (ErrorKind::Authorization, false));
        assert_eq!(kind_of(rpc(RpcCode::InvalidArgument)), (ErrorKind::Validation, false));
        assert_eq!(kind_of(rpc(RpcCode::DeadlineExceeded)), (ErrorKind::Timeout, true));
    }

    #[test]
    fn classified_errors_pass_through_unchanged() {
        let original = ClassifiedError::new(ErrorKind::Validation, "CUSTOM", "kept", false);
        let context = ErrorContext::operation("getUser");
        let again = classify(&RawError::Classified(original.clone()), Some(&context));
        assert_eq!(again, original);
    }

    #[test]
    fn context_lands_in_details() {
        let context = ErrorContext::operation("getUser").with_context_key("user-api");
        let err = classify(&RawError::status(502, "bad gateway"), Some(&context));
        let details = err.details().unwrap();
        assert_eq!(details["operation"], "getUser");
        assert_eq!(details["context_key"], "user-api");
    }

    #[test]
    fn unexpected_success_status_is_not_retried() {
        assert_eq!(kind_of(RawError::status(302, "moved")), (ErrorKind::Service, false));
    }
}
