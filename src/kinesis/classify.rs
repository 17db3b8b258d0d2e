//! Sink error classification.
//!
//! Pure function from the error code and message Kinesis reports to a
//! retry disposition. Anything not positively identified as permanent
//! (authorization, missing resource, validation, oversize record) is
//! treated as retriable: throttling, internal errors, timeouts, and
//! transport failures all recover with backoff.

/// Error code prefixes that never succeed on retry.
const NON_RETRIABLE_CODE_PREFIXES: &[&str] = &[
    "AccessDenied",
    "NotAuthorized",
    "UnrecognizedClient",
    "InvalidSignature",
    "ResourceNotFound",
    "Validation",
    "InvalidArgument",
    "MissingParameter",
];

/// Message substrings (matched case-insensitively) that mark an error as
/// permanent even when the code alone is inconclusive.
const NON_RETRIABLE_MESSAGE_MARKERS: &[&str] = &[
    "access denied",
    "not authorized",
    "not found",
    "validation error",
    "exceeds the maximum allowed size",
    "record too large",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retriable,
    NonRetriable,
}

pub fn classify(code: &str, message: &str) -> Disposition {
    if NON_RETRIABLE_CODE_PREFIXES
        .iter()
        .any(|prefix| code.starts_with(prefix))
    {
        return Disposition::NonRetriable;
    }

    let message = message.to_lowercase();
    if NON_RETRIABLE_MESSAGE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
    {
        return Disposition::NonRetriable;
    }

    Disposition::Retriable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_internal_errors_are_retriable() {
        assert_eq!(
            classify("ProvisionedThroughputExceededException", "Rate exceeded"),
            Disposition::Retriable
        );
        assert_eq!(
            classify("InternalFailure", "Internal service error"),
            Disposition::Retriable
        );
        assert_eq!(
            classify("RequestTimeout", "Request timed out"),
            Disposition::Retriable
        );
        assert_eq!(classify("", "connection reset by peer"), Disposition::Retriable);
    }

    #[test]
    fn permanent_codes_are_non_retriable() {
        assert_eq!(
            classify("AccessDeniedException", "no kinesis:PutRecords permission"),
            Disposition::NonRetriable
        );
        assert_eq!(
            classify("ResourceNotFoundException", "Stream orders not found"),
            Disposition::NonRetriable
        );
        assert_eq!(
            classify("ValidationException", "1 validation error detected"),
            Disposition::NonRetriable
        );
    }

    #[test]
    fn oversize_marker_in_message_is_non_retriable() {
        assert_eq!(
            classify(
                "SomeWrapperError",
                "Value at 'records.1.member.data' exceeds the maximum allowed size"
            ),
            Disposition::NonRetriable
        );
        assert_eq!(
            classify("", "Record TOO Large for stream"),
            Disposition::NonRetriable
        );
    }

    #[test]
    fn classification_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(
                classify("ProvisionedThroughputExceededException", "Rate exceeded"),
                Disposition::Retriable
            );
            assert_eq!(
                classify("AccessDeniedException", "denied"),
                Disposition::NonRetriable
            );
        }
    }
}
