//! Error classification for failed transcode attempts.
//!
//! Maps free-form error text (subprocess stderr or an internal error
//! description) to an [`ErrorCategory`], which in turn decides whether the
//! attempt is retried and how long to back off before the next one.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for a single backoff delay in seconds.
pub const MAX_BACKOFF_SECS: u64 = 300;

/// Base delay used by categories without an explicit entry.
const DEFAULT_BASE_DELAY_SECS: u64 = 10;

/// Failure taxonomy for transcode attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Missing input, permission problems, full disk.
    FileAccess,
    /// Encoder binary or codec could not be initialized.
    Encoder,
    /// Memory or descriptor exhaustion.
    Resource,
    /// Child process died or could not be executed.
    Process,
    /// Broadcast stream layout changed mid-recording.
    StreamChange,
    /// Hardware encoder rejected a parameter.
    EncoderParam,
    /// Demux/mux pipeline could not map streams.
    PipelineStream,
    /// Invalid encoding settings.
    Configuration,
    /// Connection level failures.
    Network,
    /// Nothing matched.
    #[default]
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::FileAccess => "FILE_ACCESS",
            ErrorCategory::Encoder => "ENCODER",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Process => "PROCESS",
            ErrorCategory::StreamChange => "STREAM_CHANGE",
            ErrorCategory::EncoderParam => "ENCODER_PARAM",
            ErrorCategory::PipelineStream => "PIPELINE_STREAM",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl ErrorCategory {
    /// Whether a failure in this category is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Resource
                | ErrorCategory::Network
                | ErrorCategory::Encoder
                | ErrorCategory::Process
                | ErrorCategory::StreamChange
                | ErrorCategory::EncoderParam
                | ErrorCategory::PipelineStream
        )
    }

    /// Base backoff delay in seconds before exponential scaling.
    pub fn base_delay_secs(self) -> u64 {
        match self {
            ErrorCategory::Resource => 30,
            ErrorCategory::Network => 10,
            ErrorCategory::Encoder => 5,
            ErrorCategory::Process => 15,
            ErrorCategory::StreamChange => 5,
            ErrorCategory::EncoderParam => 3,
            ErrorCategory::PipelineStream => 3,
            _ => DEFAULT_BASE_DELAY_SECS,
        }
    }

    /// Short hint appended to user-facing error messages.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorCategory::StreamChange => Some("[stream layout changed during recording]"),
            ErrorCategory::EncoderParam => Some("[hardware encoder rejected a parameter]"),
            ErrorCategory::PipelineStream => Some("[stream mapping failed]"),
            _ => None,
        }
    }
}

/// Ordered pattern table; the first category with a matching pattern wins.
const PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::FileAccess,
        &[
            r"No such file or directory",
            r"Permission denied",
            r"Disk full",
            r"Access is denied",
        ],
    ),
    (
        ErrorCategory::Encoder,
        &[
            r"Encoder.*not found",
            r"Hardware encoder.*not available",
            r"Codec initialization failed",
        ],
    ),
    (
        ErrorCategory::Resource,
        &[
            r"Out of memory",
            r"Cannot allocate memory",
            r"Too many open files",
        ],
    ),
    (
        ErrorCategory::Process,
        &[
            r"Process.*terminated",
            r"Command.*not found",
            r"Execution.*failed",
        ],
    ),
    (
        ErrorCategory::StreamChange,
        &[
            r"PMT.*version.*change",
            r"New PMT",
            r"program_number.*changed",
            r"stream.*configuration.*change",
            r"Stream.*#.*not found",
            r"Cannot find a matching stream",
            r"Invalid stream identifier",
        ],
    ),
    (
        ErrorCategory::EncoderParam,
        &[
            r"storage->SetProperty.*failed",
            r"invalid param",
            r"VCEEncC.*parameter.*error",
            r"AMF.*property.*error",
        ],
    ),
    (
        ErrorCategory::PipelineStream,
        &[
            r"Stream mapping failed",
            r"Cannot find stream",
            r"Invalid stream specifier",
            r"No suitable output format found",
            r"Failed to open.*for reading",
            r"Invalid data found when processing input",
            r"Invalid frame dimensions",
            r"Option.*cannot be applied to input url",
            r"Error parsing options for input file",
            r"Error opening input files",
        ],
    ),
    (
        ErrorCategory::Configuration,
        &[
            r"Invalid (encoding )?settings?",
            r"Unsupported (codec|preset|encoder)",
            r"Unknown encoder",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            r"Connection (refused|reset|timed out)",
            r"Network is unreachable",
            r"Temporary failure in name resolution",
        ],
    ),
];

static COMPILED: Lazy<Vec<(ErrorCategory, Vec<Regex>)>> = Lazy::new(|| {
    PATTERNS
        .iter()
        .map(|(category, patterns)| {
            let regexes = patterns
                .iter()
                .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
                .collect();
            (*category, regexes)
        })
        .collect()
});

/// Classifies an error message into a category.
///
/// Matching is case-insensitive and follows table order, so a message that
/// mentions both a missing file and a stream mapping problem is FILE_ACCESS.
pub fn classify_error(message: &str) -> ErrorCategory {
    COMPILED
        .iter()
        .find(|(_, regexes)| regexes.iter().any(|re| re.is_match(message)))
        .map(|(category, _)| *category)
        .unwrap_or_default()
}

/// Backoff before retry number `attempt_index` (zero based).
///
/// `min(base * 2^attempt_index, cap_secs)`.
pub fn backoff_secs(category: ErrorCategory, attempt_index: u32, cap_secs: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
    category
        .base_delay_secs()
        .saturating_mul(factor)
        .min(cap_secs)
}

/// [`backoff_secs`] with the default 300 second cap, as a `Duration`.
pub fn retry_delay(category: ErrorCategory, attempt_index: u32) -> Duration {
    Duration::from_secs(backoff_secs(category, attempt_index, MAX_BACKOFF_SECS))
}

/// Decision for a failed attempt given the retry budget.
pub fn should_retry(category: ErrorCategory, retry_count: u32, max_retry_count: u32) -> bool {
    category.is_retryable() && retry_count < max_retry_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_categories() -> impl Strategy<Value = ErrorCategory> {
        prop_oneof![
            Just(ErrorCategory::FileAccess),
            Just(ErrorCategory::Encoder),
            Just(ErrorCategory::Resource),
            Just(ErrorCategory::Process),
            Just(ErrorCategory::StreamChange),
            Just(ErrorCategory::EncoderParam),
            Just(ErrorCategory::PipelineStream),
            Just(ErrorCategory::Configuration),
            Just(ErrorCategory::Network),
            Just(ErrorCategory::Unknown),
        ]
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_cap(category in all_categories(), attempt in 0u32..80) {
            let delay = backoff_secs(category, attempt, MAX_BACKOFF_SECS);
            prop_assert!(delay <= MAX_BACKOFF_SECS);
            prop_assert!(delay >= category.base_delay_secs().min(MAX_BACKOFF_SECS));
        }

        #[test]
        fn prop_backoff_non_decreasing(category in all_categories(), attempt in 0u32..70) {
            let a = backoff_secs(category, attempt, MAX_BACKOFF_SECS);
            let b = backoff_secs(category, attempt + 1, MAX_BACKOFF_SECS);
            prop_assert!(b >= a);
        }

        #[test]
        fn prop_retry_budget_respected(
            category in all_categories(),
            retry_count in 0u32..10,
            max in 0u32..10,
        ) {
            if should_retry(category, retry_count, max) {
                prop_assert!(retry_count < max);
                prop_assert!(category.is_retryable());
            }
        }

        #[test]
        fn prop_arbitrary_digits_are_unknown(s in "[0-9 ]{0,40}") {
            prop_assert_eq!(classify_error(&s), ErrorCategory::Unknown);
        }
    }

    #[test]
    fn test_resource_backoff_sequence() {
        assert_eq!(retry_delay(ErrorCategory::Resource, 0), Duration::from_secs(30));
        assert_eq!(retry_delay(ErrorCategory::Resource, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(ErrorCategory::Resource, 2), Duration::from_secs(120));
        assert_eq!(retry_delay(ErrorCategory::Resource, 3), Duration::from_secs(240));
        assert_eq!(retry_delay(ErrorCategory::Resource, 4), Duration::from_secs(300));
    }

    #[test]
    fn test_default_base_delay() {
        assert_eq!(ErrorCategory::Unknown.base_delay_secs(), 10);
        assert_eq!(ErrorCategory::FileAccess.base_delay_secs(), 10);
        assert_eq!(ErrorCategory::Configuration.base_delay_secs(), 10);
    }

    #[test]
    fn test_classify_each_category() {
        let cases = [
            ("open: No such file or directory", ErrorCategory::FileAccess),
            ("write error: Disk full", ErrorCategory::FileAccess),
            ("Hardware encoder QSV not available", ErrorCategory::Encoder),
            ("Codec initialization failed", ErrorCategory::Encoder),
            ("Out of memory", ErrorCategory::Resource),
            ("Too many open files", ErrorCategory::Resource),
            ("Process was terminated by signal", ErrorCategory::Process),
            ("New PMT detected", ErrorCategory::StreamChange),
            ("program_number 1024 changed", ErrorCategory::StreamChange),
            ("storage->SetProperty(QPMin) failed", ErrorCategory::EncoderParam),
            ("AMF encoder property error", ErrorCategory::EncoderParam),
            ("Stream mapping failed", ErrorCategory::PipelineStream),
            ("Error opening input files: EOF", ErrorCategory::PipelineStream),
            ("Invalid encoding settings: preset", ErrorCategory::Configuration),
            ("Connection refused", ErrorCategory::Network),
            ("segfault at 0x0", ErrorCategory::Unknown),
            ("", ErrorCategory::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(classify_error(message), expected, "message: {message}");
        }
    }

    #[test]
    fn test_classify_case_insensitive() {
        assert_eq!(classify_error("OUT OF MEMORY"), ErrorCategory::Resource);
        assert_eq!(classify_error("stream MAPPING failed"), ErrorCategory::PipelineStream);
    }

    #[test]
    fn test_first_category_wins() {
        // FILE_ACCESS is listed before PIPELINE_STREAM
        let msg = "Failed to open x.ts for reading: No such file or directory";
        assert_eq!(classify_error(msg), ErrorCategory::FileAccess);
    }

    #[test]
    fn test_retryable_membership() {
        assert!(ErrorCategory::Resource.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::PipelineStream.is_retryable());
        assert!(!ErrorCategory::FileAccess.is_retryable());
        assert!(!ErrorCategory::Configuration.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_should_retry_exhausted() {
        assert!(should_retry(ErrorCategory::Resource, 2, 3));
        assert!(!should_retry(ErrorCategory::Resource, 3, 3));
        assert!(!should_retry(ErrorCategory::FileAccess, 0, 3));
    }

    #[test]
    fn test_category_display_and_serde() {
        assert_eq!(ErrorCategory::PipelineStream.to_string(), "PIPELINE_STREAM");
        let json = serde_json::to_string(&ErrorCategory::EncoderParam).unwrap();
        assert_eq!(json, "\"ENCODER_PARAM\"");
    }

    #[test]
    fn test_default_category_is_unknown() {
        assert_eq!(ErrorCategory::default(), ErrorCategory::Unknown);
        assert!(!ErrorCategory::default().is_retryable());
    }
}
