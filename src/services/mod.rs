pub mod external_caller;
pub mod prompts;
pub mod rate_limiter;
pub mod response_parser;
pub mod warn_writer;

pub use external_caller::{CallResponse, ExternalCaller, RetryPolicy};
pub use rate_limiter::{
    CallPermit, CallerLimits, RateLimitState, RateLimiter, RateLimits, UsageSummary,
};
pub use response_parser::{ParseFailure, ParseOutcome, ParseStrategy};
pub use warn_writer::ParseFailureLog;
