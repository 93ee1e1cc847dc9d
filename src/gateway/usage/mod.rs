//! Usage accounting: record assembly, the publish path and its disk spool.

pub mod buffer;
pub mod publisher;
pub mod record;

pub use buffer::{BufferError, BufferStore};
pub use publisher::{
    MemoryUsageSink, PublishError, PublishOutcome, RetryReport, UsagePublisher, UsageSink,
};
pub use record::{
    BudgetSnapshot, LimitState, UsageContext, UsageRecord, UsageRecordBuilder,
};
