/// Consumer-side buffered event processor
pub mod processor;

/// Consumer-side rollback executor
pub mod rollback;

/// Producer-side backfill scan driver
pub mod backfill;

#[macro_export]
macro_rules! dispatch_jobs {
    ( $endpoint:ident, $job:expr ) => {
        let cloned_endpoint = $endpoint.clone();
        ::tokio::spawn(async move { $job(&cloned_endpoint).await });
    };

    ( $endpoint:ident, $job:expr, $($jobs:expr),+ ) => {
        $crate::dispatch_jobs!($endpoint, $job);
        $crate::dispatch_jobs!($endpoint, $($jobs),+);
    }
}
