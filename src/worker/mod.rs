pub mod fetch;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod youtube;

pub use fetch::HttpFetcher;
pub use pipeline::{Pipeline, PipelineSettings};
pub use scheduler::{Scheduler, SchedulerStats};
pub use youtube::YouTubePublisher;
