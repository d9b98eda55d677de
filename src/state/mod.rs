pub mod metrics;
pub mod quality;
pub mod snapshot;

pub use metrics::{Aggregator, DirectionalLoss, split_directional_loss};
pub use quality::{QualityScore, calculate_mos};
pub use snapshot::{HISTORY_LEN, MetricsSnapshot, RunState, RunStatus};
