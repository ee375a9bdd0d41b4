pub mod checksum;
pub mod chunk;
pub mod engine;
pub mod filename;
pub mod manager;
pub mod output;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod worker;

pub use chunk::{plan_ranges, Plan, Task};
pub use engine::{DownloadEngine, DownloadRequest};
pub use manager::DownloadManager;
pub use probe::ProbeResult;
pub use progress::{ProgressSnapshot, ProgressState, SpeedCalculator};
pub use scheduler::WorkStealScheduler;
pub use worker::ActiveTask;
