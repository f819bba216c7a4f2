//! Script pod tracking

pub mod monitor;
pub mod service;
pub mod tracked;

pub use monitor::PodMonitor;
pub use service::{KubePodService, PodList, PodService, PodWatchEvent, PodWatchStream};
pub use tracked::{PodPhase, PodState, PodStatus};

#[cfg(test)]
pub use service::MockPodService;
