#![forbid(unsafe_code)]

pub mod analyzer;
pub mod config;
pub mod control_client;
pub mod fsm;
pub mod prober;

pub use analyzer::{AnalysisResult, SegmentAnalyzer, SubprocessAnalyzer};
pub use config::WorkerConfig;
pub use control_client::ControlPlaneClient;
pub use fsm::{Outcome, WorkerStateMachine};
pub use prober::{HttpStreamProber, LiveStatus, StreamProber};
