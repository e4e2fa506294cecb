pub mod calibration;
pub mod loss;
pub mod network;
pub mod trainer;

pub use calibration::{conformity_score, ConformalOffset};
pub use loss::{LossBreakdown, NonCrossingLoss};
pub use network::{HeadOutput, QuantileNetwork};
pub use trainer::{NcCqrTrainer, SplitPlan, TrainedModel, TrainingSummary};
