pub mod training_pool;

pub use training_pool::TrainingPool;
