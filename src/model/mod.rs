pub mod entity;
pub mod observation;
pub mod prediction;
