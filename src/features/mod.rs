pub mod scaler;
pub mod transformer;

pub use scaler::{ColumnScaler, Scaler};
pub use transformer::{FeatureMatrix, FeatureTransformer, FEATURE_COLUMNS, FEATURE_SET_VERSION};
