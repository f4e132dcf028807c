pub mod output;
pub mod storage;
pub mod vision;

pub use storage::StorageClient;
pub use vision::{
    AnnotateImageResponse, EntityAnnotation, Feature, FeatureKind, FeatureSpec, VisionClient,
};
