pub mod centroids;
pub mod clustering;
pub mod detector;
pub mod extractor;
pub mod people;
pub mod similarity;
pub mod thumbnails;
pub mod worker;

pub use centroids::update_person_embeddings;
pub use clustering::{discover, Cluster};
pub use detector::{FaceModel, OnnxFaceModel};
pub use extractor::{ExtractionResult, Extractor};
pub use similarity::{matches, similarity, FaceMatch};
pub use worker::{Extraction, WorkerCommand};
