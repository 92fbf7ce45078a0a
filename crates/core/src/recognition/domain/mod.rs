pub mod gallery;
pub mod gallery_matcher;
pub mod gallery_source;
pub mod recognition_stabilizer;
