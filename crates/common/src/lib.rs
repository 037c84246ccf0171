pub mod directory;
pub mod frame_extractor;
pub mod recognition;
