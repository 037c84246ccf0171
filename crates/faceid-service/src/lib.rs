pub mod api;
pub mod config;
pub mod directory;
pub mod embedder;
pub mod error;
pub mod login;
pub mod matcher;
pub mod recognizer;
pub mod reference;
pub mod scanner;
pub mod state;
pub mod video;

pub use config::FaceIdConfig;
pub use error::RecognitionError;
pub use state::FaceIdState;
