#![forbid(unsafe_code)]

pub mod claim;
pub mod matcher;
pub mod normalizer;
pub mod pending_image;
pub mod sealer;
pub mod secret_vault;
