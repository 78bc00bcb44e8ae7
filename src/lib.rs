// FunkSVD matrix factorization for rating prediction

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod baseline;
pub mod clamp;
pub mod funksvd;
pub mod index;
pub mod model;

pub use baseline::{
    BaselinePredictor, ConstantBaseline, GlobalMeanBaseline, ItemMeanBaseline,
    ItemUserMeanBaseline,
};
pub use clamp::ClampingFunction;
pub use funksvd::{FeatureInfo, FunkSvdConfig, FunkSvdTrainer, Rating};
pub use index::IdIndex;
pub use model::FunkSvdModel;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub(crate) fn invalid_input(message: String) -> ThreadSafeStdError {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message).into()
}
