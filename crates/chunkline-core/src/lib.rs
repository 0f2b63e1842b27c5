//! # chunkline-core
//!
//! Building blocks shared by the chunked inference pipeline:
//! - [`DType`] and [`Shape`] for declared tensor interfaces
//! - [`ZeroCopyTensor`], an identity-carrying shared backing
//! - [`BufferArena`], which allocates each backing once and hands out stable handles
//! - [`Model`] / [`ModelLoader`], the boundary to whatever runtime executes the chunks

pub mod dtype;
pub mod shape;
pub mod tensor;
pub mod arena;
pub mod features;
pub mod model;
pub mod error;

pub use dtype::DType;
pub use shape::Shape;
pub use tensor::{sequence_suffix, BufferId, HostAllocator, TensorAllocator, ZeroCopyTensor};
pub use arena::{BufferArena, BufferHandle};
pub use features::FeatureMap;
pub use model::{ComputePlacement, LoadOptions, Model, ModelDescription, ModelLoader, TensorDescription};
pub use error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
