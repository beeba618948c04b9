//! Production implementation of the Runtime trait.

pub mod prod;

pub use prod::ProdRuntime;
