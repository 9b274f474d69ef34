//! # docflow-inference
//!
//! Classification and embedding collaborators for the docflow pipeline.
//!
//! This crate provides:
//! - Ollama implementation of [`docflow_core::Classifier`] (`/api/chat`,
//!   JSON-constrained) and [`docflow_core::Embedder`] (`/api/embed`)
//! - Mock collaborators with call logs and scripted failures (feature `mock`)
//!
//! # Feature Flags
//!
//! - `ollama` (default): Enable Ollama backend
//! - `mock`: Enable mock collaborators for tests in dependent crates
//!
//! # Example
//!
//! ```rust,no_run
//! use docflow_core::Embedder;
//! use docflow_inference::OllamaBackend;
//!
//! #[tokio::main]
//! async fn main() -> docflow_core::Result<()> {
//!     let backend = OllamaBackend::from_env()?;
//!     let _vector = backend.embed("Hello").await;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaBackend, OllamaConfig};
