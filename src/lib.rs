//! imagepipe: an image-loading pipeline with memory and disk caching
//!
//! Given a URI, the pipeline fetches, decodes, transforms, caches, and
//! delivers an image:
//!
//! - pluggable fetchers, decoders, and interceptors via a
//!   [`registry::ComponentRegistry`] with first-match resolution
//! - a byte-budgeted LRU [`cache::MemoryCache`] of decoded images and a
//!   content-addressed persistent [`cache::ResultCache`] of raw bytes
//! - in-flight coalescing: at most one fetch+decode per fingerprint, with
//!   all concurrent identical requests sharing the result
//! - cooperative cancellation with per-subscriber interest tracking
//! - decode-buffer reuse through a [`pool::BitmapPool`]
//!
//! The [`loader::ImageLoader`] ties it together:
//!
//! ```rust,no_run
//! use imagepipe::loader::ImageLoader;
//! use imagepipe::request::ImageRequest;
//!
//! # fn main() -> imagepipe::Result<()> {
//! let loader = ImageLoader::builder().build();
//! let result = loader.execute(ImageRequest::new("https://example.com/photo.jpg"))?;
//! println!("loaded {} from {:?}", result.image.size(), result.data_from);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod coalesce;
pub mod decode;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod image;
pub mod interceptor;
pub mod key;
pub mod loader;
pub mod pool;
pub mod registry;
pub mod request;
pub mod token;
pub mod transform;
mod worker;

pub use error::{Error, Result};
pub use image::{DataFrom, ImageResult, ImageValue, PixelBuffer, Size};
pub use loader::{ImageLoader, ImageLoaderBuilder, RequestHandle};
pub use request::{CachePolicy, ImageRequest, Precision, Scale, SizePolicy, Target};
