//! Thumbgate Core Library
//!
//! Runtime-independent building blocks of the thumbgate image gateway:
//! the error taxonomy, the size-capped input/output buffer, the source
//! host whitelist, resize option parsing and defaulting, stage timing and
//! the codec seam over the `image` crate.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod options;
pub mod timing;
pub mod whitelist;

pub use buffer::BoundedBuffer;
pub use codec::{check_allocation, plan_resize, Codec, ImageCodec, ReadSeek, ResizePlan};
pub use error::{GatewayError, Headers, SizeExceeded};
pub use options::{
    auto_output_format, fingerprint, OutputFormat, ResizeDefaults, ResizeMode, ResizeParameters,
    ResizeRequest, ResolvedOptions,
};
pub use timing::{Stage, StageTimer, TIMING_HEADER_PREFIX};
pub use whitelist::DomainWhitelist;
