//! Replicated command abstraction.
//!
//! Commands are the only way application state changes: they are encoded
//! with a 4-byte big-endian type prefix, carried through the replicated log,
//! decoded through a [`CommandRegistry`] on every member and applied against
//! a [`MutationContext`]. Failures are reported as structured [`ApiError`]s
//! that survive crossing node boundaries.
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api_error;
mod command;
mod context;
mod error;

pub use api_error::{
    ApiError, ApiErrorPayload, CauseParser, CauseRegistry, ErrorCause, FieldError, GenericCause,
    NotFoundError,
};
pub use command::{
    Command, CommandRegistry, CommandType, TYPE_PREFIX_LEN, TypedCommand, cbor_body, frame,
    split_frame,
};
pub use context::{Attribution, ChangeContext, MutationContext};
pub use error::{CodecError, CodecResult};
