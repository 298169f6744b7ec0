//! Command trait, type-prefix framing and the decoder registry

use std::collections::HashMap;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{ApiError, Attribution, CodecError, CodecResult, MutationContext};

/// Numeric command discriminator carried in the first four bytes of every
/// encoded command
pub type CommandType = u32;

/// Length of the type prefix
pub const TYPE_PREFIX_LEN: usize = 4;

/// A replicated mutation
pub trait Command: Send + Sync + fmt::Debug {
    /// Discriminator used to pick the decoder on the receiving side
    fn command_type(&self) -> CommandType;

    /// Encode the command body, without the type prefix
    fn encode_body(&self) -> CodecResult<Vec<u8>>;

    /// Apply the command to the store
    fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError>;

    /// Reject malformed input before it reaches the log
    fn validate(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Who the change should be attributed to
    fn attribution(&self) -> Option<Attribution> {
        None
    }

    /// Full wire form: type prefix followed by the body
    fn encode(&self) -> CodecResult<Vec<u8>> {
        Ok(frame(self.command_type(), &self.encode_body()?))
    }
}

/// A command whose body is its CBOR serialization
pub trait TypedCommand: Command + Serialize + DeserializeOwned + 'static {
    /// Type prefix for this command
    const TYPE: CommandType;
}

/// CBOR-encode a command body
pub fn cbor_body<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Prefix `body` with `command_type`
pub fn frame(command_type: CommandType, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; TYPE_PREFIX_LEN + body.len()];
    BigEndian::write_u32(&mut buf[..TYPE_PREFIX_LEN], command_type);
    buf[TYPE_PREFIX_LEN..].copy_from_slice(body);
    buf
}

/// Split an encoded command into its type prefix and body
pub fn split_frame(bytes: &[u8]) -> CodecResult<(CommandType, &[u8])> {
    if bytes.len() < TYPE_PREFIX_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let (prefix, body) = bytes.split_at(TYPE_PREFIX_LEN);
    Ok((BigEndian::read_u32(prefix), body))
}

type Decoder = Box<dyn Fn(&[u8]) -> CodecResult<Box<dyn Command>> + Send + Sync>;

/// Maps type prefixes to decoders
#[derive(Default)]
pub struct CommandRegistry {
    decoders: HashMap<CommandType, Decoder>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("CommandRegistry")
            .field("types", &types)
            .finish()
    }
}

impl CommandRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a CBOR-bodied command
    pub fn register<C: TypedCommand>(&mut self) -> CodecResult<()> {
        self.register_decoder(C::TYPE, |body| {
            let cmd: C = ciborium::from_reader(body).map_err(|e| CodecError::Decode {
                command_type: C::TYPE,
                reason: e.to_string(),
            })?;
            Ok(Box::new(cmd))
        })
    }

    /// Register a custom decoder for `command_type`
    pub fn register_decoder<F>(&mut self, command_type: CommandType, decoder: F) -> CodecResult<()>
    where
        F: Fn(&[u8]) -> CodecResult<Box<dyn Command>> + Send + Sync + 'static,
    {
        if self.decoders.contains_key(&command_type) {
            return Err(CodecError::DuplicateType(command_type));
        }
        self.decoders.insert(command_type, Box::new(decoder));
        Ok(())
    }

    /// Whether a decoder is registered for `command_type`
    pub fn contains(&self, command_type: CommandType) -> bool {
        self.decoders.contains_key(&command_type)
    }

    /// Decode a full wire-form command
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Box<dyn Command>> {
        let (command_type, body) = split_frame(bytes)?;
        let decoder = self
            .decoders
            .get(&command_type)
            .ok_or(CodecError::UnknownType(command_type))?;
        decoder(body)
    }
}
