//! Unified error type for the rankcall library.
//!
//! Registry lookups, buffer reads and transport failures all surface through
//! [`Error`] to the immediate caller of the marshal/unmarshal/apply entry
//! point. Layout and arity problems are compile errors and have no variant
//! here.

use thiserror::Error;

use crate::config::ConfigError;

/// Unified error type for all rankcall operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A read ran past the written length of a buffer.
    #[error("Buffer exhausted: need {needed} bytes, have {available}")]
    BufferExhausted { needed: usize, available: usize },

    /// An alignment that is zero, not a power of two, or above the supported maximum.
    #[error("Invalid alignment {alignment}: must be a power of two no greater than {max}")]
    InvalidAlignment { alignment: usize, max: usize },

    /// A zero-copy view was requested at a position not aligned for the element type.
    #[error("Cursor offset {offset} is not aligned to {alignment} for a zero-copy read")]
    Misaligned { offset: usize, alignment: usize },

    #[error("Invalid bool value: {0}")]
    InvalidBool(u8),

    #[error("Invalid char value: {0}")]
    InvalidChar(u32),

    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("Invalid C string: {0}")]
    InvalidCString(String),

    /// A length or count field does not fit the local address space.
    #[error("Length {0} does not fit in usize")]
    LengthOverflow(u64),

    /// A function handle with no registered invoker.
    #[error("Unregistered function: {0}")]
    UnregisteredFunction(String),

    /// A type key with no registered factory or object table entry.
    #[error("Unregistered type: {0}")]
    UnregisteredType(String),

    /// A member call or lookup for an object id that is not present.
    #[error("Unregistered object {object_id} of type {type_name}")]
    UnregisteredObject { type_name: String, object_id: u64 },

    /// Two registrations claimed the same stable identifier.
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// An argument was accessed as a different type than it was declared with.
    #[error("Argument {index} has type {found}, accessed as {expected}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Argument index {index} out of range for arity {arity}")]
    ArgumentIndex { index: usize, arity: usize },

    /// A frame slot was read after its value was moved out or destroyed.
    #[error("Slot {0} no longer holds a value")]
    SlotVacant(usize),

    /// A frame slot was accessed as a different type than the one stored in it.
    #[error("Slot holds {found}, accessed as {expected}")]
    SlotType {
        expected: &'static str,
        found: &'static str,
    },

    /// A reserved position or vacated slot was filled twice.
    #[error("Frame position {0} is already occupied")]
    SlotOccupied(usize),

    /// A value does not fit the reserved position in a frame region.
    #[error(
        "Layout mismatch for {type_name}: value is {size}B/{align}-aligned, slot is {slot_size}B/{slot_align}-aligned"
    )]
    LayoutMismatch {
        type_name: &'static str,
        size: usize,
        align: usize,
        slot_size: usize,
        slot_align: usize,
    },

    /// A pointer wrapper header with a flag combination the protocol forbids.
    #[error("Invalid pointer flags: pass_back={pass_back}, pass_ownership={pass_ownership}")]
    InvalidPointerFlags { pass_back: bool, pass_ownership: bool },

    /// A received argument does not match the category its parameter was declared with.
    #[error("Category mismatch: parameter declared {expected}, wire carries {found}")]
    CategoryMismatch { expected: String, found: String },

    /// A pass-back or array argument carries a different element count than its target.
    #[error("Element count mismatch: expected {expected}, got {found}")]
    ElementCount { expected: usize, found: usize },

    /// A polymorphic pointer wrapper whose elements have different dynamic types.
    #[error("Polymorphic elements of one wrapper must share a dynamic type")]
    MixedPolymorphicElements,

    /// A call-scoped constructor argument was marshalled without the frame that owns it.
    #[error("Call-scoped argument {0} marshalled without its frame")]
    DetachedSlot(usize),

    /// A value built outside any caller frame needs call-scoped constructor arguments.
    #[error("{0} keeps call-scoped constructor arguments and cannot be built without a frame")]
    DetachedCallScoped(&'static str),

    /// A position that needs a ready value received a construction plan.
    #[error("Construction info for {0} cannot be used here; realize it into a frame")]
    UnexpectedConstructionInfo(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rank {rank} is outside the world of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Unexpected message tag {0}")]
    UnexpectedTag(u8),

    /// The callee failed to apply the call; carries its error text.
    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A [`Result`] type alias using the unified [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport error from a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Returns `true` if this error came from reading or writing a buffer.
    pub fn is_buffer(&self) -> bool {
        matches!(
            self,
            Self::BufferExhausted { .. } | Self::Misaligned { .. } | Self::InvalidAlignment { .. }
        )
    }

    /// Returns `true` if this is a registry lookup miss.
    pub fn is_registry(&self) -> bool {
        matches!(
            self,
            Self::UnregisteredFunction(_)
                | Self::UnregisteredType(_)
                | Self::UnregisteredObject { .. }
        )
    }

    /// Returns `true` if the error was raised on the remote side of a call.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
