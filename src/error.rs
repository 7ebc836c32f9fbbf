use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid surface configuration: {0}")]
    Configuration(String),

    #[error("Capability not supported: {0}")]
    Unsupported(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Mapping failed: {0}")]
    Mapping(String),

    #[error("A CPU window is already mapped")]
    AlreadyMapped,

    #[error("No CPU window is mapped")]
    NotMapped,

    #[error("Cannot {op} while surface is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("Offset 0x{offset:x} is out of range (limit 0x{limit:x})")]
    OutOfRange { offset: u64, limit: u64 },

    #[error("Invalid execution context: {0}")]
    InvalidContext(u32),
}

// A convenient alias
pub type SurfaceResult<T> = Result<T, SurfaceError>;
