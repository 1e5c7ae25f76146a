pub mod astm;
pub mod error;
pub mod hl7;

pub use error::{ProtocolError, Result};
