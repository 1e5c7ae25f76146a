//! ASTM E1381 link layer and E1394-97 record grammar for the Sysmex XP
//! family.

pub mod constants;
pub mod frame;
pub mod link;
pub mod record;

pub use frame::Frame;
pub use link::{AstmLink, IdleEvent, LinkEvent};
pub use record::{split_message, strip_frame_prefix, Record, RecordType};
