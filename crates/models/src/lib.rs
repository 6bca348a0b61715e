mod id;
mod status;

pub use id::{Id, IdGenerator};
pub use status::{OutputType, Priority, RecordStatus, RecordType, ANY_TAG};
