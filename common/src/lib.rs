pub mod proto;
pub mod time;

pub use proto::*;
pub use time::*;
