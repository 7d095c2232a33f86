//! Data models shared by the store, service and CLI layers

mod attribution;
mod response;

pub use attribution::*;
pub use response::*;
