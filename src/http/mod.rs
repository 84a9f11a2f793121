//! HTTP plumbing shared by the router, the functions adapter and the servers.

mod body;
pub mod headers;
mod request;
mod response;

pub use body::{buffer_body, empty, full, incoming, Body, BoxError, BufferError};
pub use request::DevRequest;
pub use response::DevResponse;
