// src/dispatch/mod.rs
mod dispatcher;
mod multipart;
mod request;
mod transport;

pub use dispatcher::{DispatchError, Dispatcher};
pub use multipart::MultipartForm;
pub use request::OutboundRequest;
pub use transport::{TransportCache, TransportError, TransportHandle, TransportSettings};
