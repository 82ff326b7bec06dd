//! Protocol side of a simulated charge point: message frames, the request
//! engine correlating calls with their responses, and the station runtime
//! driving it.

mod error;
mod frame;
mod messages;
mod pending;
mod request_service;
mod station;
mod transport;

pub use crate::error::*;
pub use crate::frame::*;
pub use crate::messages::*;
pub use crate::pending::*;
pub use crate::request_service::*;
pub use crate::station::*;
pub use crate::transport::*;
