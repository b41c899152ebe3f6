//! Core types shared by all layers

mod address;
mod proxy;
mod stream;

pub use address::Address;
pub use proxy::{ProxyEndpoint, ProxyScheme};
pub use stream::{AsyncReadWrite, IntoStream, Stream};

pub use crate::error::{Error, Result};
