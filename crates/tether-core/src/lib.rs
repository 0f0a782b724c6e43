#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod call;
mod capability;
mod channel;
mod command;
mod domain;
mod error;
mod export;
mod frame;
mod lane;
mod marshal;
mod object;
mod options;
mod pipe;
mod transport;

pub use call::*;
pub use capability::*;
pub use channel::*;
pub use command::*;
pub use domain::*;
pub use error::*;
pub use export::*;
pub use frame::*;
pub use lane::*;
pub use marshal::*;
pub use object::*;
pub use options::*;
pub use pipe::*;
pub use transport::*;
