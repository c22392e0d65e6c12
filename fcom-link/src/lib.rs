//! Static linker and relinker for ForwardCom object files.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod error;
mod linker;
mod relink;

pub use error::LinkError;
pub use linker::{link, LinkInput, LinkOptions, Linked};
pub use relink::{relink, split_modules, RelinkCommands};
