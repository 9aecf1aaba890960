pub mod codec;
pub mod config;
pub mod events;
pub mod records;

pub use codec::*;
pub use config::*;
pub use events::*;
pub use records::*;
