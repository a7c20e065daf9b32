pub mod twiml;

pub use twiml::*;
