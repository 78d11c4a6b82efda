pub mod cli;
pub mod dns;
pub mod parser;
pub mod settings;

pub use settings::Settings;
