pub mod detection;
pub mod enhancement;
