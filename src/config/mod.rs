pub mod devices;
pub mod io;
pub mod types;
