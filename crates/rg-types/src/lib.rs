pub mod errors;
pub mod limits;
pub mod signal;
pub mod violation;

pub use errors::*;
pub use limits::*;
pub use signal::*;
pub use violation::*;
