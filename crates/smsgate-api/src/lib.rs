pub mod response;
pub mod types;
pub mod validation;

pub use response::*;
pub use types::*;
pub use validation::*;
