pub mod error;
pub mod fakes;
pub mod traits;
pub mod trust;
pub mod types;

pub use error::*;
pub use traits::*;
pub use trust::*;
pub use types::*;
