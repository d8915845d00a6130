pub mod types;
pub mod settings;
pub mod validator;

pub use types::*;
pub use settings::*;
pub use validator::*;
