mod defaults;
mod load;
mod types;
mod validate;

pub use load::{load_config, load_config_with_sources};
pub use types::*;
