mod data_shuffle;
pub mod logging;
mod token_size;

pub use data_shuffle::Shuffle;
pub use logging::{append_log_line, logging, LogOutput, LoggingBuilder};
pub use token_size::{TokenSize, TokenSizeError};
