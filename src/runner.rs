pub mod command;
pub mod output;
pub mod terminator;

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("could not launch `{bin}`: {source}")]
    Launch { bin: String, source: io::Error },

    #[error("`{0}` not piped")]
    StreamPipe(&'static str),
}
