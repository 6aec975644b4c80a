use crate::{config, network};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network conn error: {0}")]
    Network(#[from] network::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
