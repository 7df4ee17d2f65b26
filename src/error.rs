use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not a VDB file")]
    NotAVdbFile,

    #[error("cannot create grid of unregistered type \"{0}\"")]
    UnregisteredGridType(String),

    #[error("grid type \"{0}\" is already registered")]
    TypeAlreadyRegistered(String),

    #[error("missing instance parent \"{parent}\" for grid {grid}")]
    MissingInstanceParent { parent: String, grid: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to map file {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
