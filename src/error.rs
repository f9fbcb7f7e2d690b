//! Crate-wide error type
//!
//! Only setup and client-facing calls return these. Failures on the
//! scheduler, dispatcher and completion threads are reported as
//! [`Event`](crate::events::Event)s instead.

use std::io;

use crate::capture::image::{PixelFormat, Size};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sensor is stopped: call capture() or stream() before requesting frames")]
    SensorStopped,

    #[error("camera HAL failed to open")]
    HalOpen,

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid image geometry {size:?} for {format:?}")]
    InvalidGeometry { size: Size, format: PixelFormat },

    #[error("mapped region of {len} bytes at offset {offset} exceeds file length {file_len}")]
    MapOutOfRange {
        offset: u64,
        len: usize,
        file_len: u64,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
