use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("packet too short: len is {len} but at least {required} is required")]
    PacketTooShort { len: usize, required: usize },
    #[error("timed out")]
    Timeout,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
