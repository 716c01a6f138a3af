use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("session error: {0}")]
    Session(#[from] apf_session::SessionError),

    #[error("MEI error: {0}")]
    Mei(#[from] mei::MeiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ME disconnected")]
    MeDisconnect,

    #[error("client address is not IPv4: {0}")]
    NotIpv4(SocketAddr),
}

pub type Result<T> = std::result::Result<T, Error>;
