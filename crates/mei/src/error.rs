use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeiError {
    #[error("failed to open MEI device {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("MEI client connect ioctl failed for {guid}: {errno}")]
    Connect {
        guid: String,
        errno: nix::errno::Errno,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write to MEI device: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },

    #[error("frame of {len} bytes exceeds negotiated maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}
