use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Resource temporarily unavailable")]
    TryAgain,

    #[error("Operation timed out")]
    TimedOut,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Runlist does not fit in {0} entries")]
    TooBig(u32),

    #[error("Bad address: {0}")]
    BadAddress(String),

    #[error("Device busy")]
    Busy,

    #[error("No such device: {0}")]
    NoDevice(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Invalid channel ID: {0}")]
    InvalidChannelId(u32),
}

impl GpuError {
    /// The negative errno a syscall boundary would report for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfMemory => libc::ENOMEM,
            Self::TryAgain => libc::EAGAIN,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InvalidArgument(_) | Self::InvalidChannelId(_) => libc::EINVAL,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::TooBig(_) => libc::E2BIG,
            Self::BadAddress(_) => libc::EFAULT,
            Self::Busy => libc::EBUSY,
            Self::NoDevice(_) => libc::ENODEV,
            Self::Unsupported(_) => libc::ENOSYS,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn fault(msg: impl Into<String>) -> Self {
        Self::BadAddress(msg.into())
    }
}

// A convenient alias
pub type GpuResult<T> = Result<T, GpuError>;
