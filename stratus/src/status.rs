use std::fmt;

/// Result code returned by the client operations and by action callbacks.
///
/// Every code has a stable human-readable string, see [`Status::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully.
    Success = 0,
    /// Action successfully invoked (fire and forget).
    Invoked = 1,
    /// Invalid parameter passed.
    BadParameter = 2,
    /// Bad request received.
    BadRequest = 3,
    /// Error while executing the requested action.
    ExecutionError = 4,
    /// Already exists.
    Exists = 5,
    /// File open failed.
    FileOpenFailed = 6,
    /// Storage is full.
    Full = 7,
    /// Input/output error.
    IoError = 8,
    /// Out of memory.
    NoMemory = 9,
    /// No permission.
    NoPermission = 10,
    /// Not executable.
    NotExecutable = 11,
    /// Not found.
    NotFound = 12,
    /// Not initialized.
    NotInitialized = 13,
    /// Parameter out of range.
    OutOfRange = 14,
    /// Failed to parse a message.
    ParseError = 15,
    /// Timed out.
    TimedOut = 16,
    /// Try again.
    TryAgain = 17,
    /// Not supported in this version of the API.
    NotSupported = 18,
    /// General failure.
    Failure = 19,
}

impl Status {
    /// All status codes, in taxonomy order.
    pub const ALL: [Status; 20] = [
        Status::Success,
        Status::Invoked,
        Status::BadParameter,
        Status::BadRequest,
        Status::ExecutionError,
        Status::Exists,
        Status::FileOpenFailed,
        Status::Full,
        Status::IoError,
        Status::NoMemory,
        Status::NoPermission,
        Status::NotExecutable,
        Status::NotFound,
        Status::NotInitialized,
        Status::OutOfRange,
        Status::ParseError,
        Status::TimedOut,
        Status::TryAgain,
        Status::NotSupported,
        Status::Failure,
    ];

    /// A stable, human-readable description of the code. Total over the enum.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Invoked => "Invoked",
            Status::BadParameter => "Bad Parameter",
            Status::BadRequest => "Bad Request",
            Status::ExecutionError => "Execution Error",
            Status::Exists => "Already Exists",
            Status::FileOpenFailed => "File Open Failed",
            Status::Full => "Full",
            Status::IoError => "I/O Error",
            Status::NoMemory => "Out of Memory",
            Status::NoPermission => "No Permission",
            Status::NotExecutable => "Not Executable",
            Status::NotFound => "Not Found",
            Status::NotInitialized => "Not Initialized",
            Status::OutOfRange => "Out of Range",
            Status::ParseError => "Parsing Error",
            Status::TimedOut => "Timed Out",
            Status::TryAgain => "Try Again",
            Status::NotSupported => "Not Supported",
            Status::Failure => "Failure",
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
