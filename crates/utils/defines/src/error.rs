use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", stringify!($desc)),)*
                    _ => "Unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        UNSUPPORTED, -1024, "Do not support",
        BREAK,       -1023, "Thread should exit",

        EPERM,          -1,     "Operation not permitted.",
        ESRCH,          -3,     "No such process.",
        EINTR,          -4,     "Interrupted system call.",
        EAGAIN,         -11,    "Try again.",
        ENOMEM,         -12,    "Out of memory",
        EFAULT,         -14,    "Bad address.",
        EBUSY,          -16,    "Device or resource busy.",
        EINVAL,         -22,    "Invalid argument.",
        ERANGE,         -34,    "Exceed range.",
        EDEADLK,        -35,    "Resource deadlock would occur.",
        ENAMETOOLONG,   -36,    "Name too long",
        EOVERFLOW,      -75,    "Value too large for defined data type.",
    );
}
