use std::io;

use libc;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid argument: {}", what)]
    InvalidArg { what: String },
    #[fail(display = "{} {} not found", what, id)]
    NotFound { what: &'static str, id: u32 },
    #[fail(display = "{} not supported", what)]
    NotSupported { what: &'static str },
    #[fail(display = "io error: {}", inner)]
    Io { inner: io::Error },
    #[fail(display = "out of memory: {}", what)]
    NoMem { what: String },
    #[fail(display = "protocol error: {}", what)]
    Protocol { what: String },
}

impl Error {
    pub fn invalid_arg<S: Into<String>>(what: S) -> Error {
        Error::InvalidArg { what: what.into() }
    }

    pub fn io_str(what: &str) -> Error {
        Error::Io {
            inner: io::Error::new(io::ErrorKind::Other, what.to_owned()),
        }
    }

    /// The errno this error maps to on the wire, negated the way `done`
    /// replies carry it.
    pub fn errno_code(&self) -> i32 {
        let e = match *self {
            Error::InvalidArg { .. } => libc::EINVAL,
            Error::NotFound { .. } => libc::ENOENT,
            Error::NotSupported { .. } => libc::ENOTSUP,
            Error::Io { .. } => libc::EIO,
            Error::NoMem { .. } => libc::ENOMEM,
            Error::Protocol { .. } => libc::EPROTO,
        };
        -e
    }
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

/// Collapse a handler result into the signed code echoed in `done`.
pub fn result_code(res: &Result<()>) -> i32 {
    match *res {
        Ok(()) => 0,
        Err(ref e) => e.errno_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_codes_are_negative() {
        assert_eq!(Error::invalid_arg("port").errno_code(), -libc::EINVAL);
        assert_eq!(
            Error::NotFound { what: "mem", id: 9 }.errno_code(),
            -libc::ENOENT
        );
        assert_eq!(
            Error::NotSupported { what: "add_port" }.errno_code(),
            -libc::ENOTSUP
        );
        assert_eq!(result_code(&Ok(())), 0);
        assert_eq!(
            result_code(&Err(Error::NoMem {
                what: "mmap".into()
            })),
            -libc::ENOMEM
        );
    }
}
