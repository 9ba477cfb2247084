use std::sync::mpsc::RecvError;

use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "failed to encode request: {}", _0)]
    Encode(#[cause] labcodec::Error),
    #[fail(display = "failed to decode reply: {}", _0)]
    Decode(#[cause] labcodec::Error),
    #[fail(display = "the reply channel was dropped before answering: {}", _0)]
    Recv(#[cause] RecvError),
    #[fail(display = "RPC timed out")]
    Timeout,
    #[fail(display = "the network has been shut down")]
    Stopped,
    #[fail(display = "no handler registered for {}", _0)]
    Unimplemented(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Encode(_), Error::Encode(_)) => true,
            (Error::Decode(_), Error::Decode(_)) => true,
            (Error::Recv(a), Error::Recv(b)) => a == b,
            (Error::Timeout, Error::Timeout) => true,
            (Error::Stopped, Error::Stopped) => true,
            (Error::Unimplemented(a), Error::Unimplemented(b)) => a == b,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
