use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "failed to encode value: {}", _0)]
    Encode(#[cause] bincode::Error),
    #[fail(display = "failed to decode value: {}", _0)]
    Decode(#[cause] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
