use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "rpc failed: {}", _0)]
    Rpc(#[cause] labrpc::Error),
    #[fail(display = "wrong shard")]
    WrongShard,
}

impl From<labrpc::Error> for Error {
    fn from(e: labrpc::Error) -> Error {
        Error::Rpc(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
